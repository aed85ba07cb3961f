//! Durability collaborator seam.
//!
//! The queue appends an event per externally visible mutation and replays
//! recovered events at startup. The on-disk format lives behind this trait
//! and is someone else's problem; the in-tree implementations discard
//! (`NullJournal`) or buffer in memory (`MemoryJournal`, used by tests and
//! recovery tests).

use netsched_protocol::{JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal append failed: {0}")]
    Append(String),
    #[error("journal snapshot failed: {0}")]
    Snapshot(String),
    #[error("journal recovery failed: {0}")]
    Recover(String),
}

/// One durable mutation record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEvent {
    pub queue: String,
    pub job_id: JobId,
    pub op: JournalOp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Submit {
        input: Vec<u8>,
        affinity: Option<String>,
        group: Option<String>,
        mask: u32,
    },
    Transition {
        from: JobStatus,
        to: JobStatus,
        output: Option<Vec<u8>>,
    },
    Remove,
}

/// Opaque handle to a completed snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub queue: String,
    pub sequence: u64,
}

/// The durability service the queue engine writes through.
pub trait Journal: Send + Sync {
    fn append(&self, event: &JournalEvent) -> Result<(), JournalError>;
    fn snapshot(&self, queue: &str) -> Result<SnapshotHandle, JournalError>;
    fn recover(&self, queue: &str) -> Result<Vec<JournalEvent>, JournalError>;
}

/// Discards everything. The default for queues that opt out of durability.
#[derive(Debug, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn append(&self, _event: &JournalEvent) -> Result<(), JournalError> {
        Ok(())
    }

    fn snapshot(&self, queue: &str) -> Result<SnapshotHandle, JournalError> {
        Ok(SnapshotHandle {
            queue: queue.to_string(),
            sequence: 0,
        })
    }

    fn recover(&self, _queue: &str) -> Result<Vec<JournalEvent>, JournalError> {
        Ok(Vec::new())
    }
}

/// Vec-backed journal for tests and recovery exercises.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<JournalEvent>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JournalEvent> {
        self.events.lock().expect("journal lock poisoned").clone()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, event: &JournalEvent) -> Result<(), JournalError> {
        self.events
            .lock()
            .map_err(|_| JournalError::Append("journal lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }

    fn snapshot(&self, queue: &str) -> Result<SnapshotHandle, JournalError> {
        let sequence = self
            .events
            .lock()
            .map_err(|_| JournalError::Snapshot("journal lock poisoned".to_string()))?
            .len() as u64;
        Ok(SnapshotHandle {
            queue: queue.to_string(),
            sequence,
        })
    }

    fn recover(&self, queue: &str) -> Result<Vec<JournalEvent>, JournalError> {
        Ok(self
            .events
            .lock()
            .map_err(|_| JournalError::Recover("journal lock poisoned".to_string()))?
            .iter()
            .filter(|e| e.queue == queue)
            .cloned()
            .collect())
    }
}
