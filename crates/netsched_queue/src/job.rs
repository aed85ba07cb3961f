//! Job record and its append-only event log.

use crate::affinity::AffId;
use crate::group::GroupId;
use chrono::{DateTime, Utc};
use netsched_protocol::{JobId, JobStatus};
use serde::{Deserialize, Serialize};

/// What happened to a job. One entry is appended per externally triggered
/// transition; the log is never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    Submit,
    BatchSubmit,
    /// Dispatched to a worker.
    Request,
    Done,
    Return,
    Fail,
    FinalFail,
    Cancel,
    Timeout,
    ReadTimeout,
    /// Dispatched to a reader.
    Read,
    ReadDone,
    ReadFail,
    ReadFinalFail,
    ReadRollback,
    Reschedule,
    Redo,
    Reread,
    /// Session reset / worker node cleared while the job was claimed.
    Clear,
    /// Forced back to Pending by a pause with pullback.
    Pullback,
}

/// One entry of the per-job event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: JobEventKind,
    /// Status the job ended up in after this event.
    pub status: JobStatus,
    pub node: String,
    pub session: String,
    pub err_msg: Option<String>,
    pub ret_code: i32,
}

/// Submitter push-notification target: one datagram when the job reaches a
/// result-bearing state within the timeout window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitNotif {
    pub host: String,
    pub port: u16,
    pub deadline: DateTime<Utc>,
}

/// A LISTEN subscriber: receives a datagram per state change until its
/// deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobListener {
    pub host: String,
    pub port: u16,
    pub deadline: DateTime<Utc>,
}

/// The authoritative job record. Owned exclusively by the job store; all
/// mutation goes through the queue under its lock.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub affinity_id: AffId,
    pub group_id: GroupId,
    /// Submitter-declared flag bits, opaque to the server.
    pub mask: u32,
    pub subm_notif: Option<SubmitNotif>,
    pub listeners: Vec<JobListener>,
    /// Non-empty exactly while a consumer holds a claim (Running/Reading).
    pub auth_token: String,
    /// Node of the client currently holding the claim.
    pub claimed_by: Option<String>,
    pub events: Vec<JobEvent>,
    pub run_attempts: u32,
    pub read_attempts: u32,
    /// Overall lifetime deadline, refreshed on every transition and on SST.
    pub expiration: DateTime<Utc>,
    pub run_expiration: Option<DateTime<Utc>>,
    pub read_expiration: Option<DateTime<Utc>>,
    pub client_ip: String,
    pub client_sid: String,
    pub ncbi_phid: String,
    pub progress_msg: String,
    pub scope: String,
    pub return_code: i32,
    /// Bumped whenever previously scheduled deadlines become invalid;
    /// stale timeline entries are discarded on pop.
    pub generation: u64,
    /// Set when the record is marked deleted; physical removal happens
    /// after the grace period.
    pub marked_deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn record_event(
        &mut self,
        now: DateTime<Utc>,
        kind: JobEventKind,
        node: &str,
        session: &str,
        err_msg: Option<String>,
        ret_code: i32,
    ) {
        self.events.push(JobEvent {
            timestamp: now,
            kind,
            status: self.status,
            node: node.to_string(),
            session: session.to_string(),
            err_msg,
            ret_code,
        });
    }

    /// Index of the latest event, as exposed to listeners.
    pub fn last_event_index(&self) -> usize {
        self.events.len().saturating_sub(1)
    }

    /// Drop the consumer claim state (auth token, claimant, claim deadline).
    pub fn release_claim(&mut self) {
        self.auth_token.clear();
        self.claimed_by = None;
        self.run_expiration = None;
        self.read_expiration = None;
    }

    /// Bump the deadline generation, invalidating scheduled timeline events.
    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}
