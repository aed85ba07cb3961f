//! Timeline: ordered expiration events with lazy cancellation.

use chrono::{DateTime, Utc};
use netsched_protocol::{ConsumerRole, JobId};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// What expires when an entry comes due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Due {
    /// A worker claim ran past its run timeout.
    RunExpired(JobId),
    /// A reader claim ran past its read timeout.
    ReadExpired(JobId),
    /// The job's overall lifetime lapsed.
    JobExpired(JobId),
    /// At least one LISTEN subscriber of the job lapsed.
    ListenerExpired(JobId),
    /// A parked waiter timed out.
    WaiterExpired { node: String, role: ConsumerRole },
}

/// One scheduled expiration. `generation` is the job's (or waiter's)
/// deadline generation at scheduling time; a popped entry whose generation
/// no longer matches is stale and must be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub deadline: DateTime<Utc>,
    pub generation: u64,
    pub due: Due,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of expiration events. Entries are never removed eagerly;
/// invalidation happens by bumping the owning record's generation and
/// discarding stale pops (lazy cancellation).
#[derive(Debug, Default)]
pub struct Timeline {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: DateTime<Utc>, generation: u64, due: Due) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            deadline,
            generation,
            due,
            seq: self.seq,
        }));
    }

    /// Pop every entry due at or before `now`, in non-decreasing deadline
    /// order. Generation validation is the caller's job: only it can see the
    /// owning record's current generation.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Entry> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            due.push(self.heap.pop().unwrap().0);
        }
        due
    }

    /// Deadline of the earliest scheduled entry, stale or not.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
