//! UDP notification payloads.
//!
//! Wakeups are fire-and-forget datagrams carrying one URL-encoded key-value
//! line. No acknowledgement; clients must re-issue the GET/READ to claim a
//! job, and must tolerate duplicated or spurious packets.

use crate::response::encode_fields;
use serde::{Deserialize, Serialize};

/// Why a datagram was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyReason {
    /// Work became available for a parked worker.
    Get,
    /// A result became available for a parked reader.
    Read,
    /// The queue was resumed; re-issue the request.
    QueueResumed,
}

impl NotifyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyReason::Get => "get",
            NotifyReason::Read => "read",
            NotifyReason::QueueResumed => "queue_resumed",
        }
    }
}

/// Datagram body for waiter/resume wakeups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    pub reason: NotifyReason,
    pub ns_node: String,
    pub queue: String,
}

impl NotifyPayload {
    pub fn new(reason: NotifyReason, ns_node: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            reason,
            ns_node: ns_node.into(),
            queue: queue.into(),
        }
    }

    pub fn to_wire(&self) -> String {
        encode_fields([
            ("reason", self.reason.as_str()),
            ("ns_node", &self.ns_node),
            ("queue", &self.queue),
        ])
    }
}

/// Datagram body for per-job state-change pushes (LISTEN subscribers and
/// submitter completion notifications).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStateNotice {
    pub job_key: String,
    pub job_status: String,
    pub last_event_index: usize,
    pub queue: String,
}

impl JobStateNotice {
    pub fn to_wire(&self) -> String {
        let idx = self.last_event_index.to_string();
        encode_fields([
            ("job_key", self.job_key.as_str()),
            ("job_status", self.job_status.as_str()),
            ("last_event_index", idx.as_str()),
            ("queue", self.queue.as_str()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_payload() {
        let p = NotifyPayload::new(NotifyReason::Get, "node1", "q1");
        assert_eq!(p.to_wire(), "reason=get&ns_node=node1&queue=q1");
    }

    #[test]
    fn test_job_state_notice() {
        let n = JobStateNotice {
            job_key: "NSID_7_9100_h".to_string(),
            job_status: "Done".to_string(),
            last_event_index: 2,
            queue: "q1".to_string(),
        };
        assert_eq!(
            n.to_wire(),
            "job_key=NSID_7_9100_h&job_status=Done&last_event_index=2&queue=q1"
        );
    }
}
