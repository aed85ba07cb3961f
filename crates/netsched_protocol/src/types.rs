//! Canonical protocol types shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Job identifier
// ============================================================================

/// Canonical job identifier: queue-local, monotonically increasing, 32-bit.
///
/// Ids are never reused while the job record exists; 0 is reserved and never
/// designates a real job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct JobId(u32);

impl JobId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The reserved "no job" id.
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for JobId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<JobId> for u32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u32>()
            .map_err(|_| JobIdError::Parse(s.to_string()))?;
        Ok(JobId::new(value))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("invalid job id: {0}")]
    Parse(String),
}

// ============================================================================
// Job status
// ============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum JobStatus {
    /// Submitted, waiting for a worker
    #[default]
    Pending,
    /// Claimed by a worker, execution in progress
    Running,
    /// Canceled by a submitter or admin before reaching a terminal state
    Canceled,
    /// Execution failed and the retry budget is exhausted
    Failed,
    /// Execution finished, result available, waiting for a reader
    Done,
    /// Result claimed by a reader, confirmation pending
    Reading,
    /// Result confirmed by a reader
    Confirmed,
    /// Result reading failed and the read retry budget is exhausted
    ReadFailed,
    /// Marked deleted; record retained briefly for idempotent queries
    Deleted,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Canceled,
        JobStatus::Failed,
        JobStatus::Done,
        JobStatus::Reading,
        JobStatus::Confirmed,
        JobStatus::ReadFailed,
        JobStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Canceled => "Canceled",
            JobStatus::Failed => "Failed",
            JobStatus::Done => "Done",
            JobStatus::Reading => "Reading",
            JobStatus::Confirmed => "Confirmed",
            JobStatus::ReadFailed => "ReadFailed",
            JobStatus::Deleted => "Deleted",
        }
    }

    /// Numeric code used by the fast status commands (SST/WST).
    pub fn as_code(&self) -> i32 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Canceled => 3,
            JobStatus::Failed => 4,
            JobStatus::Done => 5,
            JobStatus::Reading => 6,
            JobStatus::Confirmed => 7,
            JobStatus::ReadFailed => 8,
            JobStatus::Deleted => -1,
        }
    }

    /// Terminal statuses are eligible for the purge scan.
    /// Done is not terminal: it awaits a reader.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Confirmed
                | JobStatus::Canceled
                | JobStatus::ReadFailed
                | JobStatus::Failed
                | JobStatus::Deleted
        )
    }

    /// Statuses a consumer currently holds a claim on.
    pub fn is_claimed(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Reading)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "canceled" | "cancelled" => Ok(JobStatus::Canceled),
            "failed" => Ok(JobStatus::Failed),
            "done" => Ok(JobStatus::Done),
            "reading" => Ok(JobStatus::Reading),
            "confirmed" => Ok(JobStatus::Confirmed),
            "readfailed" => Ok(JobStatus::ReadFailed),
            "deleted" => Ok(JobStatus::Deleted),
            _ => Err(format!("Unknown job status: '{}'", s)),
        }
    }
}

// ============================================================================
// Consumer role
// ============================================================================

/// The two job-consuming roles. Preferred affinities, blacklists, and parked
/// waiters are all tracked separately per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerRole {
    Worker,
    Reader,
}

impl ConsumerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerRole::Worker => "worker",
            ConsumerRole::Reader => "reader",
        }
    }
}

impl fmt::Display for ConsumerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Client roles
// ============================================================================

/// Set of roles a client has exercised over its session.
///
/// Roles are claimed implicitly by the commands a client issues: SUBMIT marks
/// the submitter bit, GET the worker bit, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientRoles(u8);

impl ClientRoles {
    pub const SUBMITTER: ClientRoles = ClientRoles(0x01);
    pub const WORKER: ClientRoles = ClientRoles(0x02);
    pub const READER: ClientRoles = ClientRoles(0x04);
    pub const ADMIN: ClientRoles = ClientRoles(0x08);
    pub const PROGRAM: ClientRoles = ClientRoles(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: ClientRoles) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ClientRoles) {
        self.0 |= other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ClientRoles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(ClientRoles::SUBMITTER) {
            names.push("submitter");
        }
        if self.contains(ClientRoles::WORKER) {
            names.push("worker");
        }
        if self.contains(ClientRoles::READER) {
            names.push("reader");
        }
        if self.contains(ClientRoles::ADMIN) {
            names.push("admin");
        }
        if self.contains(ClientRoles::PROGRAM) {
            names.push("program");
        }
        write!(f, "{}", names.join("|"))
    }
}

// ============================================================================
// Pause status
// ============================================================================

/// Queue pause mode. While paused, dispatch answers "no job" immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PauseStatus {
    #[default]
    NoPause,
    /// Paused; currently-running jobs are additionally pulled back to
    /// Pending at the next run-timeout check.
    PauseWithPullback,
    PauseWithoutPullback,
}

impl PauseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseStatus::NoPause => "nopause",
            PauseStatus::PauseWithPullback => "pullback",
            PauseStatus::PauseWithoutPullback => "nopullback",
        }
    }

    pub fn is_paused(&self) -> bool {
        !matches!(self, PauseStatus::NoPause)
    }
}

impl fmt::Display for PauseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<JobId>().unwrap(), id);
        assert!("abc".parse::<JobId>().is_err());
    }

    #[test]
    fn test_status_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), *status);
        }
        assert_eq!("cancelled".parse::<JobStatus>().unwrap(), JobStatus::Canceled);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Confirmed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::ReadFailed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Done.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_roles_bits() {
        let mut roles = ClientRoles::empty();
        assert!(roles.is_empty());
        roles.insert(ClientRoles::WORKER);
        roles.insert(ClientRoles::SUBMITTER);
        assert!(roles.contains(ClientRoles::WORKER));
        assert!(!roles.contains(ClientRoles::ADMIN));
        assert_eq!(roles.to_string(), "submitter|worker");
    }
}
