//! Error taxonomy surfaced on the wire.
//!
//! Every client-visible failure maps to one of the `ErrKind` variants below
//! and is written back as `ERR:<kind>:<message>`. The string forms are
//! stable; new kinds may be appended at the tail only.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error kinds. The wire form is the `e`-prefixed variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrKind {
    JobNotFound,
    InvalidAuthToken,
    InvalidJobStatus,
    InvalidParameter,
    SubmitsDisabled,
    ShuttingDown,
    AccessDenied,
    UnknownQueue,
    PrefAffExpired,
    ProtocolSyntaxError,
    InternalError,
    TryAgain,
    GroupNotFound,
    AffinityNotFound,
    // Tail additions only below this line.
    IncorrectRouting,
}

impl ErrKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrKind::JobNotFound => "eJobNotFound",
            ErrKind::InvalidAuthToken => "eInvalidAuthToken",
            ErrKind::InvalidJobStatus => "eInvalidJobStatus",
            ErrKind::InvalidParameter => "eInvalidParameter",
            ErrKind::SubmitsDisabled => "eSubmitsDisabled",
            ErrKind::ShuttingDown => "eShuttingDown",
            ErrKind::AccessDenied => "eAccessDenied",
            ErrKind::UnknownQueue => "eUnknownQueue",
            ErrKind::PrefAffExpired => "ePrefAffExpired",
            ErrKind::ProtocolSyntaxError => "eProtocolSyntaxError",
            ErrKind::InternalError => "eInternalError",
            ErrKind::TryAgain => "eTryAgain",
            ErrKind::GroupNotFound => "eGroupNotFound",
            ErrKind::AffinityNotFound => "eAffinityNotFound",
            ErrKind::IncorrectRouting => "eIncorrectRouting",
        }
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Warning sub-kinds delivered with `OK:` responses, never replacing a
/// success: `OK:WARNING:<kind>:<message>;<payload>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarnKind {
    JobAlreadyCanceled,
    JobAlreadyDone,
    JobAlreadyFailed,
    JobAlreadyReturned,
    JobNotFound,
    JobNotRead,
    QueueAlreadyPaused,
    QueueNotPaused,
    NoParametersChanged,
    AffinityNotPreferred,
    SubmitsDisabledForServer,
}

impl WarnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarnKind::JobAlreadyCanceled => "eJobAlreadyCanceled",
            WarnKind::JobAlreadyDone => "eJobAlreadyDone",
            WarnKind::JobAlreadyFailed => "eJobAlreadyFailed",
            WarnKind::JobAlreadyReturned => "eJobAlreadyReturned",
            WarnKind::JobNotFound => "eJobNotFound",
            WarnKind::JobNotRead => "eJobNotRead",
            WarnKind::QueueAlreadyPaused => "eQueueAlreadyPaused",
            WarnKind::QueueNotPaused => "eQueueNotPaused",
            WarnKind::NoParametersChanged => "eNoParametersChanged",
            WarnKind::AffinityNotPreferred => "eAffinityNotPreferred",
            WarnKind::SubmitsDisabledForServer => "eSubmitsDisabledForServer",
        }
    }
}

impl fmt::Display for WarnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A client-visible failure: kind plus human-readable message.
///
/// Queue operations return these; the connection handler writes them out as
/// `ERR:` lines and keeps the connection open. No state changes accompany a
/// returned error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct NsError {
    pub kind: ErrKind,
    pub message: String,
}

impl NsError {
    pub fn new(kind: ErrKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn job_not_found() -> Self {
        Self::new(ErrKind::JobNotFound, "Job not found")
    }

    pub fn invalid_auth_token() -> Self {
        Self::new(ErrKind::InvalidAuthToken, "Authorization token does not match")
    }

    pub fn invalid_status(current: impl fmt::Display, op: &str) -> Self {
        Self::new(
            ErrKind::InvalidJobStatus,
            format!("Cannot {}; job is in {} state", op, current),
        )
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrKind::InvalidParameter, message)
    }

    pub fn submits_disabled() -> Self {
        Self::new(ErrKind::SubmitsDisabled, "Submits are disabled")
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrKind::AccessDenied, message)
    }

    pub fn unknown_queue(name: &str) -> Self {
        Self::new(ErrKind::UnknownQueue, format!("Queue '{}' is not found", name))
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrKind::ProtocolSyntaxError, message)
    }

    pub fn incorrect_routing(key: &str) -> Self {
        Self::new(
            ErrKind::IncorrectRouting,
            format!("Job key '{}' names a different server instance", key),
        )
    }

    /// Wire form: `ERR:<kind>:<message>`.
    pub fn to_wire(&self) -> String {
        format!("ERR:{}:{}", self.kind.as_str(), self.message)
    }
}
