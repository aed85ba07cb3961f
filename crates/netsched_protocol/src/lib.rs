//! Wire surface for the NetSched job scheduling server.
//!
//! The protocol is line oriented: each request is a single
//! `COMMAND [arg=value ...]` line terminated by `\n`, each response starts
//! with `OK:` or `ERR:<kind>:` and is terminated by `\n`. Multi-line
//! responses are closed by an `OK:END` line. Out-of-band wakeups travel as
//! URL-encoded UDP datagrams.
//!
//! This crate holds everything both the server and its tests need to speak
//! the protocol: job statuses, job keys, the command grammar and parser,
//! response builders, the error taxonomy, notification payloads, and the
//! queue parameter bundles.

pub mod command;
pub mod config;
pub mod defaults;
pub mod error;
pub mod key;
pub mod notify;
pub mod response;
pub mod types;

// Re-export types for convenience
pub use command::{Command, DispatchFlags};
pub use config::{QueueParams, ServerParams};
pub use error::{ErrKind, NsError, WarnKind};
pub use key::JobKey;
pub use notify::NotifyPayload;
pub use response::{err_line, ok_empty, ok_fields, ok_warning};
pub use types::{ClientRoles, ConsumerRole, JobId, JobStatus, PauseStatus};

/// End-of-line terminator for every request and response.
pub const EOL: &str = "\n";

/// Closing line of a multi-line response.
pub const END_OF_MULTILINE: &str = "OK:END";
