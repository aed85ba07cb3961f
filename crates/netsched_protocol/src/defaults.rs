//! Canonical default values shared across the server and tests.

/// TCP bind address for the command protocol.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9100";

/// Job lifetime since the last submitter touch, seconds.
pub const DEFAULT_JOB_TIMEOUT: u64 = 3600;

/// Run (worker claim) timeout, seconds.
pub const DEFAULT_RUN_TIMEOUT: u64 = 3600;

/// Read (reader claim) timeout, seconds.
pub const DEFAULT_READ_TIMEOUT: u64 = 600;

/// Run attempts before a job is finally failed.
pub const DEFAULT_FAILED_RETRIES: u32 = 3;

/// How long a failed worker stays blacklisted for a job, seconds.
pub const DEFAULT_BLACKLIST_TIME: u64 = 2147483647;

/// How long an empty dynamic queue survives, seconds.
pub const DEFAULT_EMPTY_LIFETIME: u64 = 0;

/// Input/output blob caps, bytes.
pub const DEFAULT_MAX_INPUT_SIZE: usize = 2048;
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 2048;

/// Grace period between mark-deleted and physical removal, seconds.
pub const DEFAULT_DELETED_GRACE: u64 = 600;

/// Affinity/group registry capacity and GC watermarks.
pub const DEFAULT_MAX_TOKENS: usize = 10000;
pub const DEFAULT_HIGH_MARK_PERCENTAGE: u8 = 90;
pub const DEFAULT_LOW_MARK_PERCENTAGE: u8 = 50;
pub const DEFAULT_DIRT_PERCENTAGE: u8 = 20;

/// Execution watcher tick, milliseconds.
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 100;

/// Purge scan interval, milliseconds, and per-scan batch cap.
pub const DEFAULT_PURGE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_PURGE_BATCH: usize = 100;

/// Service (counter snapshot) interval, milliseconds.
pub const DEFAULT_SERVICE_INTERVAL_MS: u64 = 10_000;

/// Version strings reported by the VERSION command.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const STORAGE_VERSION: &str = "1.0.0";
pub const PROTOCOL_VERSION: &str = "1.1.0";
