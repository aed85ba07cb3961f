//! Server and queue parameter bundles.
//!
//! The structures here are plain serde targets; the binary layers clap flags
//! over a TOML file to populate them. Queue classes are read-only parameter
//! templates dynamic queues are instantiated from.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameters of one queue. Reconfigurable per queue or through a class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueParams {
    /// Job lifetime since the last submitter touch, seconds.
    pub timeout: u64,
    /// Worker claim timeout, seconds.
    pub run_timeout: u64,
    /// Reader claim timeout, seconds.
    pub read_timeout: u64,
    /// Run attempts before the job is finally failed.
    pub failed_retries: u32,
    /// Read attempts before the job lands in ReadFailed.
    pub read_failed_retries: u32,
    /// Per-job worker blacklist duration after a failed run, seconds.
    pub blacklist_time: u64,
    /// Lifetime of an empty dynamic queue, seconds. 0 keeps it forever.
    pub empty_lifetime: u64,
    pub max_input_size: usize,
    pub max_output_size: usize,
    /// Grace period between mark-deleted and physical removal, seconds.
    pub deleted_grace: u64,
    /// Affinity/group registry capacity.
    pub max_tokens: usize,
    pub high_mark_percentage: u8,
    pub low_mark_percentage: u8,
    pub dirt_percentage: u8,
    /// Accept MPUT/MGET keys naming another queue and re-resolve them.
    pub allow_foreign_job_keys: bool,
    pub description: String,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            timeout: defaults::DEFAULT_JOB_TIMEOUT,
            run_timeout: defaults::DEFAULT_RUN_TIMEOUT,
            read_timeout: defaults::DEFAULT_READ_TIMEOUT,
            failed_retries: defaults::DEFAULT_FAILED_RETRIES,
            read_failed_retries: defaults::DEFAULT_FAILED_RETRIES,
            blacklist_time: defaults::DEFAULT_BLACKLIST_TIME,
            empty_lifetime: defaults::DEFAULT_EMPTY_LIFETIME,
            max_input_size: defaults::DEFAULT_MAX_INPUT_SIZE,
            max_output_size: defaults::DEFAULT_MAX_OUTPUT_SIZE,
            deleted_grace: defaults::DEFAULT_DELETED_GRACE,
            max_tokens: defaults::DEFAULT_MAX_TOKENS,
            high_mark_percentage: defaults::DEFAULT_HIGH_MARK_PERCENTAGE,
            low_mark_percentage: defaults::DEFAULT_LOW_MARK_PERCENTAGE,
            dirt_percentage: defaults::DEFAULT_DIRT_PERCENTAGE,
            allow_foreign_job_keys: true,
            description: String::new(),
        }
    }
}

/// Whole-server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerParams {
    /// TCP bind address for the command protocol.
    pub bind_addr: String,
    /// Stable node identifier reported in keys and notifications.
    pub node_id: String,
    /// Statically configured queues: name -> parameters.
    pub queues: HashMap<String, QueueParams>,
    /// Queue class templates: name -> parameters.
    pub classes: HashMap<String, QueueParams>,
    /// Refuse submits server-wide.
    pub refuse_submits: bool,
    /// Connection worker pool size.
    pub max_connections: usize,
    pub watch_interval_ms: u64,
    pub purge_interval_ms: u64,
    pub service_interval_ms: u64,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            bind_addr: defaults::DEFAULT_BIND_ADDR.to_string(),
            node_id: String::new(),
            queues: HashMap::new(),
            classes: HashMap::new(),
            refuse_submits: false,
            max_connections: 100,
            watch_interval_ms: defaults::DEFAULT_WATCH_INTERVAL_MS,
            purge_interval_ms: defaults::DEFAULT_PURGE_INTERVAL_MS,
            service_interval_ms: defaults::DEFAULT_SERVICE_INTERVAL_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_params_defaults() {
        let p = QueueParams::default();
        assert_eq!(p.run_timeout, defaults::DEFAULT_RUN_TIMEOUT);
        assert_eq!(p.failed_retries, defaults::DEFAULT_FAILED_RETRIES);
        assert!(p.allow_foreign_job_keys);
    }

    #[test]
    fn test_server_params_sparse_deserialization() {
        // Sparse documents must fill the rest from defaults.
        let doc = r#"{
            "bind_addr": "127.0.0.1:9101",
            "queues": { "q1": { "run_timeout": 5 } },
            "classes": { "fast": { "run_timeout": 1 } }
        }"#;
        let params: ServerParams = serde_json::from_str(doc).unwrap();
        assert_eq!(params.bind_addr, "127.0.0.1:9101");
        assert_eq!(params.queues["q1"].run_timeout, 5);
        assert_eq!(params.classes["fast"].run_timeout, 1);
        assert_eq!(
            params.queues["q1"].read_timeout,
            defaults::DEFAULT_READ_TIMEOUT
        );
        assert_eq!(params.max_connections, 100);
    }
}
