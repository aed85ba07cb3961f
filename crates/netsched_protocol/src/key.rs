//! Job key format: `<prefix>_<id>_<port>_<host>`.
//!
//! Keys are produced by the queue on SUBMIT/GET and parsed back on every
//! per-job command. The prefix identifies the server instance; a key whose
//! prefix, port, or host names a different server is rejected with a routing
//! error before any queue state is consulted.

use crate::types::JobId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default key prefix for this server family.
pub const KEY_PREFIX: &str = "NSID";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("job key '{0}' is malformed")]
    Malformed(String),
    #[error("job key '{0}' carries an invalid job id")]
    BadId(String),
    #[error("job key '{0}' carries an invalid port")]
    BadPort(String),
}

/// A parsed job key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub prefix: String,
    pub id: JobId,
    pub port: u16,
    pub host: String,
}

impl JobKey {
    pub fn new(id: JobId, port: u16, host: impl Into<String>) -> Self {
        Self {
            prefix: KEY_PREFIX.to_string(),
            id,
            port,
            host: host.into(),
        }
    }

    /// True when the key names this server instance.
    pub fn routes_to(&self, port: u16, host: &str) -> bool {
        self.prefix == KEY_PREFIX && self.port == port && self.host == host
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.prefix, self.id, self.port, self.host)
    }
}

impl FromStr for JobKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The host part may itself contain underscores, so split off the
        // three leading fields and keep the remainder verbatim.
        let mut parts = s.splitn(4, '_');
        let prefix = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| KeyParseError::Malformed(s.to_string()))?;
        let id_part = parts
            .next()
            .ok_or_else(|| KeyParseError::Malformed(s.to_string()))?;
        let port_part = parts
            .next()
            .ok_or_else(|| KeyParseError::Malformed(s.to_string()))?;
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| KeyParseError::Malformed(s.to_string()))?;

        let id = id_part
            .parse::<u32>()
            .map_err(|_| KeyParseError::BadId(s.to_string()))?;
        if id == 0 {
            return Err(KeyParseError::BadId(s.to_string()));
        }
        let port = port_part
            .parse::<u16>()
            .map_err(|_| KeyParseError::BadPort(s.to_string()))?;

        Ok(JobKey {
            prefix: prefix.to_string(),
            id: JobId::new(id),
            port,
            host: host.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        let key = JobKey::new(JobId::new(17), 9101, "10.1.2.3");
        let printed = key.to_string();
        assert_eq!(printed, "NSID_17_9101_10.1.2.3");
        assert_eq!(printed.parse::<JobKey>().unwrap(), key);
    }

    #[test]
    fn test_key_with_underscored_host() {
        let key = "NSID_5_9101_host_a.example".parse::<JobKey>().unwrap();
        assert_eq!(key.id, JobId::new(5));
        assert_eq!(key.host, "host_a.example");
    }

    #[test]
    fn test_key_rejects_garbage() {
        assert!("".parse::<JobKey>().is_err());
        assert!("NSID_x_9101_h".parse::<JobKey>().is_err());
        assert!("NSID_0_9101_h".parse::<JobKey>().is_err());
        assert!("NSID_1_notaport_h".parse::<JobKey>().is_err());
        assert!("NSID_1_9101_".parse::<JobKey>().is_err());
    }

    #[test]
    fn test_routing_check() {
        let key = JobKey::new(JobId::new(2), 9101, "10.0.0.1");
        assert!(key.routes_to(9101, "10.0.0.1"));
        assert!(!key.routes_to(9102, "10.0.0.1"));
        assert!(!key.routes_to(9101, "10.0.0.2"));
    }
}
