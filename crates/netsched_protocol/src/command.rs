//! Command grammar and request-line parser.
//!
//! Each request is a single line: `COMMAND [arg=value ...]`. Values may be
//! double-quoted with C-style escapes; unquoted values run to the next
//! whitespace. Argument names are case-sensitive, command verbs are not.
//!
//! Flag constraints that must never reach the dispatcher are enforced here:
//! `exclusive_new_aff` together with `any_aff` is rejected, `prioritized_aff`
//! requires an explicit affinity list and excludes the preferred-set flag.

use crate::error::{ErrKind, NsError};
use crate::types::JobStatus;
use std::collections::HashMap;
use std::str::FromStr;

/// Dispatch behavior flags shared by GET and READ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchFlags {
    /// Use the client's preferred affinity set as a filter.
    pub use_preferred: bool,
    /// Accept a job with any affinity when nothing better matches.
    pub any_affinity: bool,
    /// Accept a job whose affinity no client currently prefers, and claim
    /// that affinity into the caller's preferred set.
    pub exclusive_new_affinity: bool,
    /// Treat the explicit affinity list as priority-ordered.
    pub prioritized_affinity: bool,
}

impl DispatchFlags {
    fn validate(&self, explicit_aff_count: usize) -> Result<(), NsError> {
        if self.exclusive_new_affinity && self.any_affinity {
            return Err(NsError::invalid_parameter(
                "exclusive_new_aff cannot be combined with any_aff",
            ));
        }
        if self.prioritized_affinity {
            if self.use_preferred {
                return Err(NsError::invalid_parameter(
                    "prioritized_aff cannot be combined with the preferred affinity flag",
                ));
            }
            if self.exclusive_new_affinity {
                return Err(NsError::invalid_parameter(
                    "prioritized_aff cannot be combined with exclusive_new_aff",
                ));
            }
            if explicit_aff_count == 0 {
                return Err(NsError::invalid_parameter(
                    "prioritized_aff requires an explicit affinity list",
                ));
            }
        }
        Ok(())
    }
}

/// One job spec inside a streaming batch submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJobSpec {
    pub input: Vec<u8>,
    pub affinity: Option<String>,
    pub mask: u32,
}

/// Selector for bulk cancel: exactly one of key/group/affinity/status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelSelector {
    Key(String),
    Group(String),
    Affinity(String),
    Status(Vec<JobStatus>),
}

/// A parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit {
        input: Vec<u8>,
        affinity: Option<String>,
        group: Option<String>,
        mask: u32,
        notif_port: u16,
        notif_timeout: u64,
    },
    /// BSUB: open a batch submit session.
    BatchSessionStart {
        group: Option<String>,
        notif_port: u16,
        notif_timeout: u64,
    },
    /// BTCH: announce `size` job lines to follow.
    BatchStart { size: usize },
    /// ENDB: commit the current batch.
    BatchCommit,
    /// ENDS: close the batch session.
    BatchSessionEnd,
    GetJob {
        versioned: bool,
        explicit_affinities: Vec<String>,
        groups: Vec<String>,
        flags: DispatchFlags,
        notif_port: u16,
        wait_timeout: u64,
    },
    CancelWaitGet,
    Put {
        versioned: bool,
        job_key: String,
        auth_token: Option<String>,
        return_code: i32,
        output: Vec<u8>,
    },
    Fail {
        versioned: bool,
        job_key: String,
        auth_token: Option<String>,
        err_msg: String,
        output: Vec<u8>,
        return_code: i32,
        no_retries: bool,
    },
    Return {
        versioned: bool,
        job_key: String,
        auth_token: Option<String>,
        blacklist: bool,
    },
    Reschedule {
        job_key: String,
        auth_token: String,
        affinity: Option<String>,
        group: Option<String>,
    },
    Redo { job_key: String },
    Cancel { selector: CancelSelector },
    Read {
        versioned: bool,
        explicit_affinities: Vec<String>,
        groups: Vec<String>,
        flags: DispatchFlags,
        notif_port: u16,
        wait_timeout: u64,
    },
    CancelWaitRead,
    ConfirmRead { job_key: String, auth_token: String },
    FailRead {
        job_key: String,
        auth_token: String,
        err_msg: String,
        no_retries: bool,
        blacklist: bool,
    },
    RollbackRead {
        job_key: String,
        auth_token: String,
        blacklist: bool,
    },
    Reread { job_key: String },
    DelayExpiration { job_key: String, timeout: u64 },
    DelayReadExpiration { job_key: String, timeout: u64 },
    Status { job_key: String, verbose: bool },
    SubmitterStatus { job_key: String, versioned: bool },
    WorkerStatus { job_key: String, versioned: bool },
    PutProgressMsg { job_key: String, progress_msg: String },
    GetProgressMsg { job_key: String },
    Listen {
        job_key: String,
        port: u16,
        timeout: u64,
    },
    ChangeAffinity {
        reader: bool,
        add: Vec<String>,
        del: Vec<String>,
    },
    SetAffinity { reader: bool, affinities: Vec<String> },
    Pause { pullback: bool },
    Resume,
    RefuseSubmits { mode: bool },
    ClearWorkerNode,
    CancelQueue,
    QueueCreate {
        qname: String,
        qclass: String,
        description: Option<String>,
    },
    QueueDelete { qname: String },
    SetClientData { data: String, version: Option<u32> },
    Version,
    Health,
    Quit,
}

// ============================================================================
// Tokenizer
// ============================================================================

/// Split an argument tail into `name -> value` pairs. Values may be quoted.
pub fn parse_kv_args(tail: &str) -> Result<HashMap<String, String>, NsError> {
    let mut args = HashMap::new();
    let mut rest = tail.trim_start();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| NsError::syntax(format!("Expected arg=value near '{}'", rest)))?;
        let name = rest[..eq].trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(NsError::syntax(format!("Malformed argument near '{}'", rest)));
        }
        rest = &rest[eq + 1..];

        let (value, remainder) = if let Some(stripped) = rest.strip_prefix('"') {
            take_quoted(stripped)?
        } else {
            let end = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            (rest[..end].to_string(), &rest[end..])
        };

        args.insert(name.to_string(), value);
        rest = remainder.trim_start();
    }

    Ok(args)
}

/// Consume a quoted value (the opening quote already stripped), processing
/// C-style escapes. Returns the value and the unconsumed remainder.
fn take_quoted(input: &str) -> Result<(String, &str), NsError> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, &input[idx + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return Err(NsError::syntax("Unterminated escape in quoted value")),
            },
            other => value.push(other),
        }
    }
    Err(NsError::syntax("Unterminated quoted value"))
}

// ============================================================================
// Argument extraction helpers
// ============================================================================

struct Args(HashMap<String, String>);

impl Args {
    fn take(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    fn require(&mut self, name: &str) -> Result<String, NsError> {
        self.take(name)
            .ok_or_else(|| NsError::syntax(format!("Required argument '{}' is missing", name)))
    }

    fn flag(&mut self, name: &str) -> Result<bool, NsError> {
        match self.take(name) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "1" | "true" => Ok(true),
                "0" | "false" | "" => Ok(false),
                _ => Err(NsError::syntax(format!(
                    "Argument '{}' expects 0 or 1, got '{}'",
                    name, v
                ))),
            },
        }
    }

    fn number<T: FromStr>(&mut self, name: &str, default: T) -> Result<T, NsError> {
        match self.take(name) {
            None => Ok(default),
            Some(v) => v.parse::<T>().map_err(|_| {
                NsError::syntax(format!("Argument '{}' carries a malformed number: '{}'", name, v))
            }),
        }
    }

    fn require_number<T: FromStr>(&mut self, name: &str) -> Result<T, NsError> {
        let v = self.require(name)?;
        v.parse::<T>().map_err(|_| {
            NsError::syntax(format!("Argument '{}' carries a malformed number: '{}'", name, v))
        })
    }

    /// Comma/tab separated token list; empty string yields an empty list.
    fn list(&mut self, name: &str) -> Vec<String> {
        self.take(name)
            .map(|v| {
                v.split(|c| c == ',' || c == '\t')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// ============================================================================
// Parser
// ============================================================================

impl Command {
    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Command, NsError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            return Err(NsError::syntax("Empty command line"));
        }

        let (verb, tail) = match trimmed.find(char::is_whitespace) {
            Some(pos) => (&trimmed[..pos], &trimmed[pos..]),
            None => (trimmed, ""),
        };
        let verb = verb.to_ascii_uppercase();
        let mut args = Args(parse_kv_args(tail)?);

        let cmd = match verb.as_str() {
            "SUBMIT" => Command::Submit {
                input: args.require("input")?.into_bytes(),
                affinity: non_empty(args.take("aff")),
                group: non_empty(args.take("group")),
                mask: args.number("msk", 0)?,
                notif_port: args.number("port", 0)?,
                notif_timeout: args.number("timeout", 0)?,
            },
            "BSUB" => Command::BatchSessionStart {
                group: non_empty(args.take("group")),
                notif_port: args.number("port", 0)?,
                notif_timeout: args.number("timeout", 0)?,
            },
            "BTCH" => Command::BatchStart {
                size: args.require_number("size")?,
            },
            "ENDB" => Command::BatchCommit,
            "ENDS" => Command::BatchSessionEnd,
            "GET" | "GET2" | "WGET" => {
                let versioned = verb == "GET2";
                let explicit = args.list("aff");
                let flags = DispatchFlags {
                    use_preferred: args.flag("wnode_aff")?,
                    any_affinity: args.flag("any_aff")?,
                    exclusive_new_affinity: args.flag("exclusive_new_aff")?,
                    prioritized_affinity: args.flag("prioritized_aff")?,
                };
                flags.validate(explicit.len())?;
                Command::GetJob {
                    versioned,
                    explicit_affinities: explicit,
                    groups: args.list("group"),
                    flags,
                    notif_port: args.number("port", 0)?,
                    wait_timeout: args.number("timeout", 0)?,
                }
            }
            "CWGET" => Command::CancelWaitGet,
            "PUT" | "PUT2" => {
                let versioned = verb == "PUT2";
                let auth_token = args.take("auth_token");
                if versioned && auth_token.is_none() {
                    return Err(NsError::syntax("PUT2 requires auth_token"));
                }
                Command::Put {
                    versioned,
                    job_key: args.require("job_key")?,
                    auth_token,
                    return_code: args.number("job_return_code", 0)?,
                    output: args.take("output").unwrap_or_default().into_bytes(),
                }
            }
            "FPUT" | "FPUT2" => {
                let versioned = verb == "FPUT2";
                let auth_token = args.take("auth_token");
                if versioned && auth_token.is_none() {
                    return Err(NsError::syntax("FPUT2 requires auth_token"));
                }
                Command::Fail {
                    versioned,
                    job_key: args.require("job_key")?,
                    auth_token,
                    err_msg: args.take("err_msg").unwrap_or_default(),
                    output: args.take("output").unwrap_or_default().into_bytes(),
                    return_code: args.number("job_return_code", 0)?,
                    no_retries: args.flag("no_retries")?,
                }
            }
            "RETURN" | "RETURN2" => {
                let versioned = verb == "RETURN2";
                let auth_token = args.take("auth_token");
                if versioned && auth_token.is_none() {
                    return Err(NsError::syntax("RETURN2 requires auth_token"));
                }
                // RETURN blacklists by default; blacklist=0 opts out.
                let blacklist = match args.take("blacklist") {
                    None => true,
                    Some(v) => v != "0",
                };
                Command::Return {
                    versioned,
                    job_key: args.require("job_key")?,
                    auth_token,
                    blacklist,
                }
            }
            "RESCHEDULE" => Command::Reschedule {
                job_key: args.require("job_key")?,
                auth_token: args.require("auth_token")?,
                affinity: non_empty(args.take("aff")),
                group: non_empty(args.take("group")),
            },
            "REDO" => Command::Redo {
                job_key: args.require("job_key")?,
            },
            "CANCEL" => {
                let selector = if let Some(key) = non_empty(args.take("job_key")) {
                    CancelSelector::Key(key)
                } else if let Some(group) = non_empty(args.take("group")) {
                    CancelSelector::Group(group)
                } else if let Some(aff) = non_empty(args.take("aff")) {
                    CancelSelector::Affinity(aff)
                } else if let Some(statuses) = non_empty(args.take("status")) {
                    let parsed = statuses
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| {
                            s.parse::<JobStatus>()
                                .map_err(|e| NsError::new(ErrKind::InvalidParameter, e))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    CancelSelector::Status(parsed)
                } else {
                    return Err(NsError::syntax(
                        "CANCEL requires job_key, group, aff, or status",
                    ));
                };
                Command::Cancel { selector }
            }
            "READ" | "READ2" => {
                let versioned = verb == "READ2";
                let explicit = args.list("aff");
                let flags = DispatchFlags {
                    use_preferred: args.flag("reader_aff")?,
                    any_affinity: args.flag("any_aff")?,
                    exclusive_new_affinity: args.flag("exclusive_new_aff")?,
                    prioritized_affinity: args.flag("prioritized_aff")?,
                };
                flags.validate(explicit.len())?;
                Command::Read {
                    versioned,
                    explicit_affinities: explicit,
                    groups: args.list("group"),
                    flags,
                    notif_port: args.number("port", 0)?,
                    wait_timeout: args.number("timeout", 0)?,
                }
            }
            "CWREAD" => Command::CancelWaitRead,
            "CFRM" => Command::ConfirmRead {
                job_key: args.require("job_key")?,
                auth_token: args.require("auth_token")?,
            },
            "FRED" => Command::FailRead {
                job_key: args.require("job_key")?,
                auth_token: args.require("auth_token")?,
                err_msg: args.take("err_msg").unwrap_or_default(),
                no_retries: args.flag("no_retries")?,
                blacklist: args.take("blacklist").map(|v| v != "0").unwrap_or(true),
            },
            "RDRB" => Command::RollbackRead {
                job_key: args.require("job_key")?,
                auth_token: args.require("auth_token")?,
                blacklist: args.take("blacklist").map(|v| v != "0").unwrap_or(true),
            },
            "REREAD" => Command::Reread {
                job_key: args.require("job_key")?,
            },
            "JDEX" => Command::DelayExpiration {
                job_key: args.require("job_key")?,
                timeout: args.require_number("timeout")?,
            },
            "JDREX" => Command::DelayReadExpiration {
                job_key: args.require("job_key")?,
                timeout: args.require_number("timeout")?,
            },
            "STATUS" | "STATUS2" => Command::Status {
                job_key: args.require("job_key")?,
                verbose: verb == "STATUS2",
            },
            "SST" | "SST2" => Command::SubmitterStatus {
                job_key: args.require("job_key")?,
                versioned: verb == "SST2",
            },
            "WST" | "WST2" => Command::WorkerStatus {
                job_key: args.require("job_key")?,
                versioned: verb == "WST2",
            },
            "MPUT" => Command::PutProgressMsg {
                job_key: args.require("job_key")?,
                progress_msg: args.require("progress_msg")?,
            },
            "MGET" => Command::GetProgressMsg {
                job_key: args.require("job_key")?,
            },
            "LISTEN" => Command::Listen {
                job_key: args.require("job_key")?,
                port: args.require_number("port")?,
                timeout: args.require_number("timeout")?,
            },
            "CHAFF" => Command::ChangeAffinity {
                reader: false,
                add: args.list("add"),
                del: args.list("del"),
            },
            "CHRAFF" => Command::ChangeAffinity {
                reader: true,
                add: args.list("add"),
                del: args.list("del"),
            },
            "SETAFF" => Command::SetAffinity {
                reader: false,
                affinities: args.list("aff"),
            },
            "SETRAFF" => Command::SetAffinity {
                reader: true,
                affinities: args.list("aff"),
            },
            "QPAUSE" => Command::Pause {
                pullback: args.flag("pullback")?,
            },
            "QRESUME" => Command::Resume,
            "REFUSESUBMITS" => Command::RefuseSubmits {
                mode: match args.require("mode")?.as_str() {
                    "1" | "on" | "true" => true,
                    "0" | "off" | "false" => false,
                    other => {
                        return Err(NsError::syntax(format!(
                            "REFUSESUBMITS mode expects 0 or 1, got '{}'",
                            other
                        )))
                    }
                },
            },
            "CLRN" => Command::ClearWorkerNode,
            "DROPQ" | "CANCELQ" => Command::CancelQueue,
            "QCRE" => Command::QueueCreate {
                qname: args.require("qname")?,
                qclass: args.require("qclass")?,
                description: non_empty(args.take("description")),
            },
            "QDEL" => Command::QueueDelete {
                qname: args.require("qname")?,
            },
            "SETCLIENTDATA" => Command::SetClientData {
                data: args.require("data")?,
                version: match args.take("version") {
                    None => None,
                    Some(v) => Some(v.parse::<u32>().map_err(|_| {
                        NsError::syntax(format!("Malformed client data version: '{}'", v))
                    })?),
                },
            },
            "VERSION" => Command::Version,
            "HEALTH" => Command::Health,
            "QUIT" => Command::Quit,
            _ => {
                return Err(NsError::syntax(format!("Unknown command: '{}'", verb)));
            }
        };

        Ok(cmd)
    }

    /// Parse one job line inside a BTCH frame: `input=... [aff=...] [msk=...]`.
    pub fn parse_batch_job_line(line: &str) -> Result<BatchJobSpec, NsError> {
        let mut args = Args(parse_kv_args(line.trim_end_matches(['\r', '\n']))?);
        Ok(BatchJobSpec {
            input: args.require("input")?.into_bytes(),
            affinity: non_empty(args.take("aff")),
            mask: args.number("msk", 0)?,
        })
    }
}
