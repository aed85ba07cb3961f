//! Per-connection command handling.
//!
//! A connection starts with a two-line handshake (identification line, then
//! the queue name) and then carries serialized request/response commands.
//! Each command acquires the queue lock inside the queue call and answers
//! immediately; parked waiters are woken later via UDP.

use crate::directory::QueueDirectory;
use chrono::{DateTime, Utc};
use netsched_protocol::command::{BatchJobSpec, CancelSelector, Command};
use netsched_protocol::{
    defaults, ok_empty, ok_fields, ok_warning, response, ClientRoles, ConsumerRole, ErrKind,
    JobKey, NsError,
};
use netsched_queue::queue::{ConsumeOutcome, OpOutcome};
use netsched_queue::{ClientId, ConsumeRequest, Queue, SubmitSpec};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Server-wide identity reported by VERSION/HEALTH.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub node_id: String,
    pub session_id: String,
    pub started: DateTime<Utc>,
}

/// What the connection loop should do with the handler's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write this line back.
    Respond(String),
    /// Consume silently (batch job lines).
    Continue,
    /// Write this line, then close the connection.
    RespondAndClose(String),
    /// Close without a response.
    Close,
}

/// Parse the identification line: a program token followed by
/// space-separated `key=value` pairs.
pub fn parse_handshake(line: &str) -> (String, HashMap<String, String>) {
    let mut program = Vec::new();
    let mut params = HashMap::new();
    for token in line.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => {
                params.insert(key.to_string(), value.trim_matches('"').to_string());
            }
            None => program.push(token),
        }
    }
    (program.join(" "), params)
}

struct BatchSession {
    group: Option<String>,
    notif_port: u16,
    notif_timeout: u64,
    collected: Vec<BatchJobSpec>,
    /// Job lines still expected before ENDB.
    expected: usize,
}

/// One connected client's command processor.
pub struct ConnectionHandler {
    directory: Arc<QueueDirectory>,
    identity: Arc<ServerIdentity>,
    client: ClientId,
    queue: Arc<Queue>,
    queue_name: String,
    batch: Option<BatchSession>,
}

impl ConnectionHandler {
    /// Complete the handshake against the directory. Errors (unknown
    /// queue) are returned as the wire line to send before closing.
    pub fn handshake(
        directory: Arc<QueueDirectory>,
        identity: Arc<ServerIdentity>,
        peer: &str,
        auth_line: &str,
        queue_line: &str,
    ) -> Result<Self, String> {
        let (program, params) = parse_handshake(auth_line);
        let node = params.get("client_node").cloned().unwrap_or_default();
        let session = params.get("client_session").cloned().unwrap_or_default();
        let client = ClientId::new(node, session, peer);

        let queue_name = queue_line.trim().to_string();
        let Some(queue) = directory.get(&queue_name) else {
            return Err(response::err_line(&NsError::unknown_queue(&queue_name)));
        };

        debug!(
            program = %program,
            node = %client.node,
            peer = %peer,
            queue = %queue_name,
            "Client connected"
        );
        Ok(Self {
            directory,
            identity,
            client,
            queue,
            queue_name,
            batch: None,
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Process one request line.
    pub fn handle_line(&mut self, line: &str) -> Action {
        // Inside a BTCH frame the lines are job specs, not commands.
        if let Some(batch) = self.batch.as_mut() {
            if batch.expected > 0 {
                return match Command::parse_batch_job_line(line) {
                    Ok(spec) => {
                        batch.collected.push(spec);
                        batch.expected -= 1;
                        Action::Continue
                    }
                    Err(e) => {
                        self.batch = None;
                        Action::Respond(response::err_line(&e))
                    }
                };
            }
        }

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => return Action::Respond(response::err_line(&e)),
        };

        if self.directory.shutting_down() && command != Command::Quit {
            return Action::RespondAndClose(response::err_line(&NsError::new(
                ErrKind::ShuttingDown,
                "NetSchedule server is shutting down",
            )));
        }

        let now = Utc::now();
        match self.dispatch(command, now) {
            Ok(action) => action,
            Err(e) => Action::Respond(response::err_line(&e)),
        }
    }

    fn touch(&self, roles: ClientRoles, now: DateTime<Utc>) {
        let outcome = self.queue.touch_client(&self.client, roles, now);
        if outcome.is_new {
            debug!(queue = %self.queue_name, node = %self.client.node, "New client registered");
        }
    }

    fn dispatch(&mut self, command: Command, now: DateTime<Utc>) -> Result<Action, NsError> {
        match command {
            // --------------------------------------------------------------
            // Submit side
            // --------------------------------------------------------------
            Command::Submit {
                input,
                affinity,
                group,
                mask,
                notif_port,
                notif_timeout,
            } => {
                self.touch(ClientRoles::SUBMITTER, now);
                self.check_server_submit_gate()?;
                let key = self.queue.submit(
                    &self.client,
                    SubmitSpec {
                        input,
                        affinity,
                        group,
                        mask,
                        notif_port,
                        notif_timeout,
                        client_ip: self.client.peer.clone(),
                        client_sid: self.client.session.clone(),
                        ncbi_phid: String::new(),
                    },
                    now,
                )?;
                Ok(Action::Respond(response::ok_payload(key.to_string())))
            }
            Command::BatchSessionStart {
                group,
                notif_port,
                notif_timeout,
            } => {
                self.touch(ClientRoles::SUBMITTER, now);
                self.check_server_submit_gate()?;
                self.batch = Some(BatchSession {
                    group,
                    notif_port,
                    notif_timeout,
                    collected: Vec::new(),
                    expected: 0,
                });
                Ok(Action::Respond(response::ok_payload("Batch submit ready")))
            }
            Command::BatchStart { size } => {
                let Some(batch) = self.batch.as_mut() else {
                    return Err(NsError::syntax("BTCH outside of a batch session"));
                };
                if size == 0 {
                    return Err(NsError::invalid_parameter("Batch size must be positive"));
                }
                batch.collected.clear();
                batch.expected = size;
                Ok(Action::Continue)
            }
            Command::BatchCommit => {
                let Some(batch) = self.batch.as_mut() else {
                    return Err(NsError::syntax("ENDB outside of a batch session"));
                };
                if batch.expected > 0 {
                    return Err(NsError::syntax("ENDB before all batch jobs were sent"));
                }
                let specs = std::mem::take(&mut batch.collected);
                let group = batch.group.clone();
                let port = batch.notif_port;
                let timeout = batch.notif_timeout;
                self.check_server_submit_gate()?;
                let (first, count) =
                    self.queue
                        .submit_batch(&self.client, specs, group, port, timeout, now)?;
                let first_key = self.queue.make_key(first);
                let count = count.to_string();
                Ok(Action::Respond(ok_fields([
                    ("job_key", first_key.to_string().as_str()),
                    ("count", count.as_str()),
                ])))
            }
            Command::BatchSessionEnd => {
                self.batch = None;
                Ok(Action::Respond(ok_empty()))
            }

            // --------------------------------------------------------------
            // Worker side
            // --------------------------------------------------------------
            Command::GetJob {
                versioned,
                explicit_affinities,
                groups,
                flags,
                notif_port,
                wait_timeout,
            } => {
                self.touch(ClientRoles::WORKER, now);
                let req = ConsumeRequest {
                    explicit_affinities,
                    groups,
                    flags,
                    notif_port,
                    wait_timeout,
                };
                let outcome = self.queue.get_job_or_wait(&self.client, &req, now)?;
                Ok(Action::Respond(self.render_dispatch(outcome, versioned)))
            }
            Command::CancelWaitGet => {
                self.touch(ClientRoles::WORKER, now);
                self.queue.cancel_wait_get(&self.client);
                Ok(Action::Respond(ok_empty()))
            }
            Command::Put {
                job_key,
                auth_token,
                return_code,
                output,
                ..
            } => {
                self.touch(ClientRoles::WORKER, now);
                let outcome = self.queue.put_result(
                    &self.client,
                    &job_key,
                    auth_token.as_deref(),
                    return_code,
                    output,
                    now,
                )?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::Fail {
                job_key,
                auth_token,
                err_msg,
                output,
                return_code,
                no_retries,
                ..
            } => {
                self.touch(ClientRoles::WORKER, now);
                let outcome = self.queue.put_failure(
                    &self.client,
                    &job_key,
                    auth_token.as_deref(),
                    &err_msg,
                    output,
                    return_code,
                    no_retries,
                    now,
                )?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::Return {
                job_key,
                auth_token,
                blacklist,
                ..
            } => {
                self.touch(ClientRoles::WORKER, now);
                let outcome = self.queue.return_job(
                    &self.client,
                    &job_key,
                    auth_token.as_deref(),
                    blacklist,
                    now,
                )?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::Reschedule {
                job_key,
                auth_token,
                affinity,
                group,
            } => {
                self.touch(ClientRoles::WORKER, now);
                let outcome = self.queue.reschedule(
                    &self.client,
                    &job_key,
                    &auth_token,
                    affinity.as_deref(),
                    group.as_deref(),
                    now,
                )?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::Redo { job_key } => {
                self.touch(ClientRoles::SUBMITTER, now);
                let outcome = self.queue.redo_job(&self.client, &job_key, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::DelayExpiration { job_key, timeout } => {
                self.touch(ClientRoles::WORKER, now);
                let outcome = self.queue.delay_expiration(&job_key, timeout, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::DelayReadExpiration { job_key, timeout } => {
                self.touch(ClientRoles::READER, now);
                let outcome = self.queue.delay_read_expiration(&job_key, timeout, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }

            // --------------------------------------------------------------
            // Cancellation
            // --------------------------------------------------------------
            Command::Cancel { selector } => {
                self.touch(ClientRoles::SUBMITTER, now);
                match selector {
                    CancelSelector::Key(key) => {
                        let outcome = self.queue.cancel_job(&self.client, &key, now)?;
                        Ok(Action::Respond(match outcome {
                            OpOutcome::Done => ok_empty(),
                            OpOutcome::Warned(kind, msg) => ok_warning(kind, &msg, "0"),
                        }))
                    }
                    CancelSelector::Group(group) => {
                        let count = self.queue.cancel_selection(
                            &self.client,
                            Some(&group),
                            None,
                            &[],
                            now,
                        )?;
                        Ok(Action::Respond(response::ok_payload(count.to_string())))
                    }
                    CancelSelector::Affinity(aff) => {
                        let count = self.queue.cancel_selection(
                            &self.client,
                            None,
                            Some(&aff),
                            &[],
                            now,
                        )?;
                        Ok(Action::Respond(response::ok_payload(count.to_string())))
                    }
                    CancelSelector::Status(statuses) => {
                        let count = self.queue.cancel_selection(
                            &self.client,
                            None,
                            None,
                            &statuses,
                            now,
                        )?;
                        Ok(Action::Respond(response::ok_payload(count.to_string())))
                    }
                }
            }
            Command::CancelQueue => {
                self.touch(ClientRoles::ADMIN, now);
                let count = self.queue.cancel_all_jobs(&self.client, now)?;
                Ok(Action::Respond(response::ok_payload(count.to_string())))
            }

            // --------------------------------------------------------------
            // Reader side
            // --------------------------------------------------------------
            Command::Read {
                versioned,
                explicit_affinities,
                groups,
                flags,
                notif_port,
                wait_timeout,
            } => {
                self.touch(ClientRoles::READER, now);
                let req = ConsumeRequest {
                    explicit_affinities,
                    groups,
                    flags,
                    notif_port,
                    wait_timeout,
                };
                let outcome = self
                    .queue
                    .get_job_for_reading_or_wait(&self.client, &req, now)?;
                Ok(Action::Respond(self.render_read_dispatch(outcome, versioned)))
            }
            Command::CancelWaitRead => {
                self.touch(ClientRoles::READER, now);
                self.queue.cancel_wait_read(&self.client);
                Ok(Action::Respond(ok_empty()))
            }
            Command::ConfirmRead { job_key, auth_token } => {
                self.touch(ClientRoles::READER, now);
                let outcome = self
                    .queue
                    .confirm_reading(&self.client, &job_key, &auth_token, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::FailRead {
                job_key,
                auth_token,
                err_msg,
                no_retries,
                blacklist,
            } => {
                self.touch(ClientRoles::READER, now);
                let outcome = self.queue.fail_reading(
                    &self.client,
                    &job_key,
                    &auth_token,
                    &err_msg,
                    no_retries,
                    blacklist,
                    now,
                )?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::RollbackRead {
                job_key,
                auth_token,
                blacklist,
            } => {
                self.touch(ClientRoles::READER, now);
                let outcome = self.queue.return_reading(
                    &self.client,
                    &job_key,
                    &auth_token,
                    blacklist,
                    now,
                )?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::Reread { job_key } => {
                self.touch(ClientRoles::READER, now);
                let outcome = self.queue.reread_job(&self.client, &job_key, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }

            // --------------------------------------------------------------
            // Status and progress
            // --------------------------------------------------------------
            Command::Status { job_key, verbose } => {
                let info = self.queue.job_info(&job_key, false, now)?;
                if verbose {
                    let exptime = info.expiration.timestamp().to_string();
                    let input = String::from_utf8_lossy(&info.input).into_owned();
                    let output = String::from_utf8_lossy(&info.output).into_owned();
                    let run_attempts = info.run_attempts.to_string();
                    let read_attempts = info.read_attempts.to_string();
                    Ok(Action::Respond(ok_fields([
                        ("job_status", info.status.as_str()),
                        ("job_exptime", exptime.as_str()),
                        ("input", input.as_str()),
                        ("output", output.as_str()),
                        ("affinity", info.affinity.as_str()),
                        ("group", info.group.as_str()),
                        ("run_counter", run_attempts.as_str()),
                        ("read_counter", read_attempts.as_str()),
                    ])))
                } else {
                    Ok(Action::Respond(ok_fields([(
                        "job_status",
                        info.status.as_str(),
                    )])))
                }
            }
            Command::SubmitterStatus { job_key, versioned } => {
                self.touch(ClientRoles::SUBMITTER, now);
                // SST restarts the submit timer; WST does not.
                let info = self.queue.job_info(&job_key, true, now)?;
                Ok(Action::Respond(render_fast_status(
                    info.status,
                    info.expiration,
                    versioned,
                )))
            }
            Command::WorkerStatus { job_key, versioned } => {
                self.touch(ClientRoles::WORKER, now);
                let info = self.queue.job_info(&job_key, false, now)?;
                Ok(Action::Respond(render_fast_status(
                    info.status,
                    info.expiration,
                    versioned,
                )))
            }
            Command::PutProgressMsg {
                job_key,
                progress_msg,
            } => {
                self.touch(ClientRoles::WORKER, now);
                let queue = self.queue_for_key(&job_key);
                queue.put_progress_msg(&job_key, &progress_msg)?;
                Ok(Action::Respond(ok_empty()))
            }
            Command::GetProgressMsg { job_key } => {
                let queue = self.queue_for_key(&job_key);
                let msg = queue.get_progress_msg(&job_key)?;
                Ok(Action::Respond(ok_fields([("progress_msg", msg.as_str())])))
            }
            Command::Listen {
                job_key,
                port,
                timeout,
            } => {
                self.touch(ClientRoles::SUBMITTER, now);
                let outcome = self
                    .queue
                    .set_listener(&self.client, &job_key, port, timeout, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }

            // --------------------------------------------------------------
            // Preferred affinities / client admin
            // --------------------------------------------------------------
            Command::ChangeAffinity { reader, add, del } => {
                let role = consumer_role(reader);
                self.touch(role_bits(role), now);
                let outcome = self
                    .queue
                    .change_affinity(&self.client, role, &add, &del, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::SetAffinity { reader, affinities } => {
                let role = consumer_role(reader);
                self.touch(role_bits(role), now);
                let outcome = self
                    .queue
                    .set_affinity(&self.client, role, &affinities, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::ClearWorkerNode => {
                self.touch(ClientRoles::WORKER, now);
                let outcome = self.queue.clear_worker_node(&self.client, now)?;
                Ok(Action::Respond(render_outcome(outcome)))
            }
            Command::SetClientData { data, version } => {
                self.touch(ClientRoles::empty(), now);
                let version = self
                    .queue
                    .set_client_data(&self.client, &data, version, now)?;
                let version = version.to_string();
                Ok(Action::Respond(ok_fields([("version", version.as_str())])))
            }

            // --------------------------------------------------------------
            // Queue control
            // --------------------------------------------------------------
            Command::Pause { pullback } => {
                self.touch(ClientRoles::ADMIN, now);
                Ok(Action::Respond(render_outcome(self.queue.pause(pullback))))
            }
            Command::Resume => {
                self.touch(ClientRoles::ADMIN, now);
                Ok(Action::Respond(render_outcome(self.queue.resume(now))))
            }
            Command::RefuseSubmits { mode } => {
                self.touch(ClientRoles::ADMIN, now);
                self.queue.set_refuse_submits(mode);
                Ok(Action::Respond(ok_empty()))
            }
            Command::QueueCreate {
                qname,
                qclass,
                description,
            } => {
                self.directory
                    .create_dynamic(&qname, &qclass, description.as_deref())?;
                Ok(Action::Respond(ok_empty()))
            }
            Command::QueueDelete { qname } => {
                self.directory.delete_dynamic(&qname)?;
                Ok(Action::Respond(ok_empty()))
            }

            // --------------------------------------------------------------
            // Server scope
            // --------------------------------------------------------------
            Command::Version => {
                let pid = std::process::id().to_string();
                Ok(Action::Respond(ok_fields([
                    ("server_version", defaults::SERVER_VERSION),
                    ("storage_version", defaults::STORAGE_VERSION),
                    ("protocol_version", defaults::PROTOCOL_VERSION),
                    ("ns_node", self.identity.node_id.as_str()),
                    ("ns_session", self.identity.session_id.as_str()),
                    ("pid", pid.as_str()),
                ])))
            }
            Command::Health => {
                let pid = std::process::id().to_string();
                let started = self.identity.started.to_rfc3339();
                Ok(Action::Respond(ok_fields([
                    ("pid", pid.as_str()),
                    ("ns_node", self.identity.node_id.as_str()),
                    ("ns_session", self.identity.session_id.as_str()),
                    ("started", started.as_str()),
                ])))
            }
            Command::Quit => Ok(Action::Close),
        }
    }

    fn check_server_submit_gate(&self) -> Result<(), NsError> {
        if self.directory.refuse_submits() {
            return Err(NsError::submits_disabled());
        }
        Ok(())
    }

    /// MPUT/MGET accept keys held by another queue when the handshake
    /// queue allows it; the directory re-resolves the owner.
    fn queue_for_key(&self, key: &str) -> Arc<Queue> {
        let Ok(parsed) = key.parse::<JobKey>() else {
            return Arc::clone(&self.queue);
        };
        if self.queue.holds_job(parsed.id) {
            return Arc::clone(&self.queue);
        }
        if self.queue.params().allow_foreign_job_keys {
            if let Some(owner) = self.directory.find_job_queue(parsed.id, &self.queue_name) {
                info!(
                    queue = %self.queue_name,
                    owner = %owner.name(),
                    job = %parsed.id,
                    "Re-resolved foreign job key"
                );
                return owner;
            }
        }
        Arc::clone(&self.queue)
    }

    fn render_dispatch(&self, outcome: ConsumeOutcome, versioned: bool) -> String {
        match outcome {
            ConsumeOutcome::Dispatched {
                job,
                added_preferred,
            } => {
                if let Some(aff) = added_preferred {
                    debug!(
                        queue = %self.queue_name,
                        node = %self.client.node,
                        affinity = %aff,
                        "Added preferred affinity on dispatch"
                    );
                }
                let key = job.key.to_string();
                let input = String::from_utf8_lossy(&job.input).into_owned();
                let mask = job.mask.to_string();
                let mut fields = vec![
                    ("job_key", key.as_str()),
                    ("input", input.as_str()),
                    ("affinity", job.affinity.as_str()),
                    ("client_ip", job.client_ip.as_str()),
                    ("client_sid", job.client_sid.as_str()),
                    ("ncbi_phid", job.ncbi_phid.as_str()),
                    ("mask", mask.as_str()),
                ];
                if versioned {
                    fields.push(("auth_token", job.auth_token.as_str()));
                }
                ok_fields(fields)
            }
            ConsumeOutcome::NoJob { .. } => ok_empty(),
        }
    }

    fn render_read_dispatch(&self, outcome: ConsumeOutcome, versioned: bool) -> String {
        match outcome {
            ConsumeOutcome::Dispatched { job, .. } => {
                let key = job.key.to_string();
                let output = String::from_utf8_lossy(&job.output).into_owned();
                let mut fields = vec![
                    ("job_key", key.as_str()),
                    ("output", output.as_str()),
                    ("affinity", job.affinity.as_str()),
                ];
                if versioned {
                    fields.push(("auth_token", job.auth_token.as_str()));
                }
                ok_fields(fields)
            }
            ConsumeOutcome::NoJob { .. } => ok_empty(),
        }
    }
}

fn consumer_role(reader: bool) -> ConsumerRole {
    if reader {
        ConsumerRole::Reader
    } else {
        ConsumerRole::Worker
    }
}

fn role_bits(role: ConsumerRole) -> ClientRoles {
    match role {
        ConsumerRole::Worker => ClientRoles::WORKER,
        ConsumerRole::Reader => ClientRoles::READER,
    }
}

fn render_outcome(outcome: OpOutcome) -> String {
    match outcome {
        OpOutcome::Done => ok_empty(),
        OpOutcome::Warned(kind, msg) => ok_warning(kind, &msg, ""),
    }
}

fn render_fast_status(
    status: netsched_protocol::JobStatus,
    expiration: DateTime<Utc>,
    versioned: bool,
) -> String {
    if versioned {
        let exptime = expiration.timestamp().to_string();
        ok_fields([
            ("job_status", status.as_str()),
            ("job_exptime", exptime.as_str()),
        ])
    } else {
        response::ok_payload(status.as_code().to_string())
    }
}
