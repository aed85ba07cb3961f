//! The queue: composes the store, status matrix, registries, timeline, and
//! waiter registry behind one coarse lock, and enforces policy.
//!
//! Every externally visible operation acquires the lock once, mutates the
//! composed state transactionally, and returns. Nothing suspends while the
//! lock is held: wakeups are queued onto an mpsc channel drained by the
//! notifier thread.

use crate::affinity::{AffId, AffinityRegistry, RegistryLimits};
use crate::clients::{ClientId, ClientRegistry, TouchOutcome};
use crate::dispatch::{self, DispatchRequest};
use crate::durability::{Journal, JournalEvent, JournalOp, NullJournal};
use crate::group::{GroupId, GroupRegistry};
use crate::job::{Job, JobEventKind, JobListener, SubmitNotif};
use crate::status::StatusMatrix;
use crate::store::JobStore;
use crate::timeline::{Due, Timeline};
use crate::waiters::{Waiter, WaiterRegistry};
use chrono::{DateTime, Duration, Utc};
use netsched_protocol::command::{BatchJobSpec, DispatchFlags};
use netsched_protocol::notify::{JobStateNotice, NotifyPayload, NotifyReason};
use netsched_protocol::{
    ClientRoles, ConsumerRole, ErrKind, JobId, JobKey, JobStatus, NsError, PauseStatus,
    QueueParams, WarnKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

// ============================================================================
// Wire-adjacent result types
// ============================================================================

/// Outbound datagram handed to the notifier thread. Fire and forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub host: String,
    pub port: u16,
    pub payload: String,
}

/// Identity a queue needs to mint job keys and sign notifications.
#[derive(Debug, Clone)]
pub struct QueueContext {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

/// Submitter-supplied job description.
#[derive(Debug, Clone, Default)]
pub struct SubmitSpec {
    pub input: Vec<u8>,
    pub affinity: Option<String>,
    pub group: Option<String>,
    pub mask: u32,
    pub notif_port: u16,
    pub notif_timeout: u64,
    pub client_ip: String,
    pub client_sid: String,
    pub ncbi_phid: String,
}

/// GET/READ request after parsing.
#[derive(Debug, Clone, Default)]
pub struct ConsumeRequest {
    pub explicit_affinities: Vec<String>,
    pub groups: Vec<String>,
    pub flags: DispatchFlags,
    pub notif_port: u16,
    pub wait_timeout: u64,
}

/// Everything the handler needs to answer a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchedJob {
    pub key: JobKey,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub affinity: String,
    pub group: String,
    pub mask: u32,
    pub auth_token: String,
    pub client_ip: String,
    pub client_sid: String,
    pub ncbi_phid: String,
}

/// Outcome of GET/READ.
#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    Dispatched {
        job: Box<DispatchedJob>,
        /// Affinity token claimed through the exclusive-new path.
        added_preferred: Option<String>,
    },
    NoJob {
        parked: bool,
        paused: bool,
    },
}

/// Outcome of operations that may degrade to a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    Done,
    Warned(WarnKind, String),
}

impl OpOutcome {
    pub fn warned(kind: WarnKind, message: impl Into<String>) -> Self {
        OpOutcome::Warned(kind, message.into())
    }
}

/// Snapshot for STATUS/STATUS2/SST/WST.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub key: JobKey,
    pub status: JobStatus,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub affinity: String,
    pub group: String,
    pub mask: u32,
    pub run_attempts: u32,
    pub read_attempts: u32,
    pub expiration: DateTime<Utc>,
    pub progress_msg: String,
    pub last_event_index: usize,
}

/// What the purge scan did in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub marked_deleted: usize,
    pub removed: usize,
    pub affinities_collected: usize,
    pub groups_collected: usize,
}

/// Counter snapshot logged by the service thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub canceled: u64,
    pub reads_dispatched: u64,
    pub reads_confirmed: u64,
    pub notifications: u64,
}

/// Lock-free operation counters; single writer per field is not assumed.
#[derive(Debug, Default)]
pub struct QueueCounters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    canceled: AtomicU64,
    reads_dispatched: AtomicU64,
    reads_confirmed: AtomicU64,
    notifications: AtomicU64,
}

impl QueueCounters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            reads_dispatched: self.reads_dispatched.load(Ordering::Relaxed),
            reads_confirmed: self.reads_confirmed.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// One addressable queue.
pub struct Queue {
    name: String,
    inner: Mutex<Inner>,
    counters: QueueCounters,
}

/// How a claim release interacts with the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDisposition {
    /// Apply the retry policy: requeue while budget lasts, finalize after.
    Charge,
    /// Finalize unconditionally (`no_retries`).
    ForceFinal,
    /// Requeue unconditionally (pullback, cleared node).
    NeverFinal,
}

struct Inner {
    name: String,
    ctx: QueueContext,
    params: QueueParams,
    store: JobStore,
    matrix: StatusMatrix,
    affinities: AffinityRegistry,
    groups: GroupRegistry,
    clients: ClientRegistry,
    timeline: Timeline,
    waiters: WaiterRegistry,
    pause: PauseStatus,
    refuse_submits: bool,
    /// Clients told "no job" during a pause that asked to be re-notified.
    resume_targets: Vec<(String, u16)>,
    notify_tx: Sender<Datagram>,
    journal: Arc<dyn Journal>,
    /// Suppressed during journal replay.
    journaling: bool,
    notifications_sent: u64,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        params: QueueParams,
        ctx: QueueContext,
        notify_tx: Sender<Datagram>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        let name = name.into();
        let limits = RegistryLimits::from_params(&params);
        Self {
            inner: Mutex::new(Inner {
                name: name.clone(),
                ctx,
                params,
                store: JobStore::new(),
                matrix: StatusMatrix::new(),
                affinities: AffinityRegistry::new(limits),
                groups: GroupRegistry::new(limits),
                clients: ClientRegistry::new(),
                timeline: Timeline::new(),
                waiters: WaiterRegistry::new(),
                pause: PauseStatus::NoPause,
                refuse_submits: false,
                resume_targets: Vec::new(),
                notify_tx,
                journal,
                journaling: true,
                notifications_sent: 0,
            }),
            name,
            counters: QueueCounters::default(),
        }
    }

    /// Queue with a discard journal; test convenience.
    pub fn new_detached(
        name: impl Into<String>,
        params: QueueParams,
        ctx: QueueContext,
        notify_tx: Sender<Datagram>,
    ) -> Self {
        Self::new(name, params, ctx, notify_tx, Arc::new(NullJournal))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> &QueueCounters {
        &self.counters
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("queue lock poisoned")
    }

    // ------------------------------------------------------------------
    // Client bookkeeping
    // ------------------------------------------------------------------

    /// Register activity; called at the entry of every command. A session
    /// change drops the client's preferences, blacklists, and parked
    /// waiters.
    pub fn touch_client(
        &self,
        client: &ClientId,
        roles: ClientRoles,
        now: DateTime<Utc>,
    ) -> TouchOutcome {
        self.lock().touch_client(client, roles, now)
    }

    // ------------------------------------------------------------------
    // Submit side
    // ------------------------------------------------------------------

    pub fn submit(
        &self,
        client: &ClientId,
        spec: SubmitSpec,
        now: DateTime<Utc>,
    ) -> Result<JobKey, NsError> {
        let mut inner = self.lock();
        inner.check_submit_gate()?;
        if spec.input.len() > inner.params.max_input_size {
            return Err(NsError::invalid_parameter(format!(
                "Input exceeds the limit of {} bytes",
                inner.params.max_input_size
            )));
        }

        let id = inner.store.next_id();
        let key = inner.submit_one(client, id, spec, None, now);
        self.counters.bump_submitted();
        Ok(key)
    }

    /// Reserve a contiguous id range and submit the whole batch.
    pub fn submit_batch(
        &self,
        client: &ClientId,
        specs: Vec<BatchJobSpec>,
        group: Option<String>,
        notif_port: u16,
        notif_timeout: u64,
        now: DateTime<Utc>,
    ) -> Result<(JobId, usize), NsError> {
        let mut inner = self.lock();
        inner.check_submit_gate()?;
        for spec in &specs {
            if spec.input.len() > inner.params.max_input_size {
                return Err(NsError::invalid_parameter(format!(
                    "Batch input exceeds the limit of {} bytes",
                    inner.params.max_input_size
                )));
            }
        }

        let count = specs.len();
        let first = inner.store.reserve_ids(count as u32);
        let mut id = first.as_u32();
        for spec in specs {
            let submit = SubmitSpec {
                input: spec.input,
                affinity: spec.affinity,
                group: group.clone(),
                mask: spec.mask,
                notif_port,
                notif_timeout,
                ..SubmitSpec::default()
            };
            inner.submit_one(client, JobId::new(id), submit, Some(JobEventKind::BatchSubmit), now);
            self.counters.bump_submitted();
            id += 1;
        }
        Ok((first, count))
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    pub fn get_job_or_wait(
        &self,
        client: &ClientId,
        req: &ConsumeRequest,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, NsError> {
        self.consume_or_wait(client, req, ConsumerRole::Worker, now)
    }

    pub fn get_job_for_reading_or_wait(
        &self,
        client: &ClientId,
        req: &ConsumeRequest,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, NsError> {
        self.consume_or_wait(client, req, ConsumerRole::Reader, now)
    }

    fn consume_or_wait(
        &self,
        client: &ClientId,
        req: &ConsumeRequest,
        role: ConsumerRole,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, NsError> {
        if req.flags.use_preferred || req.flags.exclusive_new_affinity || req.wait_timeout > 0 {
            ClientRegistry::require_complete(client, "use preferred affinities or wait for jobs")?;
        }

        let mut inner = self.lock();
        if client.is_complete() {
            let roles = match role {
                ConsumerRole::Worker => ClientRoles::WORKER,
                ConsumerRole::Reader => ClientRoles::READER,
            };
            inner.touch_client(client, roles, now);
        }

        // While paused, workers are told "no job" immediately and may leave a
        // resume-notification target behind. Readers are unaffected.
        if role == ConsumerRole::Worker && inner.pause.is_paused() {
            if req.notif_port > 0 && req.wait_timeout > 0 {
                let target = (client.peer.clone(), req.notif_port);
                if !inner.resume_targets.contains(&target) {
                    inner.resume_targets.push(target);
                }
            }
            return Ok(ConsumeOutcome::NoJob {
                parked: false,
                paused: true,
            });
        }

        let explicit: Vec<AffId> = req
            .explicit_affinities
            .iter()
            .map(|t| inner.affinities.resolve(t))
            .collect();
        let groups: Vec<GroupId> = req.groups.iter().map(|t| inner.groups.resolve(t)).collect();
        let scope = inner.client_scope(&client.node);

        let dispatch_req = DispatchRequest {
            node: &client.node,
            scope: &scope,
            role,
            explicit_affinities: &explicit,
            groups: &groups,
            flags: req.flags,
            now,
        };
        let selection = dispatch::select_job(
            &inner.matrix,
            &inner.store,
            &inner.clients,
            &inner.affinities,
            &dispatch_req,
        );

        if let Some(selection) = selection {
            let added = inner.claim(client, selection.job_id, role, selection.claimed_affinity, now);
            let job = inner.dispatched_job(selection.job_id);
            match role {
                ConsumerRole::Worker => self.counters.bump_dispatched(),
                ConsumerRole::Reader => self.counters.bump_reads_dispatched(),
            }
            return Ok(ConsumeOutcome::Dispatched {
                job: Box::new(job),
                added_preferred: added,
            });
        }

        // Nothing eligible. Park only when the caller can be woken later.
        if req.wait_timeout > 0 && req.notif_port > 0 {
            let generation = inner.waiters.next_generation();
            let deadline = now + Duration::seconds(req.wait_timeout as i64);
            let waiter = Waiter {
                node: client.node.clone(),
                role,
                host: client.peer.clone(),
                port: req.notif_port,
                deadline,
                generation,
                explicit_affinities: explicit.clone(),
                groups: groups.clone(),
                flags: req.flags,
            };
            for aff in &explicit {
                inner.affinities.add_waiter_ref(*aff);
            }
            for group in &groups {
                inner.groups.add_waiter_ref(*group);
            }
            if let Some(replaced) = inner.waiters.park(waiter) {
                inner.release_waiter_refs(&replaced);
            }
            inner.timeline.schedule(
                deadline,
                generation,
                Due::WaiterExpired {
                    node: client.node.clone(),
                    role,
                },
            );
            return Ok(ConsumeOutcome::NoJob {
                parked: true,
                paused: false,
            });
        }

        Ok(ConsumeOutcome::NoJob {
            parked: false,
            paused: false,
        })
    }

    pub fn cancel_wait_get(&self, client: &ClientId) -> OpOutcome {
        self.cancel_wait(client, ConsumerRole::Worker)
    }

    pub fn cancel_wait_read(&self, client: &ClientId) -> OpOutcome {
        self.cancel_wait(client, ConsumerRole::Reader)
    }

    fn cancel_wait(&self, client: &ClientId, role: ConsumerRole) -> OpOutcome {
        let mut inner = self.lock();
        if let Some(waiter) = inner.waiters.cancel(&client.node, role) {
            inner.release_waiter_refs(&waiter);
        }
        OpOutcome::Done
    }

    pub fn put_result(
        &self,
        client: &ClientId,
        key: &str,
        auth_token: Option<&str>,
        return_code: i32,
        output: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        if output.len() > inner.params.max_output_size {
            return Err(NsError::invalid_parameter(format!(
                "Output exceeds the limit of {} bytes",
                inner.params.max_output_size
            )));
        }
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        match status {
            JobStatus::Running => {}
            JobStatus::Done => {
                return Ok(OpOutcome::warned(WarnKind::JobAlreadyDone, "Already done"))
            }
            JobStatus::Failed => {
                return Ok(OpOutcome::warned(WarnKind::JobAlreadyFailed, "Already failed"))
            }
            JobStatus::Canceled => {
                return Ok(OpOutcome::warned(
                    WarnKind::JobAlreadyCanceled,
                    "Already canceled",
                ))
            }
            other => return Err(NsError::invalid_status(other, "accept output")),
        }
        inner.authorize(id, auth_token)?;

        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.output = output;
            job.return_code = return_code;
        }
        inner.transition(id, JobStatus::Done, JobEventKind::Done, client, None, return_code, now)?;
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.release_claim();
        }
        inner.wake_waiters_for(id, now);
        self.counters.bump_completed();
        Ok(OpOutcome::Done)
    }

    pub fn put_failure(
        &self,
        client: &ClientId,
        key: &str,
        auth_token: Option<&str>,
        err_msg: &str,
        output: Vec<u8>,
        return_code: i32,
        no_retries: bool,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        if output.len() > inner.params.max_output_size {
            return Err(NsError::invalid_parameter(format!(
                "Output exceeds the limit of {} bytes",
                inner.params.max_output_size
            )));
        }
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        match status {
            JobStatus::Running => {}
            JobStatus::Failed => {
                return Ok(OpOutcome::warned(WarnKind::JobAlreadyFailed, "Already failed"))
            }
            JobStatus::Done => {
                return Ok(OpOutcome::warned(WarnKind::JobAlreadyDone, "Already done"))
            }
            JobStatus::Canceled => {
                return Ok(OpOutcome::warned(
                    WarnKind::JobAlreadyCanceled,
                    "Already canceled",
                ))
            }
            other => return Err(NsError::invalid_status(other, "accept failure")),
        }
        inner.authorize(id, auth_token)?;

        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.output = output;
            job.return_code = return_code;
        }
        let disposition = if no_retries {
            RetryDisposition::ForceFinal
        } else {
            RetryDisposition::Charge
        };
        let finalized = inner.release_run(
            client,
            id,
            JobEventKind::Fail,
            disposition,
            true,
            Some(err_msg.to_string()),
            now,
        )?;
        if finalized {
            self.counters.bump_failed();
        }
        Ok(OpOutcome::Done)
    }

    pub fn return_job(
        &self,
        client: &ClientId,
        key: &str,
        auth_token: Option<&str>,
        blacklist: bool,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        match status {
            JobStatus::Running => {}
            JobStatus::Pending => {
                return Ok(OpOutcome::warned(
                    WarnKind::JobAlreadyReturned,
                    "Already returned",
                ))
            }
            JobStatus::Done => {
                return Ok(OpOutcome::warned(WarnKind::JobAlreadyDone, "Already done"))
            }
            JobStatus::Canceled => {
                return Ok(OpOutcome::warned(
                    WarnKind::JobAlreadyCanceled,
                    "Already canceled",
                ))
            }
            other => return Err(NsError::invalid_status(other, "return job")),
        }
        inner.authorize(id, auth_token)?;
        let finalized =
            inner.release_run(
                client,
                id,
                JobEventKind::Return,
                RetryDisposition::Charge,
                blacklist,
                None,
                now,
            )?;
        if finalized {
            self.counters.bump_failed();
        }
        Ok(OpOutcome::Done)
    }

    /// Requeue with a new affinity and/or group. Allowed from a live claim
    /// (token checked) and from result-bearing states (no claim to check).
    pub fn reschedule(
        &self,
        client: &ClientId,
        key: &str,
        auth_token: &str,
        affinity: Option<&str>,
        group: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        match status {
            JobStatus::Running => inner.authorize(id, Some(auth_token))?,
            JobStatus::Done | JobStatus::Failed | JobStatus::Canceled => {}
            other => return Err(NsError::invalid_status(other, "reschedule job")),
        }

        let new_aff = affinity.map(|t| inner.affinities.resolve(t));
        let new_group = group.map(|t| inner.groups.resolve(t));
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.run_attempts = 0;
            job.read_attempts = 0;
        }
        if let Some(aff) = new_aff {
            inner.change_job_affinity(id, aff);
        }
        if let Some(group) = new_group {
            inner.change_job_group(id, group);
        }
        inner.transition(id, JobStatus::Pending, JobEventKind::Reschedule, client, None, 0, now)?;
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.release_claim();
        }
        inner.wake_waiters_for(id, now);
        Ok(OpOutcome::Done)
    }

    /// Done -> Pending, keeping history (REDO).
    pub fn redo_job(
        &self,
        client: &ClientId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        if status != JobStatus::Done {
            return Err(NsError::invalid_status(status, "redo job"));
        }
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.run_attempts = 0;
            job.read_attempts = 0;
            job.output.clear();
        }
        inner.transition(id, JobStatus::Pending, JobEventKind::Redo, client, None, 0, now)?;
        inner.wake_waiters_for(id, now);
        Ok(OpOutcome::Done)
    }

    pub fn delay_expiration(
        &self,
        key: &str,
        timeout: u64,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        if status != JobStatus::Running {
            return Err(NsError::invalid_status(status, "extend run timeout"));
        }
        let deadline = now + Duration::seconds(timeout as i64);
        let generation = {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.run_expiration = Some(deadline);
            job.bump_generation()
        };
        inner.timeline.schedule(deadline, generation, Due::RunExpired(id));
        Ok(OpOutcome::Done)
    }

    pub fn delay_read_expiration(
        &self,
        key: &str,
        timeout: u64,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        if status != JobStatus::Reading {
            return Err(NsError::invalid_status(status, "extend read timeout"));
        }
        let deadline = now + Duration::seconds(timeout as i64);
        let generation = {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.read_expiration = Some(deadline);
            job.bump_generation()
        };
        inner.timeline.schedule(deadline, generation, Due::ReadExpired(id));
        Ok(OpOutcome::Done)
    }

    // ------------------------------------------------------------------
    // Reader side
    // ------------------------------------------------------------------

    pub fn confirm_reading(
        &self,
        client: &ClientId,
        key: &str,
        auth_token: &str,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        if status != JobStatus::Reading {
            return Err(NsError::invalid_status(status, "confirm read"));
        }
        inner.authorize(id, Some(auth_token))?;
        inner.transition(id, JobStatus::Confirmed, JobEventKind::ReadDone, client, None, 0, now)?;
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.release_claim();
        }
        self.counters.bump_reads_confirmed();
        Ok(OpOutcome::Done)
    }

    pub fn fail_reading(
        &self,
        client: &ClientId,
        key: &str,
        auth_token: &str,
        err_msg: &str,
        no_retries: bool,
        blacklist: bool,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        if status != JobStatus::Reading {
            return Err(NsError::invalid_status(status, "fail read"));
        }
        inner.authorize(id, Some(auth_token))?;
        let disposition = if no_retries {
            RetryDisposition::ForceFinal
        } else {
            RetryDisposition::Charge
        };
        inner.release_read(
            client,
            id,
            JobEventKind::ReadFail,
            disposition,
            blacklist,
            Some(err_msg.to_string()),
            now,
        )?;
        Ok(OpOutcome::Done)
    }

    /// RDRB: roll the claim back so the job can be read again. The rollback
    /// does not count against the read retry budget.
    pub fn return_reading(
        &self,
        client: &ClientId,
        key: &str,
        auth_token: &str,
        blacklist: bool,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        if status != JobStatus::Reading {
            return Err(NsError::invalid_status(status, "roll back read"));
        }
        inner.authorize(id, Some(auth_token))?;
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.read_attempts = job.read_attempts.saturating_sub(1);
        }
        inner.transition(id, JobStatus::Done, JobEventKind::ReadRollback, client, None, 0, now)?;
        if blacklist {
            let until = now + Duration::seconds(inner.params.blacklist_time as i64);
            inner.clients.blacklist(&client.node, ConsumerRole::Reader, id, until);
        }
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.release_claim();
        }
        inner.wake_waiters_for(id, now);
        Ok(OpOutcome::Done)
    }

    /// REREAD: make an already-read job readable again.
    pub fn reread_job(
        &self,
        client: &ClientId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        let status = inner.live_status(id)?;
        match status {
            JobStatus::Confirmed | JobStatus::ReadFailed => {}
            JobStatus::Pending | JobStatus::Running | JobStatus::Reading => {
                return Err(NsError::invalid_status(status, "reread job"));
            }
            // Result-bearing but never read.
            JobStatus::Done | JobStatus::Failed | JobStatus::Canceled => {
                return Ok(OpOutcome::warned(
                    WarnKind::JobNotRead,
                    "The job has not been read yet",
                ));
            }
            JobStatus::Deleted => return Err(NsError::job_not_found()),
        }
        {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.read_attempts = 0;
        }
        inner.transition(id, JobStatus::Done, JobEventKind::Reread, client, None, 0, now)?;
        inner.wake_waiters_for(id, now);
        Ok(OpOutcome::Done)
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    pub fn cancel_job(
        &self,
        client: &ClientId,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = match inner.resolve_key(key) {
            Ok(id) => id,
            Err(e) if e.kind == ErrKind::JobNotFound => {
                return Ok(OpOutcome::warned(WarnKind::JobNotFound, "Job not found"));
            }
            Err(e) => return Err(e),
        };
        let status = match inner.live_status(id) {
            Ok(status) => status,
            Err(_) => return Ok(OpOutcome::warned(WarnKind::JobNotFound, "Job not found")),
        };
        match status {
            JobStatus::Canceled => {
                return Ok(OpOutcome::warned(
                    WarnKind::JobAlreadyCanceled,
                    "Already canceled",
                ))
            }
            s if s.is_terminal() => return Err(NsError::invalid_status(s, "cancel job")),
            _ => {}
        }
        inner.cancel_one(client, id, now)?;
        self.counters.bump_canceled();
        Ok(OpOutcome::Done)
    }

    /// Cancel every non-terminal job in a group, affinity, or status set.
    pub fn cancel_selection(
        &self,
        client: &ClientId,
        group: Option<&str>,
        affinity: Option<&str>,
        statuses: &[JobStatus],
        now: DateTime<Utc>,
    ) -> Result<usize, NsError> {
        let mut inner = self.lock();
        let candidates: Vec<JobId> = if let Some(token) = group {
            let id = inner
                .groups
                .find(token)
                .ok_or_else(|| NsError::new(ErrKind::GroupNotFound, format!("Group '{}' is unknown", token)))?;
            inner.groups.jobs(id).collect()
        } else if let Some(token) = affinity {
            let id = inner.affinities.find(token).ok_or_else(|| {
                NsError::new(ErrKind::AffinityNotFound, format!("Affinity '{}' is unknown", token))
            })?;
            inner
                .store
                .iter()
                .filter(|(_, j)| j.affinity_id == id)
                .map(|(id, _)| *id)
                .collect()
        } else {
            statuses
                .iter()
                .flat_map(|s| inner.matrix.ids(*s).collect::<Vec<_>>())
                .collect()
        };

        let mut canceled = 0;
        for id in candidates {
            let Ok(status) = inner.live_status(id) else { continue };
            if status == JobStatus::Canceled || status.is_terminal() {
                continue;
            }
            inner.cancel_one(client, id, now)?;
            self.counters.bump_canceled();
            canceled += 1;
        }
        Ok(canceled)
    }

    /// DROPQ/CANCELQ: cancel everything non-terminal.
    pub fn cancel_all_jobs(&self, client: &ClientId, now: DateTime<Utc>) -> Result<usize, NsError> {
        self.cancel_selection(
            client,
            None,
            None,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Done, JobStatus::Reading],
            now,
        )
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// STATUS/STATUS2/WST. `touch` additionally refreshes the job lifetime
    /// the way SST does for submitters.
    pub fn job_info(&self, key: &str, touch: bool, now: DateTime<Utc>) -> Result<JobInfo, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        if touch {
            inner.touch_job_expiration(id, now);
        }
        let ctx = inner.ctx.clone();
        let job = inner.store.get(id).ok_or_else(NsError::job_not_found)?;
        Ok(JobInfo {
            key: JobKey::new(id, ctx.port, &ctx.host),
            status: job.status,
            input: job.input.clone(),
            output: job.output.clone(),
            affinity: inner.affinities.token(job.affinity_id).to_string(),
            group: inner.groups.token(job.group_id).to_string(),
            mask: job.mask,
            run_attempts: job.run_attempts,
            read_attempts: job.read_attempts,
            expiration: job.expiration,
            progress_msg: job.progress_msg.clone(),
            last_event_index: job.last_event_index(),
        })
    }

    pub fn get_progress_msg(&self, key: &str) -> Result<String, NsError> {
        let inner = self.lock();
        let id = inner.resolve_key(key)?;
        let job = inner.store.get(id).ok_or_else(NsError::job_not_found)?;
        Ok(job.progress_msg.clone())
    }

    pub fn put_progress_msg(&self, key: &str, msg: &str) -> Result<(), NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        inner.live_status(id)?;
        let job = inner.store.get_mut(id).expect("job vanished under lock");
        job.progress_msg = msg.to_string();
        Ok(())
    }

    /// Does this queue hold the job the key names (live or retained)?
    pub fn holds_job(&self, id: JobId) -> bool {
        self.lock().store.get(id).is_some()
    }

    /// Any records at all, retained ones included?
    pub fn holds_any(&self) -> bool {
        !self.lock().store.is_empty()
    }

    /// Mint the wire key for a job id in this queue.
    pub fn make_key(&self, id: JobId) -> JobKey {
        let inner = self.lock();
        JobKey::new(id, inner.ctx.port, &inner.ctx.host)
    }

    // ------------------------------------------------------------------
    // Listeners / affinities / client admin
    // ------------------------------------------------------------------

    pub fn set_listener(
        &self,
        client: &ClientId,
        key: &str,
        port: u16,
        timeout: u64,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        let mut inner = self.lock();
        let id = inner.resolve_key(key)?;
        inner.live_status(id)?;
        let deadline = now + Duration::seconds(timeout as i64);
        let generation = {
            let job = inner.store.get_mut(id).expect("job vanished under lock");
            job.listeners.retain(|l| !(l.host == client.peer && l.port == port));
            job.listeners.push(JobListener {
                host: client.peer.clone(),
                port,
                deadline,
            });
            job.generation
        };
        inner.timeline.schedule(deadline, generation, Due::ListenerExpired(id));
        Ok(OpOutcome::Done)
    }

    pub fn change_affinity(
        &self,
        client: &ClientId,
        role: ConsumerRole,
        add: &[String],
        del: &[String],
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        ClientRegistry::require_complete(client, "change preferred affinities")?;
        let mut inner = self.lock();
        inner.touch_client(client, ClientRoles::empty(), now);

        let adds: Vec<AffId> = add.iter().map(|t| inner.affinities.resolve(t)).collect();
        let dels: Vec<AffId> = del
            .iter()
            .filter_map(|t| inner.affinities.find(t))
            .collect();
        let missing_dels = del.len() - dels.len();

        let (added, removed) = inner.clients.change_preferred(&client.node, role, &adds, &dels);
        let requested_dels = dels.len();
        for aff in &added {
            inner.affinities.add_preference(role, &client.node, *aff);
        }
        for aff in &removed {
            inner.affinities.remove_preference(role, &client.node, *aff);
        }

        if missing_dels > 0 || removed.len() < requested_dels {
            return Ok(OpOutcome::warned(
                WarnKind::AffinityNotPreferred,
                "Some affinities to delete were not in the preferred list",
            ));
        }
        Ok(OpOutcome::Done)
    }

    pub fn set_affinity(
        &self,
        client: &ClientId,
        role: ConsumerRole,
        affinities: &[String],
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        ClientRegistry::require_complete(client, "set preferred affinities")?;
        let mut inner = self.lock();
        inner.touch_client(client, ClientRoles::empty(), now);

        let ids: Vec<AffId> = affinities.iter().map(|t| inner.affinities.resolve(t)).collect();
        let (added, removed) = inner.clients.replace_preferred(&client.node, role, &ids);
        for aff in &added {
            inner.affinities.add_preference(role, &client.node, *aff);
        }
        for aff in &removed {
            inner.affinities.remove_preference(role, &client.node, *aff);
        }
        Ok(OpOutcome::Done)
    }

    /// CLRN: reset the client's per-session state and requeue its claims.
    pub fn clear_worker_node(
        &self,
        client: &ClientId,
        now: DateTime<Utc>,
    ) -> Result<OpOutcome, NsError> {
        ClientRegistry::require_complete(client, "clear worker node state")?;
        let mut inner = self.lock();

        if let Some((worker_prefs, reader_prefs)) = inner.clients.clear_node(&client.node) {
            for aff in worker_prefs {
                inner.affinities.remove_preference(ConsumerRole::Worker, &client.node, aff);
            }
            for aff in reader_prefs {
                inner.affinities.remove_preference(ConsumerRole::Reader, &client.node, aff);
            }
        }
        let parked = inner.waiters.cancel_all_for_node(&client.node);
        for waiter in parked {
            inner.release_waiter_refs(&waiter);
        }

        // Requeue everything the node still holds a claim on.
        let held: Vec<(JobId, JobStatus)> = inner
            .store
            .iter()
            .filter(|(_, j)| j.claimed_by.as_deref() == Some(client.node.as_str()))
            .map(|(id, j)| (*id, j.status))
            .collect();
        for (id, status) in held {
            // Clearing a node is not the job's fault: no blacklist, no
            // retry-budget charge.
            match status {
                JobStatus::Running => {
                    if let Some(job) = inner.store.get_mut(id) {
                        job.run_attempts = job.run_attempts.saturating_sub(1);
                    }
                    inner.release_run(
                        client,
                        id,
                        JobEventKind::Clear,
                        RetryDisposition::NeverFinal,
                        false,
                        None,
                        now,
                    )?;
                }
                JobStatus::Reading => {
                    if let Some(job) = inner.store.get_mut(id) {
                        job.read_attempts = job.read_attempts.saturating_sub(1);
                    }
                    inner.release_read(
                        client,
                        id,
                        JobEventKind::Clear,
                        RetryDisposition::NeverFinal,
                        false,
                        None,
                        now,
                    )?;
                }
                _ => {}
            }
        }
        Ok(OpOutcome::Done)
    }

    pub fn set_client_data(
        &self,
        client: &ClientId,
        data: &str,
        version: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<u32, NsError> {
        ClientRegistry::require_complete(client, "set client data")?;
        let mut inner = self.lock();
        inner.touch_client(client, ClientRoles::empty(), now);
        Ok(inner.clients.set_client_data(&client.node, data, version))
    }

    // ------------------------------------------------------------------
    // Pause / submit gates
    // ------------------------------------------------------------------

    pub fn pause(&self, pullback: bool) -> OpOutcome {
        let mut inner = self.lock();
        if inner.pause.is_paused() {
            // Switching pullback mode is still applied.
            inner.pause = if pullback {
                PauseStatus::PauseWithPullback
            } else {
                PauseStatus::PauseWithoutPullback
            };
            return OpOutcome::warned(WarnKind::QueueAlreadyPaused, "The queue has already been paused");
        }
        inner.pause = if pullback {
            PauseStatus::PauseWithPullback
        } else {
            PauseStatus::PauseWithoutPullback
        };
        info!(queue = %self.name, pullback, "Queue paused");
        OpOutcome::Done
    }

    pub fn resume(&self, now: DateTime<Utc>) -> OpOutcome {
        let mut inner = self.lock();
        if !inner.pause.is_paused() {
            return OpOutcome::warned(WarnKind::QueueNotPaused, "The queue is not paused");
        }
        inner.pause = PauseStatus::NoPause;
        info!(queue = %self.name, "Queue resumed");

        let targets = std::mem::take(&mut inner.resume_targets);
        for (host, port) in targets {
            inner.send_wakeup(&host, port, NotifyReason::QueueResumed);
        }
        // Parked workers may now be servable; let them re-issue.
        let pending: Vec<JobId> = inner.matrix.ids(JobStatus::Pending).collect();
        for id in pending {
            inner.wake_waiters_for(id, now);
        }
        OpOutcome::Done
    }

    pub fn pause_status(&self) -> PauseStatus {
        self.lock().pause
    }

    pub fn set_refuse_submits(&self, refuse: bool) {
        let mut inner = self.lock();
        inner.refuse_submits = refuse;
        info!(queue = %self.name, refuse, "Submit gate changed");
    }

    pub fn refuse_submits(&self) -> bool {
        self.lock().refuse_submits
    }

    /// Live (non-terminal) job count; gates dynamic queue deletion.
    pub fn non_terminal_count(&self) -> usize {
        self.lock().matrix.non_terminal_count()
    }

    pub fn params(&self) -> QueueParams {
        self.lock().params.clone()
    }

    // ------------------------------------------------------------------
    // Background entry points
    // ------------------------------------------------------------------

    /// Execution-watcher entry: apply every due expiration and, while a
    /// pullback pause is in force, return running jobs to Pending.
    pub fn check_timeline(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let system = ClientId::default();
        let mut applied = 0;

        if inner.pause == PauseStatus::PauseWithPullback {
            let running: Vec<JobId> = inner.matrix.ids(JobStatus::Running).collect();
            for id in running {
                // Pullback is not the worker's fault: no blacklist, no
                // retry-budget charge.
                if let Some(job) = inner.store.get_mut(id) {
                    job.run_attempts = job.run_attempts.saturating_sub(1);
                }
                if let Err(e) = inner.transition(
                    id,
                    JobStatus::Pending,
                    JobEventKind::Pullback,
                    &system,
                    None,
                    0,
                    now,
                ) {
                    error!(queue = %self.name, job = %id, error = %e, "Pullback failed");
                    continue;
                }
                if let Some(job) = inner.store.get_mut(id) {
                    job.release_claim();
                }
                applied += 1;
            }
        }

        for entry in inner.timeline.pop_due(now) {
            match entry.due {
                Due::RunExpired(id) => {
                    if !inner.generation_matches(id, entry.generation) {
                        continue;
                    }
                    if inner.live_status(id).map(|s| s == JobStatus::Running).unwrap_or(false) {
                        let holder = inner.claim_holder(id);
                        match inner.release_run(
                            &holder,
                            id,
                            JobEventKind::Timeout,
                            RetryDisposition::Charge,
                            true,
                            None,
                            now,
                        ) {
                            Ok(finalized) => {
                                self.counters.bump_timed_out();
                                if finalized {
                                    self.counters.bump_failed();
                                }
                                applied += 1;
                            }
                            Err(e) => {
                                error!(queue = %self.name, job = %id, error = %e, "Run timeout handling failed")
                            }
                        }
                    }
                }
                Due::ReadExpired(id) => {
                    if !inner.generation_matches(id, entry.generation) {
                        continue;
                    }
                    if inner.live_status(id).map(|s| s == JobStatus::Reading).unwrap_or(false) {
                        let holder = inner.claim_holder(id);
                        match inner.release_read(
                            &holder,
                            id,
                            JobEventKind::ReadTimeout,
                            RetryDisposition::Charge,
                            true,
                            None,
                            now,
                        ) {
                            Ok(_) => {
                                self.counters.bump_timed_out();
                                applied += 1;
                            }
                            Err(e) => {
                                error!(queue = %self.name, job = %id, error = %e, "Read timeout handling failed")
                            }
                        }
                    }
                }
                Due::JobExpired(id) => {
                    if !inner.generation_matches(id, entry.generation) {
                        continue;
                    }
                    let expired = inner
                        .store
                        .get(id)
                        .map(|j| {
                            j.expiration <= now
                                && !j.status.is_claimed()
                                && j.marked_deleted_at.is_none()
                        })
                        .unwrap_or(false);
                    if expired {
                        inner.mark_job_deleted(id, now);
                        applied += 1;
                    }
                }
                Due::ListenerExpired(id) => {
                    if let Some(job) = inner.store.get_mut(id) {
                        job.listeners.retain(|l| l.deadline > now);
                    }
                }
                Due::WaiterExpired { node, role } => {
                    if let Some(waiter) = inner.waiters.expire(&node, role, entry.generation) {
                        debug!(queue = %self.name, node = %node, role = %role, "Waiter expired");
                        inner.release_waiter_refs(&waiter);
                        applied += 1;
                    }
                }
            }
        }
        applied
    }

    /// Purge entry: two-phase removal of expired terminal jobs, blacklist
    /// pruning, and registry GC. Bounded by `batch` per call.
    pub fn purge(&self, now: DateTime<Utc>, batch: usize) -> PurgeStats {
        let mut inner = self.lock();
        let mut stats = PurgeStats::default();

        // Phase one: expired terminal records become Deleted.
        let terminal = [
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::Confirmed,
            JobStatus::ReadFailed,
        ];
        let mut to_mark = Vec::new();
        for status in terminal {
            for id in inner.matrix.ids(status) {
                if to_mark.len() >= batch {
                    break;
                }
                if inner.store.get(id).map(|j| j.expiration <= now).unwrap_or(false) {
                    to_mark.push(id);
                }
            }
        }
        for id in to_mark {
            inner.mark_job_deleted(id, now);
            stats.marked_deleted += 1;
        }

        // Phase two: physically drop records past the grace period.
        let grace = Duration::seconds(inner.params.deleted_grace as i64);
        let mut to_remove = Vec::new();
        for id in inner.matrix.ids(JobStatus::Deleted) {
            if to_remove.len() >= batch {
                break;
            }
            let overdue = inner
                .store
                .get(id)
                .and_then(|j| j.marked_deleted_at)
                .map(|at| at + grace <= now)
                .unwrap_or(false);
            if overdue {
                to_remove.push(id);
            }
        }
        for id in to_remove {
            inner.remove_job(id);
            stats.removed += 1;
        }

        inner.clients.prune_blacklists(now);
        stats.affinities_collected = inner.affinities.gc();
        stats.groups_collected = inner.groups.gc();

        if stats.marked_deleted > 0 || stats.removed > 0 {
            debug!(
                queue = %self.name,
                marked = stats.marked_deleted,
                removed = stats.removed,
                "Purge pass"
            );
        }
        stats
    }

    /// Replay recovered journal events into an empty queue. Claims do not
    /// survive a restart: recovered Running jobs land in Pending, recovered
    /// Reading jobs in Done.
    pub fn replay(&self, events: &[JournalEvent], now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.journaling = false;
        let system = ClientId::default();
        for event in events {
            match &event.op {
                JournalOp::Submit {
                    input,
                    affinity,
                    group,
                    mask,
                } => {
                    let id = event.job_id;
                    inner.store.restore_last_id(id.as_u32());
                    let spec = SubmitSpec {
                        input: input.clone(),
                        affinity: affinity.clone(),
                        group: group.clone(),
                        mask: *mask,
                        ..SubmitSpec::default()
                    };
                    inner.replay_submit(&system, id, spec, now);
                }
                JournalOp::Transition { to, output, .. } => {
                    // Claims do not survive a restart: a recovered Running
                    // job re-queues, a recovered Reading job re-offers.
                    let to = match to {
                        JobStatus::Running => JobStatus::Pending,
                        JobStatus::Reading => JobStatus::Done,
                        other => *other,
                    };
                    if let Some(out) = output {
                        if let Some(job) = inner.store.get_mut(event.job_id) {
                            job.output = out.clone();
                        }
                    }
                    inner.replay_set_status(event.job_id, to, now);
                }
                JournalOp::Remove => {
                    inner.remove_job(event.job_id);
                }
            }
        }
        inner.journaling = true;
        info!(queue = %self.name, jobs = inner.store.len(), "Journal replay finished");
    }

    pub fn counter_snapshot(&self) -> CounterSnapshot {
        let mut snapshot = self.counters.snapshot();
        snapshot.notifications = self.lock().notifications_sent;
        snapshot
    }

    /// Cross-check the composed state. Returns one line per violation;
    /// empty means consistent. Exercised by tests and by admins chasing
    /// corruption reports.
    pub fn verify_consistency(&self) -> Vec<String> {
        let inner = self.lock();
        let mut problems = Vec::new();

        for (id, job) in inner.store.iter() {
            let id = *id;
            // Exactly one status index holds the id.
            let mut homes = 0;
            for status in JobStatus::ALL {
                if inner.matrix.contains(*status, id) {
                    homes += 1;
                    if *status != job.status {
                        problems.push(format!(
                            "job {} is in the {} index but carries status {}",
                            id, status, job.status
                        ));
                    }
                }
            }
            if homes != 1 {
                problems.push(format!("job {} is in {} status indexes", id, homes));
            }

            // Claimed jobs carry a token and a claim deadline.
            if job.status.is_claimed() {
                if job.auth_token.is_empty() {
                    problems.push(format!("claimed job {} has no auth token", id));
                }
                let deadline = match job.status {
                    JobStatus::Running => job.run_expiration,
                    _ => job.read_expiration,
                };
                if deadline.is_none() {
                    problems.push(format!("claimed job {} has no claim deadline", id));
                }
            } else if !job.auth_token.is_empty() {
                problems.push(format!("unclaimed job {} still carries an auth token", id));
            }

            // Pending jobs with an affinity sit in the pending multi-index.
            if job.status == JobStatus::Pending
                && !job.affinity_id.is_none()
                && !inner.affinities.has_pending_job(job.affinity_id, id)
            {
                problems.push(format!(
                    "pending job {} is missing from the affinity pending index",
                    id
                ));
            }
        }

        // Status indexes must not name unknown jobs.
        for status in JobStatus::ALL {
            for id in inner.matrix.ids(*status) {
                if inner.store.get(id).is_none() {
                    problems.push(format!("{} index names unknown job {}", status, id));
                }
            }
        }

        problems
    }
}

impl QueueCounters {
    fn bump_submitted(&self) {
        Self::inc(&self.submitted);
    }
    fn bump_dispatched(&self) {
        Self::inc(&self.dispatched);
    }
    fn bump_completed(&self) {
        Self::inc(&self.completed);
    }
    fn bump_failed(&self) {
        Self::inc(&self.failed);
    }
    fn bump_timed_out(&self) {
        Self::inc(&self.timed_out);
    }
    fn bump_canceled(&self) {
        Self::inc(&self.canceled);
    }
    fn bump_reads_dispatched(&self) {
        Self::inc(&self.reads_dispatched);
    }
    fn bump_reads_confirmed(&self) {
        Self::inc(&self.reads_confirmed);
    }
}

// ============================================================================
// Inner: everything that happens under the lock
// ============================================================================

impl Inner {
    /// Full touch: registry bookkeeping plus the side effects of a session
    /// change (dropping registry preference refs and parked waiters).
    fn touch_client(
        &mut self,
        client: &ClientId,
        roles: ClientRoles,
        now: DateTime<Utc>,
    ) -> TouchOutcome {
        let outcome = self.clients.touch(client, roles, now);
        if outcome.session_reset {
            info!(
                queue = %self.name,
                node = %client.node,
                "Client session changed; resetting preferred affinities"
            );
            for aff in &outcome.dropped_worker_prefs {
                self.affinities.remove_preference(ConsumerRole::Worker, &client.node, *aff);
            }
            for aff in &outcome.dropped_reader_prefs {
                self.affinities.remove_preference(ConsumerRole::Reader, &client.node, *aff);
            }
            let parked = self.waiters.cancel_all_for_node(&client.node);
            for waiter in parked {
                self.release_waiter_refs(&waiter);
            }
        }
        outcome
    }

    fn check_submit_gate(&self) -> Result<(), NsError> {
        if self.refuse_submits {
            return Err(NsError::submits_disabled());
        }
        Ok(())
    }

    fn client_scope(&self, node: &str) -> String {
        self.clients
            .get(node)
            .map(|c| c.scope.clone())
            .unwrap_or_default()
    }

    /// Parse a key, checking that it routes to this server.
    fn resolve_key(&self, key: &str) -> Result<JobId, NsError> {
        let parsed: JobKey = key
            .parse()
            .map_err(|_| NsError::syntax(format!("Malformed job key: '{}'", key)))?;
        if !parsed.routes_to(self.ctx.port, &self.ctx.host) {
            return Err(NsError::incorrect_routing(key));
        }
        if self.store.get(parsed.id).is_none() {
            return Err(NsError::job_not_found());
        }
        Ok(parsed.id)
    }

    /// Status of a job that is still addressable (not marked deleted).
    fn live_status(&self, id: JobId) -> Result<JobStatus, NsError> {
        match self.store.get(id) {
            Some(job) if job.marked_deleted_at.is_none() => Ok(job.status),
            _ => Err(NsError::job_not_found()),
        }
    }

    fn authorize(&self, id: JobId, token: Option<&str>) -> Result<(), NsError> {
        let Some(token) = token else { return Ok(()) };
        let job = self.store.get(id).ok_or_else(NsError::job_not_found)?;
        if job.auth_token != token {
            return Err(NsError::invalid_auth_token());
        }
        Ok(())
    }

    fn generation_matches(&self, id: JobId, generation: u64) -> bool {
        self.store
            .get(id)
            .map(|j| j.generation == generation)
            .unwrap_or(false)
    }

    /// Identity of the current claim holder, for timeout bookkeeping.
    fn claim_holder(&self, id: JobId) -> ClientId {
        let node = self
            .store
            .get(id)
            .and_then(|j| j.claimed_by.clone())
            .unwrap_or_default();
        let peer = self.clients.get(&node).map(|c| c.peer.clone()).unwrap_or_default();
        let session = self
            .clients
            .get(&node)
            .map(|c| c.session.clone())
            .unwrap_or_default();
        ClientId::new(node, session, peer)
    }

    // ------------------------------------------------------------------
    // The single transition choke point
    // ------------------------------------------------------------------

    /// Move a job to `to`, maintain every index, append the event, journal
    /// the change, refresh the lifetime, and emit listener/submitter
    /// notices.
    fn transition(
        &mut self,
        id: JobId,
        to: JobStatus,
        event: JobEventKind,
        client: &ClientId,
        err_msg: Option<String>,
        ret_code: i32,
        now: DateTime<Utc>,
    ) -> Result<(), NsError> {
        let from = self
            .store
            .get(id)
            .map(|j| j.status)
            .ok_or_else(NsError::job_not_found)?;

        self.matrix.set_status(id, from, to).map_err(|e| {
            error!(queue = %self.name, job = %id, error = %e, "Status matrix rejected transition");
            NsError::new(ErrKind::InternalError, e.to_string())
        })?;

        // Keep the dispatch-side affinity indexes in step.
        let aff = self.store.get(id).map(|j| j.affinity_id).unwrap_or(AffId::NONE);
        if from == JobStatus::Pending {
            self.affinities.remove_pending_job(aff, id);
        }
        if to == JobStatus::Pending {
            self.affinities.add_pending_job(aff, id);
        }
        if from == JobStatus::Done {
            self.affinities.remove_done_job(aff, id);
        }
        if to == JobStatus::Done {
            self.affinities.add_done_job(aff, id);
        }

        let timeout = Duration::seconds(self.params.timeout as i64);
        let (generation, notice) = {
            let job = self.store.get_mut(id).expect("job vanished under lock");
            job.status = to;
            job.expiration = now + timeout;
            job.record_event(now, event, &client.node, &client.session, err_msg, ret_code);
            let generation = job.bump_generation();
            (generation, job.last_event_index())
        };

        // Unclaimed statuses are governed by the lifetime deadline; claimed
        // ones by their run/read deadline, scheduled by the caller.
        if matches!(to, JobStatus::Pending | JobStatus::Done) {
            self.timeline.schedule(now + timeout, generation, Due::JobExpired(id));
        }

        if self.journaling {
            // Outputs ride along on the Done transition so recovery can
            // restore results.
            let output = if to == JobStatus::Done {
                self.store
                    .get(id)
                    .filter(|j| !j.output.is_empty())
                    .map(|j| j.output.clone())
            } else {
                None
            };
            let journal_event = JournalEvent {
                queue: self.name.clone(),
                job_id: id,
                op: JournalOp::Transition { from, to, output },
            };
            if let Err(e) = self.journal.append(&journal_event) {
                error!(queue = %self.name, job = %id, error = %e, "Journal append failed");
            }
            self.emit_job_notices(id, notice, now);
        }
        Ok(())
    }

    /// Emit listener datagrams and, on result-bearing states, the submitter
    /// completion push.
    fn emit_job_notices(&mut self, id: JobId, event_index: usize, now: DateTime<Utc>) {
        let Some(job) = self.store.get(id) else { return };
        let key = JobKey::new(id, self.ctx.port, &self.ctx.host);
        let status = job.status;

        let mut targets: Vec<(String, u16)> = job
            .listeners
            .iter()
            .filter(|l| l.deadline > now)
            .map(|l| (l.host.clone(), l.port))
            .collect();

        if matches!(status, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled) {
            if let Some(notif) = &job.subm_notif {
                if notif.deadline > now {
                    targets.push((notif.host.clone(), notif.port));
                }
            }
        }

        if targets.is_empty() {
            return;
        }
        let notice = JobStateNotice {
            job_key: key.to_string(),
            job_status: status.as_str().to_string(),
            last_event_index: event_index,
            queue: self.name.clone(),
        };
        let payload = notice.to_wire();
        for (host, port) in targets {
            self.send_datagram(host, port, payload.clone());
        }
    }

    // ------------------------------------------------------------------
    // Submit / claim / release internals
    // ------------------------------------------------------------------

    fn submit_one(
        &mut self,
        client: &ClientId,
        id: JobId,
        spec: SubmitSpec,
        event_override: Option<JobEventKind>,
        now: DateTime<Utc>,
    ) -> JobKey {
        let aff = self.affinities.resolve(spec.affinity.as_deref().unwrap_or(""));
        let group = self.groups.resolve(spec.group.as_deref().unwrap_or(""));
        let timeout = Duration::seconds(self.params.timeout as i64);
        let scope = self.client_scope(&client.node);

        let subm_notif = if spec.notif_port > 0 && spec.notif_timeout > 0 {
            Some(SubmitNotif {
                host: client.peer.clone(),
                port: spec.notif_port,
                deadline: now + Duration::seconds(spec.notif_timeout as i64),
            })
        } else {
            None
        };

        let mut job = Job {
            id,
            status: JobStatus::Pending,
            input: spec.input.clone(),
            output: Vec::new(),
            affinity_id: aff,
            group_id: group,
            mask: spec.mask,
            subm_notif,
            listeners: Vec::new(),
            auth_token: String::new(),
            claimed_by: None,
            events: Vec::new(),
            run_attempts: 0,
            read_attempts: 0,
            expiration: now + timeout,
            run_expiration: None,
            read_expiration: None,
            client_ip: spec.client_ip,
            client_sid: spec.client_sid,
            ncbi_phid: spec.ncbi_phid,
            progress_msg: String::new(),
            scope,
            return_code: 0,
            generation: 1,
            marked_deleted_at: None,
        };
        job.record_event(
            now,
            event_override.unwrap_or(JobEventKind::Submit),
            &client.node,
            &client.session,
            None,
            0,
        );

        self.affinities.add_job_ref(aff);
        self.affinities.add_pending_job(aff, id);
        self.groups.add_job(group, id);
        self.timeline.schedule(now + timeout, 1, Due::JobExpired(id));
        self.store.insert(job);
        self.matrix.insert_new(id, JobStatus::Pending);

        let journal_event = JournalEvent {
            queue: self.name.clone(),
            job_id: id,
            op: JournalOp::Submit {
                input: spec.input,
                affinity: spec.affinity,
                group: spec.group,
                mask: spec.mask,
            },
        };
        if let Err(e) = self.journal.append(&journal_event) {
            error!(queue = %self.name, job = %id, error = %e, "Journal append failed");
        }

        self.wake_waiters_for(id, now);
        JobKey::new(id, self.ctx.port, &self.ctx.host)
    }

    /// Replay-side submit: no journal append, no notifications.
    fn replay_submit(&mut self, client: &ClientId, id: JobId, spec: SubmitSpec, now: DateTime<Utc>) {
        let aff = self.affinities.resolve(spec.affinity.as_deref().unwrap_or(""));
        let group = self.groups.resolve(spec.group.as_deref().unwrap_or(""));
        let timeout = Duration::seconds(self.params.timeout as i64);
        let mut job = Job {
            id,
            status: JobStatus::Pending,
            input: spec.input,
            output: Vec::new(),
            affinity_id: aff,
            group_id: group,
            mask: spec.mask,
            subm_notif: None,
            listeners: Vec::new(),
            auth_token: String::new(),
            claimed_by: None,
            events: Vec::new(),
            run_attempts: 0,
            read_attempts: 0,
            expiration: now + timeout,
            run_expiration: None,
            read_expiration: None,
            client_ip: String::new(),
            client_sid: String::new(),
            ncbi_phid: String::new(),
            progress_msg: String::new(),
            scope: String::new(),
            return_code: 0,
            generation: 1,
            marked_deleted_at: None,
        };
        job.record_event(now, JobEventKind::Submit, &client.node, &client.session, None, 0);
        self.affinities.add_job_ref(aff);
        self.affinities.add_pending_job(aff, id);
        self.groups.add_job(group, id);
        self.timeline.schedule(now + timeout, 1, Due::JobExpired(id));
        self.store.insert(job);
        self.matrix.insert_new(id, JobStatus::Pending);
    }

    /// Replay-side status apply. The journal is trusted: statuses are set
    /// directly (the recorded intermediate steps may have been collapsed by
    /// the claim remapping), bypassing the live transition table.
    fn replay_set_status(&mut self, id: JobId, to: JobStatus, now: DateTime<Utc>) {
        let Some((from, aff)) = self.store.get(id).map(|j| (j.status, j.affinity_id)) else {
            return;
        };
        if from == to {
            return;
        }
        self.matrix.remove(id, from);
        self.matrix.insert_new(id, to);
        if from == JobStatus::Pending {
            self.affinities.remove_pending_job(aff, id);
        }
        if to == JobStatus::Pending {
            self.affinities.add_pending_job(aff, id);
        }
        if from == JobStatus::Done {
            self.affinities.remove_done_job(aff, id);
        }
        if to == JobStatus::Done {
            self.affinities.add_done_job(aff, id);
        }

        let timeout = Duration::seconds(self.params.timeout as i64);
        let generation = {
            let job = self.store.get_mut(id).expect("job vanished under lock");
            job.status = to;
            job.expiration = now + timeout;
            job.bump_generation()
        };
        if matches!(to, JobStatus::Pending | JobStatus::Done) {
            self.timeline.schedule(now + timeout, generation, Due::JobExpired(id));
        }
    }

    /// Claim a job for a consumer: status move, fresh auth token, claim
    /// deadline, attempt accounting, preferred-affinity side effects.
    /// Returns the token string of a newly claimed affinity, if any.
    fn claim(
        &mut self,
        client: &ClientId,
        id: JobId,
        role: ConsumerRole,
        claimed_affinity: Option<AffId>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let (to, event) = match role {
            ConsumerRole::Worker => (JobStatus::Running, JobEventKind::Request),
            ConsumerRole::Reader => (JobStatus::Reading, JobEventKind::Read),
        };
        if let Err(e) = self.transition(id, to, event, client, None, 0, now) {
            // The selection came from the same critical section; a failure
            // here is an invariant breach.
            error!(queue = %self.name, job = %id, error = %e, "Claim transition failed");
            return None;
        }

        let claim_timeout = match role {
            ConsumerRole::Worker => self.params.run_timeout,
            ConsumerRole::Reader => self.params.read_timeout,
        };
        let deadline = now + Duration::seconds(claim_timeout as i64);
        let generation = {
            let job = self.store.get_mut(id).expect("job vanished under lock");
            job.auth_token = Uuid::new_v4().simple().to_string();
            job.claimed_by = Some(client.node.clone());
            match role {
                ConsumerRole::Worker => {
                    job.run_attempts += 1;
                    job.run_expiration = Some(deadline);
                }
                ConsumerRole::Reader => {
                    job.read_attempts += 1;
                    job.read_expiration = Some(deadline);
                }
            }
            job.generation
        };
        let due = match role {
            ConsumerRole::Worker => Due::RunExpired(id),
            ConsumerRole::Reader => Due::ReadExpired(id),
        };
        self.timeline.schedule(deadline, generation, due);

        let mut added = None;
        if let Some(aff) = claimed_affinity {
            if self.clients.add_preferred_on_new_job(&client.node, role, aff) {
                self.affinities.add_preference(role, &client.node, aff);
                added = Some(self.affinities.token(aff).to_string());
            }
        }
        added
    }

    fn dispatched_job(&self, id: JobId) -> DispatchedJob {
        let job = self.store.get(id).expect("job vanished under lock");
        DispatchedJob {
            key: JobKey::new(id, self.ctx.port, &self.ctx.host),
            input: job.input.clone(),
            output: job.output.clone(),
            affinity: self.affinities.token(job.affinity_id).to_string(),
            group: self.groups.token(job.group_id).to_string(),
            mask: job.mask,
            auth_token: job.auth_token.clone(),
            client_ip: job.client_ip.clone(),
            client_sid: job.client_sid.clone(),
            ncbi_phid: job.ncbi_phid.clone(),
        }
    }

    /// Release a run claim through the retry policy: back to Pending while
    /// the retry budget lasts, Failed once it is spent. Returns true when
    /// the job was finally failed.
    fn release_run(
        &mut self,
        client: &ClientId,
        id: JobId,
        event: JobEventKind,
        disposition: RetryDisposition,
        blacklist: bool,
        err_msg: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, NsError> {
        let (attempts, retries) = {
            let job = self.store.get(id).ok_or_else(NsError::job_not_found)?;
            (job.run_attempts, self.params.failed_retries)
        };

        let finalize = match disposition {
            RetryDisposition::Charge => attempts > retries,
            RetryDisposition::ForceFinal => true,
            RetryDisposition::NeverFinal => false,
        };
        if finalize {
            self.transition(id, JobStatus::Failed, JobEventKind::FinalFail, client, err_msg, 0, now)?;
        } else {
            self.transition(id, JobStatus::Pending, event, client, err_msg, 0, now)?;
        }
        if blacklist && !client.node.is_empty() {
            let until = now + Duration::seconds(self.params.blacklist_time as i64);
            self.clients.blacklist(&client.node, ConsumerRole::Worker, id, until);
        }
        {
            let job = self.store.get_mut(id).expect("job vanished under lock");
            job.release_claim();
        }
        if !finalize {
            self.wake_waiters_for(id, now);
        }
        Ok(finalize)
    }

    /// Read-side analog of [`release_run`].
    fn release_read(
        &mut self,
        client: &ClientId,
        id: JobId,
        event: JobEventKind,
        disposition: RetryDisposition,
        blacklist: bool,
        err_msg: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, NsError> {
        let (attempts, retries) = {
            let job = self.store.get(id).ok_or_else(NsError::job_not_found)?;
            (job.read_attempts, self.params.read_failed_retries)
        };

        let finalize = match disposition {
            RetryDisposition::Charge => attempts > retries,
            RetryDisposition::ForceFinal => true,
            RetryDisposition::NeverFinal => false,
        };
        if finalize {
            self.transition(
                id,
                JobStatus::ReadFailed,
                JobEventKind::ReadFinalFail,
                client,
                err_msg,
                0,
                now,
            )?;
        } else {
            self.transition(id, JobStatus::Done, event, client, err_msg, 0, now)?;
        }
        if blacklist && !client.node.is_empty() {
            let until = now + Duration::seconds(self.params.blacklist_time as i64);
            self.clients.blacklist(&client.node, ConsumerRole::Reader, id, until);
        }
        {
            let job = self.store.get_mut(id).expect("job vanished under lock");
            job.release_claim();
        }
        if !finalize {
            self.wake_waiters_for(id, now);
        }
        Ok(finalize)
    }

    fn cancel_one(&mut self, client: &ClientId, id: JobId, now: DateTime<Utc>) -> Result<(), NsError> {
        self.transition(id, JobStatus::Canceled, JobEventKind::Cancel, client, None, 0, now)?;
        let job = self.store.get_mut(id).expect("job vanished under lock");
        job.release_claim();
        Ok(())
    }

    fn change_job_affinity(&mut self, id: JobId, new_aff: AffId) {
        let Some(job) = self.store.get(id) else { return };
        let old = job.affinity_id;
        let status = job.status;
        if old == new_aff {
            return;
        }
        if status == JobStatus::Pending {
            self.affinities.remove_pending_job(old, id);
            self.affinities.add_pending_job(new_aff, id);
        }
        if status == JobStatus::Done {
            self.affinities.remove_done_job(old, id);
            self.affinities.add_done_job(new_aff, id);
        }
        self.affinities.release_job_ref(old);
        self.affinities.add_job_ref(new_aff);
        if let Some(job) = self.store.get_mut(id) {
            job.affinity_id = new_aff;
        }
    }

    fn change_job_group(&mut self, id: JobId, new_group: GroupId) {
        let Some(job) = self.store.get(id) else { return };
        let old = job.group_id;
        if old == new_group {
            return;
        }
        self.groups.remove_job(old, id);
        self.groups.add_job(new_group, id);
        if let Some(job) = self.store.get_mut(id) {
            job.group_id = new_group;
        }
    }

    fn touch_job_expiration(&mut self, id: JobId, now: DateTime<Utc>) {
        let timeout = Duration::seconds(self.params.timeout as i64);
        let Some(job) = self.store.get_mut(id) else { return };
        job.expiration = now + timeout;
        if !job.status.is_claimed() {
            let generation = job.bump_generation();
            self.timeline.schedule(now + timeout, generation, Due::JobExpired(id));
        }
    }

    fn mark_job_deleted(&mut self, id: JobId, now: DateTime<Utc>) {
        let Some(status) = self.store.get(id).map(|j| j.status) else {
            return;
        };
        if status != JobStatus::Deleted {
            if let Err(e) = self.matrix.set_status(id, status, JobStatus::Deleted) {
                error!(queue = %self.name, job = %id, error = %e, "Mark-deleted failed");
                return;
            }
        }
        self.store.mark_deleted(id, now);
        if status == JobStatus::Pending {
            let aff = self.store.get(id).map(|j| j.affinity_id).unwrap_or(AffId::NONE);
            self.affinities.remove_pending_job(aff, id);
        }
        if status == JobStatus::Done {
            let aff = self.store.get(id).map(|j| j.affinity_id).unwrap_or(AffId::NONE);
            self.affinities.remove_done_job(aff, id);
        }
    }

    fn remove_job(&mut self, id: JobId) {
        let Some(job) = self.store.remove(id) else { return };
        self.matrix.remove(id, job.status);
        self.affinities.remove_pending_job(job.affinity_id, id);
        self.affinities.remove_done_job(job.affinity_id, id);
        self.affinities.release_job_ref(job.affinity_id);
        self.groups.remove_job(job.group_id, id);
        if self.journaling {
            let journal_event = JournalEvent {
                queue: self.name.clone(),
                job_id: id,
                op: JournalOp::Remove,
            };
            if let Err(e) = self.journal.append(&journal_event) {
                error!(queue = %self.name, job = %id, error = %e, "Journal append failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn send_datagram(&mut self, host: String, port: u16, payload: String) {
        let datagram = Datagram { host, port, payload };
        if self.notify_tx.send(datagram).is_err() {
            debug!(queue = %self.name, "Notifier channel closed; dropping datagram");
            return;
        }
        self.notifications_sent += 1;
    }

    fn send_wakeup(&mut self, host: &str, port: u16, reason: NotifyReason) {
        let payload =
            NotifyPayload::new(reason, self.ctx.node_id.as_str(), self.name.as_str()).to_wire();
        self.send_datagram(host.to_string(), port, payload);
    }

    /// A job just became eligible (Pending or Done): wake every parked
    /// waiter of the matching role whose predicate accepts it, in insertion
    /// order.
    fn wake_waiters_for(&mut self, id: JobId, now: DateTime<Utc>) {
        let Some(job) = self.store.get(id) else { return };
        let role = match job.status {
            JobStatus::Pending => ConsumerRole::Worker,
            JobStatus::Done => ConsumerRole::Reader,
            _ => return,
        };
        let reason = match role {
            ConsumerRole::Worker => NotifyReason::Get,
            ConsumerRole::Reader => NotifyReason::Read,
        };
        let targets: Vec<(String, u16)> = self
            .waiters
            .iter_role(role)
            .filter(|w| dispatch::waiter_matches(job, w, &self.clients, &self.affinities, now))
            .map(|w| (w.host.clone(), w.port))
            .collect();
        for (host, port) in targets {
            self.send_wakeup(&host, port, reason);
        }
    }

    fn release_waiter_refs(&mut self, waiter: &Waiter) {
        for aff in &waiter.explicit_affinities {
            self.affinities.release_waiter_ref(*aff);
        }
        for group in &waiter.groups {
            self.groups.release_waiter_ref(*group);
        }
    }
}
