//! Client registry: session identity, roles, preferred affinities,
//! per-job blacklists.

use crate::affinity::AffId;
use chrono::{DateTime, Utc};
use netsched_protocol::{ClientRoles, ConsumerRole, JobId, NsError};
use std::collections::{HashMap, HashSet};

/// Identity a client presents at handshake. A client is "complete" when it
/// supplied both a node and a session; commands that rely on preferred
/// affinities or parked waiters require complete clients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientId {
    pub node: String,
    pub session: String,
    /// Peer address of the TCP connection, notification target host.
    pub peer: String,
}

impl ClientId {
    pub fn new(node: impl Into<String>, session: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            session: session.into(),
            peer: peer.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.node.is_empty() && !self.session.is_empty()
    }
}

/// What `touch` observed about a client on command entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchOutcome {
    pub is_new: bool,
    /// The session string changed: per-session state was reset.
    pub session_reset: bool,
    /// The client had non-empty preferred sets before the reset.
    pub had_preferences: bool,
    /// Preference ids dropped by a session reset; the caller must release
    /// the matching registry references.
    pub dropped_worker_prefs: Vec<AffId>,
    pub dropped_reader_prefs: Vec<AffId>,
}

#[derive(Debug)]
pub struct ClientRecord {
    pub node: String,
    pub session: String,
    pub peer: String,
    pub roles: ClientRoles,
    pub worker_prefs: HashSet<AffId>,
    pub reader_prefs: HashSet<AffId>,
    worker_blacklist: HashMap<JobId, DateTime<Utc>>,
    reader_blacklist: HashMap<JobId, DateTime<Utc>>,
    pub scope: String,
    pub data: String,
    pub data_version: u32,
    pub last_access: DateTime<Utc>,
}

impl Default for ClientRecord {
    fn default() -> Self {
        Self {
            node: String::new(),
            session: String::new(),
            peer: String::new(),
            roles: ClientRoles::empty(),
            worker_prefs: HashSet::new(),
            reader_prefs: HashSet::new(),
            worker_blacklist: HashMap::new(),
            reader_blacklist: HashMap::new(),
            scope: String::new(),
            data: String::new(),
            data_version: 0,
            last_access: DateTime::<Utc>::MIN_UTC,
        }
    }
}

impl ClientRecord {
    pub fn prefs(&self, role: ConsumerRole) -> &HashSet<AffId> {
        match role {
            ConsumerRole::Worker => &self.worker_prefs,
            ConsumerRole::Reader => &self.reader_prefs,
        }
    }

    fn prefs_mut(&mut self, role: ConsumerRole) -> &mut HashSet<AffId> {
        match role {
            ConsumerRole::Worker => &mut self.worker_prefs,
            ConsumerRole::Reader => &mut self.reader_prefs,
        }
    }

    fn blacklist_mut(&mut self, role: ConsumerRole) -> &mut HashMap<JobId, DateTime<Utc>> {
        match role {
            ConsumerRole::Worker => &mut self.worker_blacklist,
            ConsumerRole::Reader => &mut self.reader_blacklist,
        }
    }
}

/// Per-queue registry of clients keyed by node. Records survive session
/// resets; per-session state (preferences, blacklists) does not.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, ClientRecord>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register activity for `client`, detecting session changes. Called on
    /// every command. Anonymous clients are not tracked.
    ///
    /// On a session change the worker and reader preferred sets and both
    /// blacklists are dropped; the caller is responsible for releasing
    /// registry-side preference references and parked waiters.
    pub fn touch(&mut self, client: &ClientId, role: ClientRoles, now: DateTime<Utc>) -> TouchOutcome {
        if client.node.is_empty() {
            return TouchOutcome::default();
        }

        let record = self.clients.entry(client.node.clone()).or_default();
        let is_new = record.node.is_empty();
        let mut outcome = TouchOutcome {
            is_new,
            ..TouchOutcome::default()
        };

        if is_new {
            record.node = client.node.clone();
            record.session = client.session.clone();
        } else if record.session != client.session {
            outcome.session_reset = true;
            outcome.had_preferences =
                !record.worker_prefs.is_empty() || !record.reader_prefs.is_empty();
            outcome.dropped_worker_prefs = record.worker_prefs.drain().collect();
            outcome.dropped_reader_prefs = record.reader_prefs.drain().collect();
            record.worker_blacklist.clear();
            record.reader_blacklist.clear();
            record.session = client.session.clone();
        }

        record.peer = client.peer.clone();
        record.roles.insert(role);
        record.last_access = now;
        outcome
    }

    pub fn get(&self, node: &str) -> Option<&ClientRecord> {
        self.clients.get(node)
    }

    pub fn get_mut(&mut self, node: &str) -> Option<&mut ClientRecord> {
        self.clients.get_mut(node)
    }

    /// Preferred affinities of `node` for `role`; empty for unknown clients.
    pub fn preferred(&self, node: &str, role: ConsumerRole) -> Option<&HashSet<AffId>> {
        self.clients.get(node).map(|c| c.prefs(role))
    }

    /// Apply explicit preferred-set changes. Returns (actually added,
    /// actually removed) so the caller can keep registry refs in step.
    pub fn change_preferred(
        &mut self,
        node: &str,
        role: ConsumerRole,
        adds: &[AffId],
        dels: &[AffId],
    ) -> (Vec<AffId>, Vec<AffId>) {
        let Some(record) = self.clients.get_mut(node) else {
            return (Vec::new(), Vec::new());
        };
        let prefs = record.prefs_mut(role);
        let mut added = Vec::new();
        let mut removed = Vec::new();
        for del in dels {
            if prefs.remove(del) {
                removed.push(*del);
            }
        }
        for add in adds {
            if !add.is_none() && prefs.insert(*add) {
                added.push(*add);
            }
        }
        (added, removed)
    }

    /// Replace the preferred set wholesale (SETAFF/SETRAFF).
    pub fn replace_preferred(
        &mut self,
        node: &str,
        role: ConsumerRole,
        affinities: &[AffId],
    ) -> (Vec<AffId>, Vec<AffId>) {
        let Some(record) = self.clients.get_mut(node) else {
            return (Vec::new(), Vec::new());
        };
        let prefs = record.prefs_mut(role);
        let new_set: HashSet<AffId> = affinities.iter().copied().filter(|a| !a.is_none()).collect();
        let added = new_set.difference(prefs).copied().collect();
        let removed = prefs.difference(&new_set).copied().collect();
        *prefs = new_set;
        (added, removed)
    }

    /// Record an affinity claimed through the exclusive-new-affinity path.
    pub fn add_preferred_on_new_job(&mut self, node: &str, role: ConsumerRole, aff: AffId) -> bool {
        if aff.is_none() {
            return false;
        }
        self.clients
            .get_mut(node)
            .map(|c| c.prefs_mut(role).insert(aff))
            .unwrap_or(false)
    }

    pub fn blacklist(
        &mut self,
        node: &str,
        role: ConsumerRole,
        job: JobId,
        until: DateTime<Utc>,
    ) {
        if let Some(record) = self.clients.get_mut(node) {
            record.blacklist_mut(role).insert(job, until);
        }
    }

    pub fn is_blacklisted(
        &self,
        node: &str,
        role: ConsumerRole,
        job: JobId,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(record) = self.clients.get(node) else {
            return false;
        };
        let blacklist = match role {
            ConsumerRole::Worker => &record.worker_blacklist,
            ConsumerRole::Reader => &record.reader_blacklist,
        };
        matches!(blacklist.get(&job), Some(until) if *until > now)
    }

    /// Drop expired blacklist entries; called from the purge scan.
    pub fn prune_blacklists(&mut self, now: DateTime<Utc>) {
        for record in self.clients.values_mut() {
            record.worker_blacklist.retain(|_, until| *until > now);
            record.reader_blacklist.retain(|_, until| *until > now);
        }
    }

    /// Reset per-session state while preserving identity (CLRN). Returns the
    /// preference ids dropped, per role, so registry refs can be released.
    pub fn clear_node(&mut self, node: &str) -> Option<(Vec<AffId>, Vec<AffId>)> {
        let record = self.clients.get_mut(node)?;
        let worker: Vec<AffId> = record.worker_prefs.drain().collect();
        let reader: Vec<AffId> = record.reader_prefs.drain().collect();
        record.worker_blacklist.clear();
        record.reader_blacklist.clear();
        Some((worker, reader))
    }

    pub fn set_client_data(&mut self, node: &str, data: &str, version: Option<u32>) -> u32 {
        match self.clients.get_mut(node) {
            Some(record) => {
                record.data = data.to_string();
                record.data_version = version.unwrap_or(record.data_version + 1);
                record.data_version
            }
            None => 0,
        }
    }

    /// Commands relying on per-session state need a complete client.
    pub fn require_complete(client: &ClientId, what: &str) -> Result<(), NsError> {
        if client.is_complete() {
            Ok(())
        } else {
            Err(NsError::access_denied(format!(
                "Anonymous client (no node and session) cannot {}",
                what
            )))
        }
    }
}
