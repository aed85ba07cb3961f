//! Waiter registry: parked GET/READ requests awaiting eligible work.
//!
//! A waiter is a data record, not a suspended connection: the TCP response
//! ("no job") has already been sent by the time a waiter is parked. Wakeups
//! are UDP datagrams; the client must re-issue its request to claim a job.

use crate::affinity::AffId;
use crate::group::GroupId;
use chrono::{DateTime, Utc};
use netsched_protocol::command::DispatchFlags;
use netsched_protocol::ConsumerRole;

/// One parked consumer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    pub node: String,
    pub role: ConsumerRole,
    /// Notification target.
    pub host: String,
    pub port: u16,
    pub deadline: DateTime<Utc>,
    /// Stamp used for lazy cancellation of the WaiterExpired entry.
    pub generation: u64,
    pub explicit_affinities: Vec<AffId>,
    pub groups: Vec<GroupId>,
    pub flags: DispatchFlags,
}

/// Parked waiters in insertion order. At most one waiter per (node, role);
/// re-parking replaces the old record.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    waiters: Vec<Waiter>,
    generation: u64,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a generation stamp for a new waiter.
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Park a waiter, replacing any previous record for the same client and
    /// role. Returns the replaced waiter so the caller can release its
    /// registry references.
    pub fn park(&mut self, waiter: Waiter) -> Option<Waiter> {
        let replaced = self.cancel(&waiter.node, waiter.role);
        self.waiters.push(waiter);
        replaced
    }

    /// Remove the waiter for (node, role), if any.
    pub fn cancel(&mut self, node: &str, role: ConsumerRole) -> Option<Waiter> {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.node == node && w.role == role)?;
        Some(self.waiters.remove(pos))
    }

    /// Remove the waiter for (node, role) only if its generation still
    /// matches; stale expiration events are discarded this way.
    pub fn expire(&mut self, node: &str, role: ConsumerRole, generation: u64) -> Option<Waiter> {
        let pos = self.waiters.iter().position(|w| {
            w.node == node && w.role == role && w.generation == generation
        })?;
        Some(self.waiters.remove(pos))
    }

    /// Remove every waiter of `node`, both roles (session reset, CLRN).
    pub fn cancel_all_for_node(&mut self, node: &str) -> Vec<Waiter> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].node == node {
                removed.push(self.waiters.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Parked waiters of `role`, insertion order.
    pub fn iter_role(&self, role: ConsumerRole) -> impl Iterator<Item = &Waiter> {
        self.waiters.iter().filter(move |w| w.role == role)
    }

    pub fn get(&self, node: &str, role: ConsumerRole) -> Option<&Waiter> {
        self.waiters
            .iter()
            .find(|w| w.node == node && w.role == role)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
