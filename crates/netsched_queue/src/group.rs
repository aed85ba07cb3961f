//! Group registry: job-group token interning and per-group job indexes.

use crate::affinity::RegistryLimits;
use netsched_protocol::JobId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Dense group id. 0 is the reserved "no group" id; `""` and `"-"`
/// normalize to it at the registry edge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct GroupId(u32);

impl GroupId {
    pub const NONE: GroupId = GroupId(0);

    pub(crate) const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct GroupEntry {
    token: String,
    /// Every live job in the group, regardless of status.
    jobs: BTreeSet<JobId>,
    waiter_refs: u32,
}

impl GroupEntry {
    fn referenced(&self) -> bool {
        !self.jobs.is_empty() || self.waiter_refs > 0
    }
}

/// Interns group tokens; tracks group membership for dispatch filtering and
/// bulk cancel. Same watermark GC scheme as the affinity registry.
#[derive(Debug)]
pub struct GroupRegistry {
    by_token: HashMap<String, GroupId>,
    entries: HashMap<GroupId, GroupEntry>,
    next_id: u32,
    limits: RegistryLimits,
}

impl GroupRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            by_token: HashMap::new(),
            entries: HashMap::new(),
            next_id: 1,
            limits,
        }
    }

    pub fn resolve(&mut self, token: &str) -> GroupId {
        if token.is_empty() || token == "-" {
            return GroupId::NONE;
        }
        if let Some(id) = self.by_token.get(token) {
            return *id;
        }
        let id = GroupId(self.next_id);
        self.next_id += 1;
        self.by_token.insert(token.to_string(), id);
        self.entries.insert(
            id,
            GroupEntry {
                token: token.to_string(),
                ..GroupEntry::default()
            },
        );
        id
    }

    pub fn find(&self, token: &str) -> Option<GroupId> {
        if token.is_empty() || token == "-" {
            return Some(GroupId::NONE);
        }
        self.by_token.get(token).copied()
    }

    pub fn token(&self, id: GroupId) -> &str {
        if id.is_none() {
            return "";
        }
        self.entries.get(&id).map(|e| e.token.as_str()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add_job(&mut self, id: GroupId, job: JobId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.jobs.insert(job);
        }
    }

    pub fn remove_job(&mut self, id: GroupId, job: JobId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.jobs.remove(&job);
        }
    }

    /// Jobs in the group, ascending.
    pub fn jobs(&self, id: GroupId) -> impl Iterator<Item = JobId> + '_ {
        self.entries
            .get(&id)
            .into_iter()
            .flat_map(|e| e.jobs.iter().copied())
    }

    pub fn add_waiter_ref(&mut self, id: GroupId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.waiter_refs += 1;
        }
    }

    pub fn release_waiter_ref(&mut self, id: GroupId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.waiter_refs = entry.waiter_refs.saturating_sub(1);
        }
    }

    /// Bulk-collect unreferenced entries; same policy as the affinity GC.
    pub fn gc(&mut self) -> usize {
        let occupancy = self.entries.len();
        let high = self.limits.max_tokens * self.limits.high_mark_percentage as usize / 100;
        let low = self.limits.max_tokens * self.limits.low_mark_percentage as usize / 100;
        let dirt = self.limits.max_tokens * self.limits.dirt_percentage as usize / 100;

        let dirty = self.entries.values().filter(|e| !e.referenced()).count();
        let over_high = occupancy > high;
        if !over_high && dirty <= dirt {
            return 0;
        }

        let target = if over_high { low } else { occupancy - dirty };

        let mut victims: Vec<GroupId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.referenced())
            .map(|(id, _)| *id)
            .collect();
        victims.sort();

        let mut collected = 0;
        for id in victims {
            if self.entries.len() <= target {
                break;
            }
            if let Some(entry) = self.entries.remove(&id) {
                self.by_token.remove(&entry.token);
                collected += 1;
            }
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RegistryLimits {
        RegistryLimits {
            max_tokens: 100,
            high_mark_percentage: 90,
            low_mark_percentage: 50,
            dirt_percentage: 20,
        }
    }

    #[test]
    fn test_no_group_normalization() {
        let mut reg = GroupRegistry::new(limits());
        assert_eq!(reg.resolve(""), GroupId::NONE);
        assert_eq!(reg.resolve("-"), GroupId::NONE);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_membership_tracking() {
        let mut reg = GroupRegistry::new(limits());
        let g = reg.resolve("run42");
        reg.add_job(g, JobId::new(2));
        reg.add_job(g, JobId::new(1));
        let ids: Vec<u32> = reg.jobs(g).map(JobId::as_u32).collect();
        assert_eq!(ids, vec![1, 2]);
        reg.remove_job(g, JobId::new(1));
        assert_eq!(reg.jobs(g).count(), 1);
    }

    #[test]
    fn test_gc_spares_groups_with_jobs() {
        let mut reg = GroupRegistry::new(RegistryLimits {
            max_tokens: 10,
            high_mark_percentage: 50,
            low_mark_percentage: 20,
            dirt_percentage: 10,
        });
        let live = reg.resolve("live");
        reg.add_job(live, JobId::new(1));
        for i in 0..7 {
            reg.resolve(&format!("dead{}", i));
        }
        assert!(reg.gc() > 0);
        assert_eq!(reg.find("live"), Some(live));
    }
}
