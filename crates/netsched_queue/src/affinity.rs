//! Affinity registry: token interning, reference tracking, watermark GC.

use netsched_protocol::{ConsumerRole, JobId, QueueParams};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Dense affinity id. 0 is the reserved "no affinity" id; the tokens `""`
/// and `"-"` normalize to it at the registry edge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AffId(u32);

impl AffId {
    pub const NONE: AffId = AffId(0);

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

impl fmt::Display for AffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// GC thresholds, derived from queue parameters.
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    pub max_tokens: usize,
    pub high_mark_percentage: u8,
    pub low_mark_percentage: u8,
    pub dirt_percentage: u8,
}

impl RegistryLimits {
    pub fn from_params(params: &QueueParams) -> Self {
        Self {
            max_tokens: params.max_tokens,
            high_mark_percentage: params.high_mark_percentage,
            low_mark_percentage: params.low_mark_percentage,
            dirt_percentage: params.dirt_percentage,
        }
    }

    fn high_mark(&self) -> usize {
        self.max_tokens * self.high_mark_percentage as usize / 100
    }

    fn low_mark(&self) -> usize {
        self.max_tokens * self.low_mark_percentage as usize / 100
    }

    fn dirt_mark(&self) -> usize {
        self.max_tokens * self.dirt_percentage as usize / 100
    }
}

#[derive(Debug, Default)]
struct AffEntry {
    token: String,
    /// Pending jobs carrying this affinity, ascending.
    pending_jobs: BTreeSet<JobId>,
    /// Done jobs carrying this affinity (reader-side dispatch index).
    done_jobs: BTreeSet<JobId>,
    /// Client nodes preferring this affinity, per role.
    preferred_by_workers: HashSet<String>,
    preferred_by_readers: HashSet<String>,
    /// Parked waiters naming this affinity explicitly.
    waiter_refs: u32,
    /// Jobs in any other status still referencing the token.
    job_refs: u32,
}

impl AffEntry {
    fn referenced(&self) -> bool {
        !self.pending_jobs.is_empty()
            || !self.done_jobs.is_empty()
            || !self.preferred_by_workers.is_empty()
            || !self.preferred_by_readers.is_empty()
            || self.waiter_refs > 0
            || self.job_refs > 0
    }
}

/// Interns affinity tokens into dense ids and tracks who references them:
/// pending/done jobs, per-role preferred sets, parked waiters, and jobs in
/// other statuses. Unreferenced entries are garbage-collected in bulk when
/// occupancy crosses the high watermark (or lazily once enough entries have
/// gone dirty), down to the low watermark.
#[derive(Debug)]
pub struct AffinityRegistry {
    by_token: HashMap<String, AffId>,
    entries: HashMap<AffId, AffEntry>,
    next_id: u32,
    limits: RegistryLimits,
}

impl AffinityRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            by_token: HashMap::new(),
            entries: HashMap::new(),
            next_id: 1,
            limits,
        }
    }

    /// Intern `token`, normalizing `""` and `"-"` to the reserved id.
    pub fn resolve(&mut self, token: &str) -> AffId {
        if token.is_empty() || token == "-" {
            return AffId::NONE;
        }
        if let Some(id) = self.by_token.get(token) {
            return *id;
        }
        let id = AffId(self.next_id);
        self.next_id += 1;
        self.by_token.insert(token.to_string(), id);
        self.entries.insert(
            id,
            AffEntry {
                token: token.to_string(),
                ..AffEntry::default()
            },
        );
        id
    }

    /// Look up without interning.
    pub fn find(&self, token: &str) -> Option<AffId> {
        if token.is_empty() || token == "-" {
            return Some(AffId::NONE);
        }
        self.by_token.get(token).copied()
    }

    /// Token for an id; the reserved id renders as `""`.
    pub fn token(&self, id: AffId) -> &str {
        if id.is_none() {
            return "";
        }
        self.entries.get(&id).map(|e| e.token.as_str()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ------------------------------------------------------------------
    // Reference tracking
    // ------------------------------------------------------------------

    pub fn add_pending_job(&mut self, id: AffId, job: JobId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pending_jobs.insert(job);
        }
    }

    pub fn remove_pending_job(&mut self, id: AffId, job: JobId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pending_jobs.remove(&job);
        }
    }

    pub fn add_done_job(&mut self, id: AffId, job: JobId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.done_jobs.insert(job);
        }
    }

    pub fn remove_done_job(&mut self, id: AffId, job: JobId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.done_jobs.remove(&job);
        }
    }

    /// Pending jobs currently carrying this affinity.
    pub fn pending_jobs(&self, id: AffId) -> impl Iterator<Item = JobId> + '_ {
        self.entries
            .get(&id)
            .into_iter()
            .flat_map(|e| e.pending_jobs.iter().copied())
    }

    pub fn has_pending_job(&self, id: AffId, job: JobId) -> bool {
        self.entries
            .get(&id)
            .map(|e| e.pending_jobs.contains(&job))
            .unwrap_or(false)
    }

    pub fn add_job_ref(&mut self, id: AffId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.job_refs += 1;
        }
    }

    pub fn release_job_ref(&mut self, id: AffId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.job_refs = entry.job_refs.saturating_sub(1);
        }
    }

    pub fn add_waiter_ref(&mut self, id: AffId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.waiter_refs += 1;
        }
    }

    pub fn release_waiter_ref(&mut self, id: AffId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.waiter_refs = entry.waiter_refs.saturating_sub(1);
        }
    }

    // ------------------------------------------------------------------
    // Preferred-by tracking
    // ------------------------------------------------------------------

    pub fn add_preference(&mut self, role: ConsumerRole, node: &str, id: AffId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            match role {
                ConsumerRole::Worker => entry.preferred_by_workers.insert(node.to_string()),
                ConsumerRole::Reader => entry.preferred_by_readers.insert(node.to_string()),
            };
        }
    }

    pub fn remove_preference(&mut self, role: ConsumerRole, node: &str, id: AffId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            match role {
                ConsumerRole::Worker => entry.preferred_by_workers.remove(node),
                ConsumerRole::Reader => entry.preferred_by_readers.remove(node),
            };
        }
    }

    /// True when any client prefers this affinity for `role`. Drives the
    /// exclusive-new-affinity dispatch path.
    pub fn preferred_by_any(&self, role: ConsumerRole, id: AffId) -> bool {
        self.entries
            .get(&id)
            .map(|e| match role {
                ConsumerRole::Worker => !e.preferred_by_workers.is_empty(),
                ConsumerRole::Reader => !e.preferred_by_readers.is_empty(),
            })
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    fn dirty_count(&self) -> usize {
        self.entries.values().filter(|e| !e.referenced()).count()
    }

    /// Bulk-collect unreferenced entries. Triggered when occupancy exceeds
    /// the high watermark (collects down to the low watermark) or when the
    /// dirty share alone crosses the dirt threshold.
    ///
    /// Returns the number of collected tokens.
    pub fn gc(&mut self) -> usize {
        let occupancy = self.entries.len();
        let over_high = occupancy > self.limits.high_mark();
        let too_dirty = self.dirty_count() > self.limits.dirt_mark();
        if !over_high && !too_dirty {
            return 0;
        }

        let target = if over_high {
            self.limits.low_mark()
        } else {
            occupancy.saturating_sub(self.dirty_count())
        };

        let mut victims: Vec<AffId> = self
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

    fn limits(max: usize) -> RegistryLimits {
        RegistryLimits {
            max_tokens: max,
            high_mark_percentage: 90,
            low_mark_percentage: 50,
            dirt_percentage: 20,
        }
    }

    #[test]
    fn test_no_affinity_normalization() {
        let mut reg = AffinityRegistry::new(limits(100));
        assert_eq!(reg.resolve(""), AffId::NONE);
        assert_eq!(reg.resolve("-"), AffId::NONE);
        assert_eq!(reg.token(AffId::NONE), "");
        assert!(reg.is_empty());
    }

    #[test]
    fn test_interning_is_stable() {
        let mut reg = AffinityRegistry::new(limits(100));
        let a = reg.resolve("blast");
        let b = reg.resolve("blast");
        assert_eq!(a, b);
        assert_eq!(reg.token(a), "blast");
        assert_eq!(reg.find("blast"), Some(a));
        assert_eq!(reg.find("missing"), None);
    }

    #[test]
    fn test_preferred_by_any_per_role() {
        let mut reg = AffinityRegistry::new(limits(100));
        let a = reg.resolve("a1");
        assert!(!reg.preferred_by_any(ConsumerRole::Worker, a));
        reg.add_preference(ConsumerRole::Worker, "node1", a);
        assert!(reg.preferred_by_any(ConsumerRole::Worker, a));
        assert!(!reg.preferred_by_any(ConsumerRole::Reader, a));
        reg.remove_preference(ConsumerRole::Worker, "node1", a);
        assert!(!reg.preferred_by_any(ConsumerRole::Worker, a));
    }

    #[test]
    fn test_gc_keeps_referenced_entries() {
        let mut reg = AffinityRegistry::new(limits(10));
        let kept = reg.resolve("kept");
        reg.add_pending_job(kept, JobId::new(1));
        for i in 0..9 {
            reg.resolve(&format!("dead{}", i));
        }
        // 10 entries > high mark (9): collect down to low mark (5).
        let collected = reg.gc();
        assert!(collected >= 5, "collected {}", collected);
        assert_eq!(reg.find("kept"), Some(kept));
        assert!(reg.len() <= 5);
    }

    #[test]
    fn test_gc_noop_under_watermark() {
        let mut reg = AffinityRegistry::new(limits(100));
        reg.resolve("a");
        reg.resolve("b");
        assert_eq!(reg.gc(), 0);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_pending_job_index() {
        let mut reg = AffinityRegistry::new(limits(100));
        let a = reg.resolve("a1");
        reg.add_pending_job(a, JobId::new(3));
        reg.add_pending_job(a, JobId::new(1));
        assert!(reg.has_pending_job(a, JobId::new(1)));
        let ids: Vec<u32> = reg.pending_jobs(a).map(JobId::as_u32).collect();
        assert_eq!(ids, vec![1, 3]);
        reg.remove_pending_job(a, JobId::new(1));
        assert!(!reg.has_pending_job(a, JobId::new(1)));
    }
}
