//! Dispatcher: matches a waiting consumer to an eligible job.
//!
//! The same eligibility predicate serves two callers: the synchronous
//! GET/READ path (scan the Pending/Done index and claim the winner) and the
//! waiter wake path (check one newly eligible job against parked waiters).

use crate::affinity::{AffId, AffinityRegistry};
use crate::clients::ClientRegistry;
use crate::group::GroupId;
use crate::job::Job;
use crate::status::StatusMatrix;
use crate::store::JobStore;
use crate::waiters::Waiter;
use chrono::{DateTime, Utc};
use netsched_protocol::command::DispatchFlags;
use netsched_protocol::{ConsumerRole, JobId, JobStatus};

/// One dispatch attempt.
#[derive(Debug)]
pub struct DispatchRequest<'a> {
    pub node: &'a str,
    pub scope: &'a str,
    pub role: ConsumerRole,
    pub explicit_affinities: &'a [AffId],
    pub groups: &'a [GroupId],
    pub flags: DispatchFlags,
    pub now: DateTime<Utc>,
}

/// The chosen job, plus the affinity claimed through the
/// exclusive-new-affinity path (to be added to the caller's preferred set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub job_id: JobId,
    pub claimed_affinity: Option<AffId>,
}

/// Rank of an affinity match; lower wins. Only meaningful under
/// `prioritized_affinity`, where explicit list positions order candidates
/// and any-affinity matches sort last.
type Rank = usize;

const RANK_ANY: Rank = usize::MAX;

/// Evaluate the affinity predicate for one job, in the specified order:
/// explicit list, preferred set, exclusive-new, any.
fn affinity_rank(
    job_aff: AffId,
    explicit: &[AffId],
    preferred: Option<&std::collections::HashSet<AffId>>,
    affinities: &AffinityRegistry,
    role: ConsumerRole,
    flags: DispatchFlags,
) -> Option<(Rank, Option<AffId>)> {
    if let Some(pos) = explicit.iter().position(|a| *a == job_aff) {
        let rank = if flags.prioritized_affinity { pos } else { 0 };
        return Some((rank, None));
    }
    if flags.use_preferred {
        if let Some(prefs) = preferred {
            if prefs.contains(&job_aff) {
                return Some((0, None));
            }
        }
    }
    if flags.exclusive_new_affinity
        && !job_aff.is_none()
        && !affinities.preferred_by_any(role, job_aff)
    {
        return Some((0, Some(job_aff)));
    }
    if flags.any_affinity {
        return Some((RANK_ANY, None));
    }
    None
}

fn job_eligible(
    job: &Job,
    req: &DispatchRequest<'_>,
    clients: &ClientRegistry,
    affinities: &AffinityRegistry,
) -> Option<(Rank, Option<AffId>)> {
    if !req.groups.is_empty() && !req.groups.contains(&job.group_id) {
        return None;
    }
    if job.scope != req.scope {
        return None;
    }
    if clients.is_blacklisted(req.node, req.role, job.id, req.now) {
        return None;
    }
    let preferred = clients.preferred(req.node, req.role);
    affinity_rank(
        job.affinity_id,
        req.explicit_affinities,
        preferred,
        affinities,
        req.role,
        req.flags,
    )
}

/// Scan the Pending (Worker) or Done (Reader) index for the best eligible
/// job. Candidates are taken in ascending id order; under
/// `prioritized_affinity` they are first grouped by explicit-list position.
pub fn select_job(
    matrix: &StatusMatrix,
    store: &JobStore,
    clients: &ClientRegistry,
    affinities: &AffinityRegistry,
    req: &DispatchRequest<'_>,
) -> Option<Selection> {
    let source = match req.role {
        ConsumerRole::Worker => JobStatus::Pending,
        ConsumerRole::Reader => JobStatus::Done,
    };

    let mut best: Option<(Rank, JobId, Option<AffId>)> = None;
    for id in matrix.ids(source) {
        let Some(job) = store.get(id) else { continue };
        let Some((rank, claim)) = job_eligible(job, req, clients, affinities) else {
            continue;
        };
        if !req.flags.prioritized_affinity {
            // Ascending ids: the first eligible job wins outright.
            return Some(Selection {
                job_id: id,
                claimed_affinity: claim,
            });
        }
        match &best {
            Some((best_rank, _, _)) if *best_rank <= rank => {}
            _ => best = Some((rank, id, claim)),
        }
        if let Some((0, _, _)) = best {
            break;
        }
    }

    best.map(|(_, job_id, claimed_affinity)| Selection {
        job_id,
        claimed_affinity,
    })
}

/// Does a newly eligible `job` match a parked `waiter`? Mirrors
/// [`select_job`]'s predicate; no affinity is claimed at notify time.
pub fn waiter_matches(
    job: &Job,
    waiter: &Waiter,
    clients: &ClientRegistry,
    affinities: &AffinityRegistry,
    now: DateTime<Utc>,
) -> bool {
    if waiter.deadline <= now {
        return false;
    }
    if !waiter.groups.is_empty() && !waiter.groups.contains(&job.group_id) {
        return false;
    }
    if clients.is_blacklisted(&waiter.node, waiter.role, job.id, now) {
        return false;
    }
    let preferred = clients.preferred(&waiter.node, waiter.role);
    affinity_rank(
        job.affinity_id,
        &waiter.explicit_affinities,
        preferred,
        affinities,
        waiter.role,
        waiter.flags,
    )
    .is_some()
}
