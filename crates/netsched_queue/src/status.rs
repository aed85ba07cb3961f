//! Status matrix: per-status sorted indexes and the transition table.

use netsched_protocol::{JobId, JobStatus};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatrixError {
    #[error("job {id} is not in the {expected} index")]
    NotInIndex { id: JobId, expected: JobStatus },
    #[error("transition {from} -> {to} is not permitted")]
    ForbiddenTransition { from: JobStatus, to: JobStatus },
}

/// True when the state machine permits `from -> to`.
///
/// Deletion (mark-deleted) is permitted from every status; everything else
/// follows the job lifecycle diagram.
pub fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    if to == Deleted {
        return true;
    }
    matches!(
        (from, to),
        // Worker path
        (Pending, Running)
            | (Running, Done)
            | (Running, Failed)
            | (Running, Pending)
            // Reader path
            | (Done, Reading)
            | (Reading, Confirmed)
            | (Reading, ReadFailed)
            | (Reading, Done)
            // Back to the well: reschedule / redo / reread
            | (Done, Pending)
            | (Failed, Pending)
            | (Canceled, Pending)
            | (Confirmed, Done)
            | (ReadFailed, Done)
            // Cancel of any non-terminal status
            | (Pending, Canceled)
            | (Running, Canceled)
            | (Done, Canceled)
            | (Reading, Canceled)
    )
}

fn index_of(status: JobStatus) -> usize {
    match status {
        JobStatus::Pending => 0,
        JobStatus::Running => 1,
        JobStatus::Canceled => 2,
        JobStatus::Failed => 3,
        JobStatus::Done => 4,
        JobStatus::Reading => 5,
        JobStatus::Confirmed => 6,
        JobStatus::ReadFailed => 7,
        JobStatus::Deleted => 8,
    }
}

/// Map from each status to the sorted set of job ids currently in it.
///
/// Every job appears in exactly one set at all observable instants; all
/// transitions go through [`StatusMatrix::set_status`], which validates the
/// move and updates both sets in one critical section (the caller holds the
/// queue lock). Iteration yields ascending ids for deterministic dispatch
/// and replay.
#[derive(Debug, Default)]
pub struct StatusMatrix {
    sets: [BTreeSet<JobId>; 9],
}

impl StatusMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly submitted job.
    pub fn insert_new(&mut self, id: JobId, status: JobStatus) {
        self.sets[index_of(status)].insert(id);
    }

    /// Move `id` from `from` to `to`, validating both the current index
    /// membership and the transition table. Any failure leaves the matrix
    /// unchanged.
    pub fn set_status(
        &mut self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<(), MatrixError> {
        if !transition_allowed(from, to) {
            return Err(MatrixError::ForbiddenTransition { from, to });
        }
        if !self.sets[index_of(from)].contains(&id) {
            return Err(MatrixError::NotInIndex { id, expected: from });
        }
        self.sets[index_of(from)].remove(&id);
        self.sets[index_of(to)].insert(id);
        Ok(())
    }

    /// Drop `id` from its index entirely (physical removal).
    pub fn remove(&mut self, id: JobId, status: JobStatus) {
        self.sets[index_of(status)].remove(&id);
    }

    pub fn contains(&self, status: JobStatus, id: JobId) -> bool {
        self.sets[index_of(status)].contains(&id)
    }

    /// Ids in `status`, ascending.
    pub fn ids(&self, status: JobStatus) -> impl Iterator<Item = JobId> + '_ {
        self.sets[index_of(status)].iter().copied()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.sets[index_of(status)].len()
    }

    /// Total live (non-terminal) jobs.
    pub fn non_terminal_count(&self) -> usize {
        JobStatus::ALL
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| self.count(*s))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions_allowed() {
        use JobStatus::*;
        for (from, to) in [
            (Pending, Running),
            (Running, Done),
            (Done, Reading),
            (Reading, Confirmed),
            (Running, Pending),
            (Running, Failed),
            (Reading, Done),
            (Reading, ReadFailed),
            (Done, Pending),
            (Failed, Pending),
            (Canceled, Pending),
            (Confirmed, Done),
            (ReadFailed, Done),
            (Pending, Canceled),
            (Running, Canceled),
        ] {
            assert!(transition_allowed(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_forbidden_transitions() {
        use JobStatus::*;
        for (from, to) in [
            (Pending, Done),
            (Pending, Reading),
            (Done, Confirmed),
            (Failed, Canceled),
            (Confirmed, Pending),
            (Canceled, Running),
            (ReadFailed, Reading),
        ] {
            assert!(!transition_allowed(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_set_status_moves_between_indexes() {
        let mut matrix = StatusMatrix::new();
        let id = JobId::new(1);
        matrix.insert_new(id, JobStatus::Pending);
        matrix.set_status(id, JobStatus::Pending, JobStatus::Running).unwrap();
        assert!(!matrix.contains(JobStatus::Pending, id));
        assert!(matrix.contains(JobStatus::Running, id));
    }

    #[test]
    fn test_set_status_rejects_and_preserves_state() {
        let mut matrix = StatusMatrix::new();
        let id = JobId::new(1);
        matrix.insert_new(id, JobStatus::Pending);

        let err = matrix
            .set_status(id, JobStatus::Pending, JobStatus::Done)
            .unwrap_err();
        assert!(matches!(err, MatrixError::ForbiddenTransition { .. }));
        assert!(matrix.contains(JobStatus::Pending, id));

        let err = matrix
            .set_status(JobId::new(99), JobStatus::Pending, JobStatus::Running)
            .unwrap_err();
        assert!(matches!(err, MatrixError::NotInIndex { .. }));
    }

    #[test]
    fn test_ids_ascending() {
        let mut matrix = StatusMatrix::new();
        for raw in [5u32, 1, 3] {
            matrix.insert_new(JobId::new(raw), JobStatus::Pending);
        }
        let ids: Vec<u32> = matrix.ids(JobStatus::Pending).map(JobId::as_u32).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
