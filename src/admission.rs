//! Admission control for the global job concurrency budget.
//!
//! At most `limit` jobs hold a slot at once. Submissions beyond that wait in a pending list,
//! ordered by priority then submission order, and are admitted as slots free up.

use crate::types::{JobId, Priority};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { slot: usize },
    /// Waiting; `position` is 0 for the next job to be admitted
    Queued { position: usize },
}

#[derive(Debug, Clone, Copy)]
struct PendingJob {
    job_id: JobId,
    priority: Priority,
    seq: u64,
}

#[derive(Debug, Default)]
struct AdmissionState {
    active: HashMap<JobId, usize>,
    free_slots: BTreeSet<usize>,
    pending: Vec<PendingJob>,
    next_seq: u64,
}

impl AdmissionState {
    /// Keep `pending` sorted: higher priority first, then older first.
    fn insert_pending(&mut self, job: PendingJob) -> usize {
        let position = self
            .pending
            .iter()
            .position(|p| p.priority < job.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, job);
        position
    }
}

pub struct AdmissionController {
    limit: usize,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            state: Mutex::new(AdmissionState {
                free_slots: (0..limit).collect(),
                ..AdmissionState::default()
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admit `job_id` now if a slot is free, otherwise queue it.
    pub fn request(&self, job_id: JobId, priority: Priority) -> Admission {
        let mut state = self.state.lock();
        if let Some(slot) = state.active.get(&job_id) {
            return Admission::Admitted { slot: *slot };
        }
        if let Some(position) = state.pending.iter().position(|p| p.job_id == job_id) {
            return Admission::Queued { position };
        }
        // queued jobs go first
        if state.pending.is_empty() {
            if let Some(slot) = state.free_slots.pop_first() {
                state.active.insert(job_id, slot);
                return Admission::Admitted { slot };
            }
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        let position = state.insert_pending(PendingJob {
            job_id,
            priority,
            seq,
        });
        Admission::Queued { position }
    }

    /// Free the slot held by `job_id` and admit waiting jobs into free slots.
    pub fn release(&self, job_id: &JobId) -> Vec<(JobId, usize)> {
        let mut state = self.state.lock();
        if let Some(slot) = state.active.remove(job_id) {
            state.free_slots.insert(slot);
        }
        let mut admitted = Vec::new();
        while !state.pending.is_empty() {
            let Some(slot) = state.free_slots.pop_first() else {
                break;
            };
            let next = state.pending.remove(0);
            state.active.insert(next.job_id, slot);
            admitted.push((next.job_id, slot));
        }
        admitted
    }

    /// Drop a job from the pending list. Returns whether it was waiting.
    pub fn withdraw(&self, job_id: &JobId) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|p| p.job_id != *job_id);
        state.pending.len() != before
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.state.lock().active.contains_key(job_id)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Pending job ids in admission order.
    pub fn pending_jobs(&self) -> Vec<JobId> {
        let state = self.state.lock();
        let mut pending = state.pending.clone();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        pending.into_iter().map(|p| p.job_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn admits_up_to_limit_then_queues() {
        let admission = AdmissionController::new(2);
        let jobs: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        assert!(matches!(admission.request(jobs[0], Priority::Normal), Admission::Admitted { .. }));
        assert!(matches!(admission.request(jobs[1], Priority::Normal), Admission::Admitted { .. }));
        assert_eq!(
            admission.request(jobs[2], Priority::Normal),
            Admission::Queued { position: 0 }
        );
        assert_eq!(admission.active_count(), 2);

        let admitted = admission.release(&jobs[0]);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].0, jobs[2]);
        assert!(admission.is_active(&jobs[2]));
        assert_eq!(admission.pending_count(), 0);
    }

    #[test]
    fn pending_order_is_priority_then_fifo() {
        let admission = AdmissionController::new(1);
        admission.request(JobId::new(), Priority::Normal);
        let first_low = JobId::new();
        let second_low = JobId::new();
        let urgent = JobId::new();
        admission.request(first_low, Priority::Low);
        admission.request(second_low, Priority::Low);
        assert_eq!(admission.request(urgent, Priority::Urgent), Admission::Queued { position: 0 });
        assert_eq!(admission.pending_jobs(), vec![urgent, first_low, second_low]);
    }

    #[test]
    fn withdrawn_job_is_never_admitted() {
        let admission = AdmissionController::new(1);
        let running = JobId::new();
        let waiting = JobId::new();
        admission.request(running, Priority::Normal);
        admission.request(waiting, Priority::Normal);
        assert!(admission.withdraw(&waiting));
        assert!(admission.release(&running).is_empty());
        assert_eq!(admission.active_count(), 0);
    }

    proptest! {
        #[test]
        fn active_jobs_never_exceed_limit(limit in 1usize..8, ops in proptest::collection::vec(any::<bool>(), 1..100)) {
            let admission = AdmissionController::new(limit);
            let mut active: Vec<JobId> = Vec::new();
            for submit in ops {
                if submit || active.is_empty() {
                    let job = JobId::new();
                    if let Admission::Admitted { .. } = admission.request(job, Priority::Normal) {
                        active.push(job);
                    }
                } else {
                    let job = active.remove(0);
                    for (admitted, _) in admission.release(&job) {
                        active.push(admitted);
                    }
                }
                prop_assert!(admission.active_count() <= limit);
                prop_assert_eq!(admission.active_count(), active.len());
            }
        }
    }
}
