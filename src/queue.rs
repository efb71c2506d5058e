//! Work Queue
//!
//! Priority-partitioned queue shared by the orchestrator (producer) and the worker pool
//! (consumers). One partition per unit class so chapter units never wait behind long export
//! units. Within a partition, higher effective priority first, then FIFO by enqueue order.
//! Units of jobs close to their SLA deadline get a one-level boost. Retried units wait in
//! their partition until their backoff delay has passed.

use crate::job::{Unit, UnitClass, UnitKind};
use crate::types::{JobId, Priority, UnitId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// A unit waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub unit_id: UnitId,
    pub job_id: JobId,
    pub kind: UnitKind,
    pub priority: Priority,
    pub sla_deadline: Option<DateTime<Utc>>,
    /// Not eligible before this instant (backoff)
    pub not_before: Option<Instant>,
    seq: u64,
}

impl QueueEntry {
    pub fn new(unit_id: UnitId, job_id: JobId, kind: UnitKind, priority: Priority) -> Self {
        Self {
            unit_id,
            job_id,
            kind,
            priority,
            sla_deadline: None,
            not_before: None,
            seq: 0,
        }
    }

    pub fn for_unit(unit: &Unit, sla_deadline: Option<DateTime<Utc>>) -> Self {
        let mut entry = Self::new(unit.id, unit.job_id, unit.kind, unit.priority);
        entry.sla_deadline = sla_deadline;
        entry
    }

    /// Priority after the SLA boost.
    pub fn effective_priority(&self, now: DateTime<Utc>, boost_window: chrono::Duration) -> Priority {
        match self.sla_deadline {
            Some(deadline) if now + boost_window >= deadline => self.priority.boosted(),
            _ => self.priority,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

/// How a claimed unit left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Completed,
    Failed,
    /// Re-enqueued for another attempt
    Retrying,
    /// Dropped without running (cancelled job)
    Dropped,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries ready to run
    pub pending: usize,
    /// Entries waiting out a backoff delay
    pub delayed: usize,
    /// Claimed entries not yet released
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    partitions: [VecDeque<QueueEntry>; 5],
    /// Running chapter units per job
    chapter_running: HashMap<JobId, usize>,
    running: usize,
    completed: usize,
    failed: usize,
    next_seq: u64,
    /// Partition to prefer on the next priority tie
    cursor: usize,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    per_job_fanout_limit: usize,
    sla_boost_window: chrono::Duration,
    closed: AtomicBool,
}

impl WorkQueue {
    pub fn new(per_job_fanout_limit: usize, sla_boost_window: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            per_job_fanout_limit: per_job_fanout_limit.max(1),
            sla_boost_window: chrono::Duration::from_std(sla_boost_window)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue for immediate dispatch.
    pub fn enqueue(&self, entry: QueueEntry) -> bool {
        self.push(entry, None)
    }

    /// Enqueue, eligible only after `delay`.
    pub fn enqueue_delayed(&self, entry: QueueEntry, delay: Duration) -> bool {
        self.push(entry, Some(Instant::now() + delay))
    }

    fn push(&self, mut entry: QueueEntry, not_before: Option<Instant>) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut state = self.state.lock();
            state.next_seq += 1;
            entry.seq = state.next_seq;
            entry.not_before = not_before;
            debug!(
                unit_id = %entry.unit_id,
                job_id = %entry.job_id,
                kind = %entry.kind,
                priority = ?entry.priority,
                delayed = not_before.is_some(),
                "Enqueued unit"
            );
            state.partitions[entry.kind.class().index()].push_back(entry);
        }
        self.notify.notify_one();
        true
    }

    /// Atomically claim the best eligible entry, if any.
    pub fn try_claim(&self) -> Option<QueueEntry> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut state = self.state.lock();

        // best (priority, seq, position) per partition
        let mut best: [Option<(Priority, u64, usize)>; 5] = [None; 5];
        for class in UnitClass::ALL {
            let partition = &state.partitions[class.index()];
            for (position, entry) in partition.iter().enumerate() {
                if !entry.is_ready(now) {
                    continue;
                }
                if class == UnitClass::Chapter {
                    let running = state.chapter_running.get(&entry.job_id).copied().unwrap_or(0);
                    if running >= self.per_job_fanout_limit {
                        continue;
                    }
                }
                let priority = entry.effective_priority(wall_now, self.sla_boost_window);
                let better = match best[class.index()] {
                    None => true,
                    Some((p, seq, _)) => priority > p || (priority == p && entry.seq < seq),
                };
                if better {
                    best[class.index()] = Some((priority, entry.seq, position));
                }
            }
        }

        let top = best.iter().flatten().map(|(p, _, _)| *p).max()?;
        let cursor = state.cursor;
        let chosen = (0..best.len())
            .map(|offset| (cursor + offset) % best.len())
            .find(|i| matches!(best[*i], Some((p, _, _)) if p == top))?;
        let (_, _, position) = best[chosen]?;

        let entry = state.partitions[chosen].remove(position)?;
        state.cursor = (chosen + 1) % best.len();
        state.running += 1;
        if entry.kind.class() == UnitClass::Chapter {
            *state.chapter_running.entry(entry.job_id).or_insert(0) += 1;
        }
        Some(entry)
    }

    /// Return a claimed entry's fan-out slot and record how it ended.
    pub fn release(&self, entry: &QueueEntry, release: Release) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            if entry.kind.class() == UnitClass::Chapter {
                if let Some(running) = state.chapter_running.get_mut(&entry.job_id) {
                    *running = running.saturating_sub(1);
                    if *running == 0 {
                        state.chapter_running.remove(&entry.job_id);
                    }
                }
            }
            match release {
                Release::Completed => state.completed += 1,
                Release::Failed => state.failed += 1,
                Release::Retrying | Release::Dropped => {}
            }
        }
        // a freed fan-out slot may unblock a sibling chapter
        self.notify.notify_one();
    }

    /// Remove every waiting entry of a job.
    pub fn purge_job(&self, job_id: &JobId) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        let mut purged = Vec::new();
        for partition in state.partitions.iter_mut() {
            let (removed, kept): (VecDeque<QueueEntry>, VecDeque<QueueEntry>) =
                partition.drain(..).partition(|e| e.job_id == *job_id);
            *partition = kept;
            purged.extend(removed);
        }
        purged
    }

    /// Wait for new work, at most `max_wait` or until the next delayed entry is due.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let wait = self
            .next_due()
            .map(|due| due.min(max_wait))
            .unwrap_or(max_wait);
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = sleep(wait) => {}
        }
    }

    fn next_due(&self) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock();
        state
            .partitions
            .iter()
            .flatten()
            .filter_map(|e| e.not_before)
            .map(|at| at.saturating_duration_since(now))
            .min()
    }

    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let state = self.state.lock();
        let (pending, delayed) = state
            .partitions
            .iter()
            .flatten()
            .fold((0, 0), |(pending, delayed), e| {
                if e.is_ready(now) {
                    (pending + 1, delayed)
                } else {
                    (pending, delayed + 1)
                }
            });
        QueueStats {
            pending,
            delayed,
            running: state.running,
            completed: state.completed,
            failed: state.failed,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().partitions.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new entries and wake every waiting worker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
