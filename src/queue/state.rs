//! Queue bookkeeping behind the single queue mutex.
//!
//! Pure data structure: no tasks, no events, no clock reads except the
//! `now` callers pass in.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use super::{ChangeId, ChangeStatus, FailedChange, NewChange, QueueError, QueuedChange};
use crate::core::ProjectId;

enum Finished {
    Completed { retries: u32 },
    Failed(FailedChange),
}

pub(super) enum Admission {
    Queued,
    Replaced,
    /// Admitted after pushing out the lowest-priority entry.
    Evicted(QueuedChange),
}

pub(super) enum Settled {
    Completed(QueuedChange),
    Retrying {
        change: QueuedChange,
        error: QueueError,
        backoff: Duration,
    },
    Failed(FailedChange),
    /// Result of a change nobody tracks anymore.
    Unknown,
}

#[derive(Default)]
pub(super) struct QueueState {
    queued: Vec<QueuedChange>,
    in_flight: FxHashMap<ChangeId, QueuedChange>,
    busy_projects: FxHashSet<ProjectId>,
    /// In-flight changes whose project was dropped; never retried.
    orphaned: FxHashSet<ChangeId>,
    finished: FxHashMap<ChangeId, Finished>,
    finished_order: VecDeque<ChangeId>,
    next_id: u64,
    next_seq: u64,
}

impl QueueState {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(super) fn enqueue(
        &mut self,
        change: NewChange,
        max_len: usize,
        history_limit: usize,
        now: Instant,
    ) -> (ChangeId, Admission) {
        if let Some(existing) = self
            .queued
            .iter_mut()
            .find(|q| q.project_id == change.project_id && q.file_path == change.file_path)
        {
            existing.kind = change.kind;
            existing.content = change.content;
            existing.base = change.base;
            existing.priority = change.priority;
            existing.retries = 0;
            existing.not_before = None;
            return (existing.id, Admission::Replaced);
        }

        let mut admission = Admission::Queued;
        if self.queued.len() >= max_len.max(1)
            && let Some(victim) = self.lowest_priority()
        {
            let victim = self.queued.remove(victim);
            self.record_failure(
                FailedChange {
                    change: victim.clone(),
                    error: QueueError::Evicted,
                },
                history_limit,
            );
            admission = Admission::Evicted(victim);
        }

        self.next_id += 1;
        let id = ChangeId(self.next_id);
        let seq = self.seq();
        self.queued.push(QueuedChange {
            id,
            project_id: change.project_id,
            file_path: change.file_path,
            kind: change.kind,
            content: change.content,
            base: change.base,
            priority: change.priority,
            enqueued_at: now,
            retries: 0,
            seq,
            not_before: None,
        });
        (id, admission)
    }

    /// Index of the lowest-priority entry, newest among equals.
    fn lowest_priority(&self) -> Option<usize> {
        self.queued
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| (q.priority, std::cmp::Reverse(q.seq)))
            .map(|(i, _)| i)
    }

    /// Move up to `slots` eligible entries to in-flight, best first.
    ///
    /// Eligible: backoff elapsed and nothing of the same project in flight.
    pub(super) fn take_ready(&mut self, now: Instant, max_concurrent: usize) -> Vec<QueuedChange> {
        let slots = max_concurrent.saturating_sub(self.in_flight.len());
        if slots == 0 || self.queued.is_empty() {
            return Vec::new();
        }

        self.queued
            .sort_by_key(|q| (std::cmp::Reverse(q.priority), q.seq));

        let mut picked = Vec::new();
        let mut index = 0;
        while index < self.queued.len() && picked.len() < slots {
            let candidate = &self.queued[index];
            let waiting = candidate.not_before.is_some_and(|t| t > now);
            if waiting || self.busy_projects.contains(&candidate.project_id) {
                index += 1;
                continue;
            }
            let change = self.queued.remove(index);
            self.busy_projects.insert(change.project_id.clone());
            self.in_flight.insert(change.id, change.clone());
            picked.push(change);
        }
        picked
    }

    pub(super) fn complete(&mut self, id: ChangeId, history_limit: usize) -> Settled {
        let Some(change) = self.release(id) else {
            return Settled::Unknown;
        };
        self.orphaned.remove(&id);
        self.push_finished(
            id,
            Finished::Completed {
                retries: change.retries,
            },
            history_limit,
        );
        Settled::Completed(change)
    }

    pub(super) fn fail(
        &mut self,
        id: ChangeId,
        error: QueueError,
        max_retries: u32,
        backoff: impl Fn(u32) -> Duration,
        history_limit: usize,
        now: Instant,
    ) -> Settled {
        let Some(mut change) = self.release(id) else {
            return Settled::Unknown;
        };

        let orphaned = self.orphaned.remove(&id);
        let superseded = self
            .queued
            .iter()
            .any(|q| q.project_id == change.project_id && q.file_path == change.file_path);

        if change.retries < max_retries && !orphaned && !superseded {
            change.retries += 1;
            change.priority = change.priority.lowered();
            change.seq = self.seq();
            let delay = backoff(change.retries);
            change.not_before = Some(now + delay);
            self.queued.push(change.clone());
            return Settled::Retrying {
                change,
                error,
                backoff: delay,
            };
        }

        let failed = FailedChange { change, error };
        self.record_failure(failed.clone(), history_limit);
        Settled::Failed(failed)
    }

    fn release(&mut self, id: ChangeId) -> Option<QueuedChange> {
        let change = self.in_flight.remove(&id)?;
        self.busy_projects.remove(&change.project_id);
        Some(change)
    }

    fn record_failure(&mut self, failed: FailedChange, history_limit: usize) {
        self.push_finished(failed.change.id, Finished::Failed(failed), history_limit);
    }

    fn push_finished(&mut self, id: ChangeId, finished: Finished, history_limit: usize) {
        if self.finished.insert(id, finished).is_none() {
            self.finished_order.push_back(id);
        }
        while self.finished_order.len() > history_limit {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    /// Remove queued entries of a project. In-flight ones finish but are
    /// not retried.
    pub(super) fn drop_project(&mut self, project_id: &ProjectId) -> usize {
        let before = self.queued.len();
        self.queued.retain(|q| &q.project_id != project_id);
        for change in self.in_flight.values() {
            if &change.project_id == project_id {
                self.orphaned.insert(change.id);
            }
        }
        before - self.queued.len()
    }

    pub(super) fn status(&self, id: ChangeId) -> ChangeStatus {
        if self.in_flight.contains_key(&id) {
            ChangeStatus::Processing
        } else if self.queued.iter().any(|q| q.id == id) {
            ChangeStatus::Queued
        } else {
            match self.finished.get(&id) {
                Some(Finished::Completed { .. }) => ChangeStatus::Completed,
                Some(Finished::Failed(_)) => ChangeStatus::Failed,
                None => ChangeStatus::Unknown,
            }
        }
    }

    pub(super) fn retry_count(&self, id: ChangeId) -> Option<u32> {
        if let Some(change) = self.in_flight.get(&id) {
            return Some(change.retries);
        }
        if let Some(change) = self.queued.iter().find(|q| q.id == id) {
            return Some(change.retries);
        }
        match self.finished.get(&id)? {
            Finished::Completed { retries } => Some(*retries),
            Finished::Failed(failed) => Some(failed.change.retries),
        }
    }

    pub(super) fn failure(&self, id: ChangeId) -> Option<FailedChange> {
        match self.finished.get(&id)? {
            Finished::Failed(failed) => Some(failed.clone()),
            Finished::Completed { .. } => None,
        }
    }

    pub(super) fn get(&self, id: ChangeId) -> Option<QueuedChange> {
        self.in_flight
            .get(&id)
            .or_else(|| self.queued.iter().find(|q| q.id == id))
            .cloned()
    }

    pub(super) fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub(super) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub(super) fn queued_for(&self, project_id: &ProjectId) -> usize {
        self.queued
            .iter()
            .filter(|q| &q.project_id == project_id)
            .count()
    }

    pub(super) fn clear_finished(&mut self) -> usize {
        let count = self.finished.len();
        self.finished.clear();
        self.finished_order.clear();
        count
    }
}
