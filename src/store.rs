//! Ownership of the task queue and job-in-queue entities. Every public
//! operation is a single critical section, mirroring the one-atomic-
//! statement discipline the concurrent enqueue/match protocols rely on:
//! callers never observe a half-applied mutation, and the only cross-call
//! coordination primitives are the Enabled counter and the pop-by-job-id
//! affected-count check.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::{TqConfig, WeightAggregation};
use crate::error::{Result, TqError};
use crate::types::{CleanupReport, JobId, TaskQueueDefinition, TaskQueueSummary, TqId};

/// One pending job's membership in exactly one task queue.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub tq_id: TqId,
    /// User-supplied integer priority.
    pub priority: i64,
    /// Clamped weight used for weighted-random selection.
    pub real_priority: f64,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct QueueRecord {
    definition: TaskQueueDefinition,
    priority: f64,
    /// Counter, not a flag: "number of outstanding reasons to consider
    /// this queue". Matching requires >= 1. May drift negative transiently
    /// under contention; callers always pair a disable with a re-enable.
    enabled: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreInner {
    queues: HashMap<TqId, QueueRecord>,
    jobs: HashMap<JobId, JobEntry>,
    queue_jobs: HashMap<TqId, BTreeSet<JobId>>,
    next_id: TqId,
}

/// Debounced best-effort scheduler for "is this queue empty now?" checks.
/// Owned by the store, sized and paced by injected configuration.
#[derive(Debug)]
struct EmptyCheckScheduler {
    pending: HashMap<TqId, Instant>,
    delay: Duration,
    capacity: usize,
}

impl EmptyCheckScheduler {
    fn schedule(&mut self, tq_id: TqId, now: Instant) {
        if self.pending.len() >= self.capacity && !self.pending.contains_key(&tq_id) {
            tracing::debug!(tq_id, "Empty-check scheduler full, dropping check");
            return;
        }
        self.pending.entry(tq_id).or_insert(now);
    }

    fn drain_due(&mut self, now: Instant) -> Vec<TqId> {
        let due: Vec<TqId> = self
            .pending
            .iter()
            .filter(|(_, &at)| now.duration_since(at) >= self.delay)
            .map(|(&id, _)| id)
            .collect();
        for id in &due {
            self.pending.remove(id);
        }
        due
    }
}

/// A queue snapshot handed to the matching engine.
#[derive(Debug, Clone)]
pub struct EnabledQueue {
    pub tq_id: TqId,
    pub definition: TaskQueueDefinition,
    pub priority: f64,
}

/// A queue with its aggregate job weight, for the fair-share corrector.
#[derive(Debug, Clone)]
pub struct QueueWeight {
    pub tq_id: TqId,
    pub definition: TaskQueueDefinition,
    pub weight: f64,
}

pub struct TaskQueueStore {
    inner: Mutex<StoreInner>,
    empty_checks: Mutex<EmptyCheckScheduler>,
    initial_priority: f64,
}

impl TaskQueueStore {
    pub fn new(config: &TqConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            empty_checks: Mutex::new(EmptyCheckScheduler {
                pending: HashMap::new(),
                delay: config.empty_check_delay,
                capacity: config.empty_check_capacity,
            }),
            initial_priority: crate::config::TQ_MIN_SHARE,
        }
    }

    fn locked(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find every queue structurally identical to `definition`, together
    /// with its current job count, ordered by id. Full set equality on all
    /// six multi-value dimensions, not subset/superset.
    pub fn find_exact(&self, definition: &TaskQueueDefinition) -> Vec<(TqId, usize)> {
        let inner = self.locked();
        let mut found: Vec<(TqId, usize)> = inner
            .queues
            .iter()
            .filter(|(_, rec)| rec.definition == *definition)
            .map(|(&id, _)| {
                let count = inner.queue_jobs.get(&id).map_or(0, BTreeSet::len);
                (id, count)
            })
            .collect();
        found.sort_unstable_by_key(|&(id, _)| id);
        found
    }

    /// Create a new queue for the given requirement set. The queue starts
    /// disabled (Enabled = 0) so it cannot be matched before its first job
    /// lands; the caller enables it once the insert is done.
    pub fn create_queue(&self, definition: TaskQueueDefinition) -> TqId {
        let mut inner = self.locked();
        inner.next_id += 1;
        let tq_id = inner.next_id;
        inner.queues.insert(
            tq_id,
            QueueRecord {
                definition,
                priority: self.initial_priority,
                enabled: 0,
                created_at: Utc::now(),
            },
        );
        inner.queue_jobs.insert(tq_id, BTreeSet::new());
        tracing::info!(tq_id, "Task queue created");
        tq_id
    }

    /// Atomically bump the Enabled counter up (true) or down (false).
    /// Returns false when the queue does not exist, which a claiming
    /// enqueuer treats as having lost the race.
    pub fn set_enabled(&self, tq_id: TqId, enabled: bool) -> bool {
        let mut inner = self.locked();
        match inner.queues.get_mut(&tq_id) {
            Some(rec) => {
                rec.enabled += if enabled { 1 } else { -1 };
                true
            }
            None => false,
        }
    }

    pub fn enabled_count(&self, tq_id: TqId) -> Option<i64> {
        self.locked().queues.get(&tq_id).map(|r| r.enabled)
    }

    /// Insert a job into a queue, or move it there if it already exists
    /// elsewhere (reschedule path).
    pub fn upsert_job(
        &self,
        job_id: JobId,
        tq_id: TqId,
        priority: i64,
        real_priority: f64,
    ) -> Result<()> {
        let mut inner = self.locked();
        if !inner.queues.contains_key(&tq_id) {
            return Err(TqError::QueueNotFound(tq_id));
        }
        if let Some(previous) = inner.jobs.remove(&job_id) {
            if let Some(members) = inner.queue_jobs.get_mut(&previous.tq_id) {
                members.remove(&job_id);
            }
        }
        inner.jobs.insert(
            job_id,
            JobEntry {
                tq_id,
                priority,
                real_priority,
                inserted_at: Utc::now(),
            },
        );
        inner.queue_jobs.entry(tq_id).or_default().insert(job_id);
        Ok(())
    }

    /// The atomic pop: delete keyed by job id, reporting whether this call
    /// removed the row. A `None` means another matcher won the race (or
    /// the job never existed) and the caller must try elsewhere.
    pub fn pop_job(&self, job_id: JobId) -> Option<TqId> {
        let mut inner = self.locked();
        let entry = inner.jobs.remove(&job_id)?;
        if let Some(members) = inner.queue_jobs.get_mut(&entry.tq_id) {
            members.remove(&job_id);
        }
        Some(entry.tq_id)
    }

    pub fn job_entry(&self, job_id: JobId) -> Option<JobEntry> {
        self.locked().jobs.get(&job_id).cloned()
    }

    pub fn job_count(&self, tq_id: TqId) -> usize {
        self.locked().queue_jobs.get(&tq_id).map_or(0, BTreeSet::len)
    }

    pub fn definition(&self, tq_id: TqId) -> Option<TaskQueueDefinition> {
        self.locked().queues.get(&tq_id).map(|r| r.definition.clone())
    }

    pub fn priority(&self, tq_id: TqId) -> Option<f64> {
        self.locked().queues.get(&tq_id).map(|r| r.priority)
    }

    /// Delete the queue only if it is live (Enabled >= 1) and empty.
    /// Returns the vacated (owner, group) so the caller can trigger a
    /// fair-share recalculation; `None` means nothing was deleted, which
    /// is not an error.
    pub fn delete_if_empty(&self, tq_id: TqId) -> Option<(String, String)> {
        let mut inner = self.locked();
        let deletable = match inner.queues.get(&tq_id) {
            Some(rec) => {
                rec.enabled >= 1 && inner.queue_jobs.get(&tq_id).is_none_or(BTreeSet::is_empty)
            }
            None => false,
        };
        if !deletable {
            return None;
        }
        let rec = inner.queues.remove(&tq_id)?;
        inner.queue_jobs.remove(&tq_id);
        tracing::info!(tq_id, "Empty task queue deleted");
        Some((rec.definition.owner, rec.definition.owner_group))
    }

    /// Crash-recovery sweep: drop enabled queues that hold no jobs, and
    /// purge job rows that reference queues which no longer exist. Never
    /// fails for "nothing to clean".
    pub fn clean_orphaned(&self) -> CleanupReport {
        let mut inner = self.locked();
        let mut report = CleanupReport::default();

        let empty_enabled: Vec<TqId> = inner
            .queues
            .iter()
            .filter(|&(id, rec)| {
                rec.enabled >= 1 && inner.queue_jobs.get(id).is_none_or(BTreeSet::is_empty)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in empty_enabled {
            inner.queues.remove(&id);
            inner.queue_jobs.remove(&id);
            report.queues_removed += 1;
        }

        let dangling: Vec<JobId> = inner
            .jobs
            .iter()
            .filter(|(_, entry)| !inner.queues.contains_key(&entry.tq_id))
            .map(|(&id, _)| id)
            .collect();
        for job_id in dangling {
            if let Some(entry) = inner.jobs.remove(&job_id) {
                if let Some(members) = inner.queue_jobs.get_mut(&entry.tq_id) {
                    members.remove(&job_id);
                }
            }
            report.orphan_jobs_removed += 1;
        }

        if report != CleanupReport::default() {
            tracing::info!(
                queues = report.queues_removed,
                jobs = report.orphan_jobs_removed,
                "Orphan sweep removed stale entries"
            );
        }
        report
    }

    /// Snapshot of every matchable queue (Enabled >= 1).
    pub fn enabled_queues(&self) -> Vec<EnabledQueue> {
        let inner = self.locked();
        let mut queues: Vec<EnabledQueue> = inner
            .queues
            .iter()
            .filter(|(_, rec)| rec.enabled >= 1)
            .map(|(&id, rec)| EnabledQueue {
                tq_id: id,
                definition: rec.definition.clone(),
                priority: rec.priority,
            })
            .collect();
        queues.sort_unstable_by_key(|q| q.tq_id);
        queues
    }

    /// The enabled queue holding a pinned job, if any. Used by the
    /// administrative match-this-exact-job path.
    pub fn enabled_queue_of_job(&self, job_id: JobId) -> Option<(TqId, f64)> {
        let inner = self.locked();
        let entry = inner.jobs.get(&job_id)?;
        let rec = inner.queues.get(&entry.tq_id)?;
        (rec.enabled >= 1).then_some((entry.tq_id, rec.priority))
    }

    /// (job, weight) pairs for one queue, ordered by job id.
    pub fn job_weights(&self, tq_id: TqId) -> Vec<(JobId, f64)> {
        let inner = self.locked();
        let Some(members) = inner.queue_jobs.get(&tq_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| inner.jobs.get(id).map(|e| (*id, e.real_priority)))
            .collect()
    }

    /// Jobs in a queue at one exact weight level, ordered by job id for
    /// determinism among ties, capped at `limit`.
    pub fn jobs_at_level(&self, tq_id: TqId, level: f64, limit: usize) -> Vec<JobId> {
        let inner = self.locked();
        let Some(members) = inner.queue_jobs.get(&tq_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|&id| {
                inner
                    .jobs
                    .get(id)
                    .is_some_and(|e| e.real_priority.to_bits() == level.to_bits())
            })
            .take(limit)
            .copied()
            .collect()
    }

    /// Distinct owners with at least one queue in the group.
    pub fn owners_in_group(&self, group: &str) -> BTreeSet<String> {
        self.locked()
            .queues
            .values()
            .filter(|rec| rec.definition.owner_group == group)
            .map(|rec| rec.definition.owner.clone())
            .collect()
    }

    /// Distinct owner groups with at least one queue.
    pub fn groups(&self) -> BTreeSet<String> {
        self.locked()
            .queues
            .values()
            .map(|rec| rec.definition.owner_group.clone())
            .collect()
    }

    /// Queues in a group, optionally restricted to one owner, each with
    /// its aggregate job weight. Empty queues weigh zero.
    pub fn queue_weights(
        &self,
        owner: Option<&str>,
        group: &str,
        aggregation: WeightAggregation,
    ) -> Vec<QueueWeight> {
        let inner = self.locked();
        let mut weights: Vec<QueueWeight> = inner
            .queues
            .iter()
            .filter(|(_, rec)| {
                rec.definition.owner_group == group
                    && owner.is_none_or(|o| rec.definition.owner == o)
            })
            .map(|(&id, rec)| {
                let total: f64 = inner
                    .queue_jobs
                    .get(&id)
                    .map(|members| {
                        members
                            .iter()
                            .filter_map(|j| inner.jobs.get(j))
                            .map(|e| e.real_priority)
                            .sum()
                    })
                    .unwrap_or(0.0);
                let count = inner.queue_jobs.get(&id).map_or(0, BTreeSet::len);
                let weight = match aggregation {
                    WeightAggregation::Sum => total,
                    WeightAggregation::Avg if count > 0 => total / count as f64,
                    WeightAggregation::Avg => 0.0,
                };
                QueueWeight {
                    tq_id: id,
                    definition: rec.definition.clone(),
                    weight,
                }
            })
            .collect();
        weights.sort_unstable_by_key(|q| q.tq_id);
        weights
    }

    /// Bulk priority write from the fair-share corrector. Ids that no
    /// longer exist are skipped; priorities are allowed to be transiently
    /// stale between recalculations.
    pub fn set_priorities(&self, priorities: &HashMap<TqId, f64>) {
        let mut inner = self.locked();
        for (&tq_id, &priority) in priorities {
            if let Some(rec) = inner.queues.get_mut(&tq_id) {
                rec.priority = priority;
            }
        }
    }

    pub fn schedule_empty_check(&self, tq_id: TqId) {
        self.empty_checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .schedule(tq_id, Instant::now());
    }

    /// Drain the empty checks whose delay has elapsed.
    pub fn due_empty_checks(&self) -> Vec<TqId> {
        self.empty_checks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain_due(Instant::now())
    }

    /// Monitoring view over every queue, ordered by id.
    pub fn summaries(&self) -> Vec<TaskQueueSummary> {
        let inner = self.locked();
        let mut summaries: Vec<TaskQueueSummary> = inner
            .queues
            .iter()
            .map(|(&id, rec)| TaskQueueSummary {
                tq_id: id,
                definition: rec.definition.clone(),
                priority: rec.priority,
                enabled: rec.enabled,
                job_count: inner.queue_jobs.get(&id).map_or(0, BTreeSet::len),
            })
            .collect();
        summaries.sort_unstable_by_key(|s| s.tq_id);
        summaries
    }

    pub fn queue_count(&self) -> usize {
        self.locked().queues.len()
    }

    pub fn total_jobs(&self) -> usize {
        self.locked().jobs.len()
    }

    pub fn created_at(&self, tq_id: TqId) -> Option<DateTime<Utc>> {
        self.locked().queues.get(&tq_id).map(|r| r.created_at)
    }
}
