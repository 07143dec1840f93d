//! The public face of the scheduling core: enqueue a job, match a
//! resource offer against the queues, and keep priorities and empty
//! queues tidy. Coordination between concurrent enqueuers and matchers
//! rests on two store primitives only: the Enabled counter and the
//! atomic pop.

use std::sync::Arc;

use rand::Rng;

use crate::config::TqConfig;
use crate::error::{Result, TqError};
use crate::matcher;
use crate::registry::{GroupRegistry, IdentityCorrector, SharesCorrector, StaticRegistry};
use crate::sharing::{hack_priority, FairShareCorrector};
use crate::store::TaskQueueStore;
use crate::types::{
    CleanupReport, JobDescription, JobId, MatchOutcome, MatchRequest, PoppedJob, QueueFilter,
    TaskQueueSummary, TqId,
};

pub struct TaskQueueEngine {
    store: Arc<TaskQueueStore>,
    registry: Arc<dyn GroupRegistry>,
    corrector: FairShareCorrector,
    config: TqConfig,
}

impl TaskQueueEngine {
    pub fn new(config: TqConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(StaticRegistry::new()),
            Arc::new(IdentityCorrector),
        )
    }

    pub fn with_collaborators(
        config: TqConfig,
        registry: Arc<dyn GroupRegistry>,
        shares: Arc<dyn SharesCorrector>,
    ) -> Self {
        let store = Arc::new(TaskQueueStore::new(&config));
        let corrector = FairShareCorrector::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            shares,
            config.clone(),
        );
        Self {
            store,
            registry,
            corrector,
            config,
        }
    }

    /// Direct access to the store, for monitoring and tests.
    pub fn store(&self) -> &TaskQueueStore {
        &self.store
    }

    /// Enqueue a job: find or create the queue matching its requirements
    /// and insert it with its clamped selection weight.
    ///
    /// The chosen queue is disabled while the job row is written and
    /// re-enabled afterwards no matter what, so the matching engine never
    /// pops from a queue mid-insert and a failed insert cannot leave the
    /// queue stuck.
    pub fn insert_job(&self, job_id: JobId, description: &JobDescription) -> Result<TqId> {
        description.validate()?;
        let bucket = self.config.quantize_cpu_time(description.cpu_time);
        let vo = self.registry.vo_for_group(&description.owner_group);
        let definition = description.to_definition(vo, bucket);

        // Find-and-claim loop: disabling an existing queue claims it
        // against concurrent matchers. Losing that race is retryable; a
        // missing or full queue is not.
        let mut claimed = None;
        for _ in 0..self.config.find_queue_retries.max(1) {
            let candidate = self
                .store
                .find_exact(&definition)
                .into_iter()
                .find(|&(_, count)| count < self.config.max_jobs_per_queue);
            let Some((tq_id, _)) = candidate else {
                break;
            };
            if self.store.set_enabled(tq_id, false) {
                claimed = Some(tq_id);
                break;
            }
        }

        let (tq_id, created) = match claimed {
            Some(tq_id) => (tq_id, false),
            None => (self.store.create_queue(definition.clone()), true),
        };

        let real_priority = hack_priority(description.priority, self.config.priority_bounds);
        let inserted = self
            .store
            .upsert_job(job_id, tq_id, description.priority, real_priority);
        // Always re-enable: this is the pairing guarantee of the Enabled
        // protocol. For a freshly created queue this is the first enable.
        self.store.set_enabled(tq_id, true);
        inserted?;

        tracing::info!(job_id, tq_id, "Job enqueued");
        if created {
            self.corrector
                .recalculate_owner_group(&definition.owner, &definition.owner_group);
        }
        Ok(tq_id)
    }

    /// Remove a job outside the match path (killed or rescheduled
    /// elsewhere). Returns whether this call removed it, and schedules a
    /// delayed empty check for the vacated queue.
    pub fn delete_job(&self, job_id: JobId) -> bool {
        match self.store.pop_job(job_id) {
            Some(tq_id) => {
                tracing::info!(job_id, tq_id, "Job deleted");
                self.store.schedule_empty_check(tq_id);
                true
            }
            None => false,
        }
    }

    /// Match a resource offer against the queues and atomically pop one
    /// job from the winning queue.
    ///
    /// Outcomes are three-way: a popped job, `NoMatch` when nothing
    /// currently matches (legitimate and terminal), or the
    /// `MatchRetriesExhausted` error when candidates existed on every
    /// attempt but every pop was lost to contention — callers may back
    /// off and retry that one.
    pub fn match_and_get_job(
        &self,
        request: &MatchRequest,
        filters: &[QueueFilter],
    ) -> Result<MatchOutcome> {
        request.validate()?;

        // Compare CPU time in bucket space, consistent with the rounding
        // applied at enqueue time.
        let mut request = request.clone();
        request.cpu_time = self.config.quantize_cpu_time(request.cpu_time);

        let attempts = self.config.max_match_retries.max(1);
        let mut rng = rand::thread_rng();
        for attempt in 0..attempts {
            let candidates = self.select_candidate_queues(&request, filters, &mut rng);
            if candidates.is_empty() {
                tracing::debug!(attempt, "No matching task queues");
                return Ok(MatchOutcome::NoMatch);
            }
            for tq_id in candidates {
                if let Some(job_id) = self.pop_from_queue(tq_id, &mut rng) {
                    tracing::info!(job_id, tq_id, "Job matched and popped");
                    // Opportunistic cleanup: if that was the last job, the
                    // delayed check will collect the queue.
                    self.store.schedule_empty_check(tq_id);
                    return Ok(MatchOutcome::Matched(PoppedJob { job_id, tq_id }));
                }
            }
            // Every candidate was stale or lost to a concurrent matcher;
            // new queues may be selectable by now.
            tracing::debug!(attempt, "All candidate queues empty or contended, retrying");
        }
        Err(TqError::MatchRetriesExhausted(attempts))
    }

    /// Pick the candidate queues for one attempt, best first. A pinned
    /// job id bypasses attribute matching entirely; otherwise candidates
    /// are the matching enabled queues in weighted-shuffle order, capped
    /// at `queues_per_match`.
    fn select_candidate_queues(
        &self,
        request: &MatchRequest,
        filters: &[QueueFilter],
        rng: &mut impl Rng,
    ) -> Vec<TqId> {
        if let Some(job_id) = request.job_id {
            return self
                .store
                .enabled_queue_of_job(job_id)
                .map(|(tq_id, _)| vec![tq_id])
                .unwrap_or_default();
        }

        let check_owner = !self.registry.has_job_sharing(&request.owner_group);
        // Weighted shuffle: dividing a uniform draw by the weight biases
        // low keys, hence early positions, toward high-priority queues.
        let mut keyed: Vec<(f64, TqId)> = self
            .store
            .enabled_queues()
            .into_iter()
            .filter(|q| {
                matcher::matches(&q.definition, request, check_owner)
                    && matcher::passes_filters(&q.definition, filters)
            })
            .map(|q| {
                let weight = q.priority.max(crate::config::TQ_MIN_SHARE);
                (rng.gen::<f64>() / weight, q.tq_id)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
        keyed.truncate(self.config.queues_per_match);
        keyed.into_iter().map(|(_, id)| id).collect()
    }

    /// Try to pop one job from a queue: pick a priority level by weighted
    /// random draw, fetch a bounded slice of jobs at that level, then pop
    /// random picks until one delete succeeds. `None` means the queue was
    /// stale or every pop lost its race.
    fn pop_from_queue(&self, tq_id: TqId, rng: &mut impl Rng) -> Option<JobId> {
        let weights = self.store.job_weights(tq_id);
        let Some(level) = pick_weighted_level(&weights, rng) else {
            // Apparently empty: let the delayed check decide whether the
            // queue should go away.
            self.store.schedule_empty_check(tq_id);
            return None;
        };

        let mut pool = self
            .store
            .jobs_at_level(tq_id, level, self.config.jobs_per_match.max(1));
        if pool.is_empty() {
            self.store.schedule_empty_check(tq_id);
            return None;
        }
        while !pool.is_empty() {
            let picked = pool.swap_remove(rng.gen_range(0..pool.len()));
            if self.store.pop_job(picked).is_some() {
                return Some(picked);
            }
            // Zero rows affected: another matcher won, try the rest.
        }
        None
    }

    /// Run the delayed empty checks that have come due, deleting queues
    /// that are still empty and recalculating shares for the vacated
    /// owners. Best-effort: queues that refuse deletion are just skipped.
    pub fn process_empty_checks(&self) {
        for tq_id in self.store.due_empty_checks() {
            if let Some((owner, group)) = self.store.delete_if_empty(tq_id) {
                self.corrector.recalculate_owner_group(&owner, &group);
            }
        }
    }

    /// Delete one queue if it is live and empty, with the recalculation
    /// side effect. No-ops on missing or still-populated queues.
    pub fn delete_queue_if_empty(&self, tq_id: TqId) -> bool {
        match self.store.delete_if_empty(tq_id) {
            Some((owner, group)) => {
                self.corrector.recalculate_owner_group(&owner, &group);
                true
            }
            None => false,
        }
    }

    /// Consistency repair: drop enabled-but-empty queues and dangling job
    /// rows left behind by partial failures.
    pub fn clean_orphaned_queues(&self) -> CleanupReport {
        self.store.clean_orphaned()
    }

    /// Recompute the priority of every task queue.
    pub fn recalculate_priorities(&self) {
        self.corrector.recalculate_all();
    }

    pub fn recalculate_group_priorities(&self, group: &str) {
        self.corrector.recalculate_group(group);
    }

    /// Read-only snapshot for monitoring callers.
    pub fn retrieve_task_queues(&self) -> Vec<TaskQueueSummary> {
        self.store.summaries()
    }
}

/// Weighted-random pick of a priority level: the winning job's weight is
/// the level that will be extracted, not yet the job itself.
fn pick_weighted_level(weights: &[(JobId, f64)], rng: &mut impl Rng) -> Option<f64> {
    weights
        .iter()
        .map(|&(_, w)| (rng.gen::<f64>() / w.max(f64::MIN_POSITIVE), w))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, w)| w)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_level_pick_prefers_heavy_weights() {
        let mut rng = rand::thread_rng();
        let weights = vec![(1, 1e-5), (2, 1e6)];
        // The 1e6 weight should win essentially always.
        let mut heavy_wins = 0;
        for _ in 0..100 {
            if pick_weighted_level(&weights, &mut rng) == Some(1e6) {
                heavy_wins += 1;
            }
        }
        assert!(heavy_wins > 90);
    }

    #[test]
    fn weighted_level_pick_empty() {
        let mut rng = rand::thread_rng();
        assert_eq!(pick_weighted_level(&[], &mut rng), None);
    }
}
