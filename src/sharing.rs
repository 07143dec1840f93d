//! Fair-share priority correction: divide each group's configured share
//! across its active owners, then across each owner's queues weighted by
//! their aggregate job priority, with a background carve-out for queues
//! whose share would be statistically insignificant.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{TqConfig, TQ_MIN_SHARE};
use crate::registry::{GroupRegistry, SharesCorrector};
use crate::store::{QueueWeight, TaskQueueStore};
use crate::types::{TaskQueueDefinition, TqId};

/// Weight handed to jobs sitting at the exact lower priority boundary:
/// virtually never the random winner, but never excluded outright.
const LOWEST_PRIORITY_WEIGHT: f64 = 1e-5;
/// Weight for jobs at the exact upper boundary: a near-certain winner.
const HIGHEST_PRIORITY_WEIGHT: f64 = 1e6;
/// Share-weighted value at or below which a queue is demoted to the
/// background floor (when the group allows background queues).
const BACKGROUND_SHARE_THRESHOLD: f64 = 0.1;

/// Clamp a raw job priority into the configured bounds and turn it into
/// the weight used for weighted-random selection.
pub fn hack_priority(raw: i64, bounds: (f64, f64)) -> f64 {
    let (min, max) = bounds;
    let clamped = (raw as f64).clamp(min, max);
    if clamped <= min {
        LOWEST_PRIORITY_WEIGHT
    } else if clamped >= max {
        HIGHEST_PRIORITY_WEIGHT
    } else {
        clamped
    }
}

pub struct FairShareCorrector {
    store: Arc<TaskQueueStore>,
    registry: Arc<dyn GroupRegistry>,
    shares: Arc<dyn SharesCorrector>,
    config: TqConfig,
}

impl FairShareCorrector {
    pub fn new(
        store: Arc<TaskQueueStore>,
        registry: Arc<dyn GroupRegistry>,
        shares: Arc<dyn SharesCorrector>,
        config: TqConfig,
    ) -> Self {
        Self {
            store,
            registry,
            shares,
            config,
        }
    }

    /// Periodic full sweep over every group with at least one queue.
    pub fn recalculate_all(&self) {
        for group in self.store.groups() {
            self.recalculate_group(&group);
        }
    }

    /// Triggered after queue creation or deletion for an owner in the
    /// group. The owner set may have changed either way, so the whole
    /// group is always recalculated rather than just the one owner.
    pub fn recalculate_owner_group(&self, owner: &str, group: &str) {
        tracing::debug!(owner, group, "Recalculating priorities after queue change");
        self.recalculate_group(group);
    }

    /// Recompute the priority of every queue in one group.
    pub fn recalculate_group(&self, group: &str) {
        let group_share = self
            .registry
            .share_for_group(group)
            .unwrap_or(self.config.default_group_share);

        // Job-sharing groups are treated as a single scheduling entity:
        // the whole share goes to the group, ignoring owners.
        if self.registry.has_job_sharing(group) {
            self.apply_share(None, group, group_share);
            return;
        }

        let owners = self.store.owners_in_group(group);
        if owners.is_empty() {
            return;
        }
        let per_owner = group_share / owners.len() as f64;
        let mut owner_shares: BTreeMap<String, f64> =
            owners.into_iter().map(|o| (o, per_owner)).collect();
        if self.config.shares_correction_enabled {
            owner_shares = self.shares.correct_shares(&owner_shares, Some(group));
        }
        for (owner, share) in owner_shares {
            self.apply_share(Some(&owner), group, share);
        }
    }

    /// Distribute one entity's share (an owner, or a whole job-sharing
    /// group) across its queues.
    fn apply_share(&self, owner: Option<&str>, group: &str, entity_share: f64) {
        let queues = self
            .store
            .queue_weights(owner, group, self.config.weight_aggregation);
        if queues.is_empty() {
            return;
        }

        let allow_background = self.registry.allows_background(group);
        let total_weight: f64 = queues.iter().map(|q| q.weight).sum();

        let background: Vec<bool> = queues
            .iter()
            .map(|q| {
                allow_background
                    && total_weight > 0.0
                    && entity_share * q.weight / total_weight <= BACKGROUND_SHARE_THRESHOLD
            })
            .collect();

        let foreground_weight: f64 = queues
            .iter()
            .zip(&background)
            .filter(|(_, &bg)| !bg)
            .map(|(q, _)| q.weight)
            .sum();
        let foreground_count = background.iter().filter(|&&bg| !bg).count();

        let mut priorities: HashMap<TqId, f64> = HashMap::with_capacity(queues.len());
        for (queue, &bg) in queues.iter().zip(&background) {
            let priority = if bg {
                TQ_MIN_SHARE
            } else if foreground_weight > 0.0 {
                (entity_share * queue.weight / foreground_weight).max(TQ_MIN_SHARE)
            } else {
                // All foreground queues weigh zero (e.g. every queue is
                // empty): split the share evenly instead of dividing by
                // zero.
                (entity_share / foreground_count.max(1) as f64).max(TQ_MIN_SHARE)
            };
            priorities.insert(queue.tq_id, priority);
        }

        self.merge_structural_duplicates(&queues, &mut priorities);
        self.store.set_priorities(&priorities);
        tracing::debug!(
            ?owner,
            group,
            queues = queues.len(),
            share = entity_share,
            "Applied fair-share priorities"
        );
    }

    /// Queues that are structurally identical in everything but priority
    /// receive the sum of their individually-computed priorities, so a
    /// transient near-duplicate pair is not individually under-weighted.
    /// Structural dedup at enqueue time should make this a no-op; a warn
    /// is emitted whenever it actually fires so the inconsistency window
    /// is visible.
    fn merge_structural_duplicates(
        &self,
        queues: &[QueueWeight],
        priorities: &mut HashMap<TqId, f64>,
    ) {
        let mut by_definition: HashMap<&TaskQueueDefinition, Vec<TqId>> = HashMap::new();
        for queue in queues {
            by_definition
                .entry(&queue.definition)
                .or_default()
                .push(queue.tq_id);
        }
        for (definition, ids) in by_definition {
            if ids.len() < 2 {
                continue;
            }
            tracing::warn!(
                owner = %definition.owner,
                group = %definition.owner_group,
                count = ids.len(),
                "Structurally identical task queues detected during recalculation"
            );
            let combined: f64 = ids.iter().filter_map(|id| priorities.get(id)).sum();
            for id in ids {
                priorities.insert(id, combined);
            }
        }
    }
}
