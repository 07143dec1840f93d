use std::collections::BTreeMap;
use std::sync::Arc;

use tq_engine::{
    IdentityCorrector, JobDescription, SharesCorrector, StaticRegistry, TaskQueueEngine, TqConfig,
    TQ_MIN_SHARE,
};

fn engine_with_registry(registry: StaticRegistry) -> TaskQueueEngine {
    TaskQueueEngine::with_collaborators(
        TqConfig::default(),
        Arc::new(registry),
        Arc::new(IdentityCorrector),
    )
}

// ==================== Proportional split across owners ====================

/// Two owners with one equally-weighted queue each split the group share
/// evenly.
#[test]
fn test_two_owners_split_group_share() {
    let engine = engine_with_registry(StaticRegistry::new());
    engine
        .insert_job(1, &JobDescription::new("alice", "g1", 100).with_priority(1))
        .unwrap();
    engine
        .insert_job(2, &JobDescription::new("bob", "g1", 100).with_priority(1))
        .unwrap();

    engine.recalculate_priorities();

    let summaries = engine.retrieve_task_queues();
    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert!((summary.priority - 500.0).abs() < 1e-9);
    }
}

/// The per-queue priorities of a group sum to the group's configured
/// share, and each one respects the floor.
#[test]
fn test_priorities_sum_to_group_share() {
    let registry = StaticRegistry::new().with_group_share("g1", 3000.0);
    let engine = engine_with_registry(registry);
    for (job_id, owner) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        engine
            .insert_job(job_id, &JobDescription::new(owner, "g1", 100).with_priority(1))
            .unwrap();
    }

    engine.recalculate_priorities();

    let summaries = engine.retrieve_task_queues();
    let total: f64 = summaries.iter().map(|s| s.priority).sum();
    assert!((total - 3000.0).abs() < 1e-6);
    for summary in &summaries {
        assert!(summary.priority >= TQ_MIN_SHARE);
    }
}

/// An owner's share is split across their queues in proportion to each
/// queue's aggregate job weight.
#[test]
fn test_owner_share_weighted_by_queue_weight() {
    let engine = engine_with_registry(StaticRegistry::new());
    // Two queues for alice: priorities 8 and 2, so weights 8 and 2.
    engine
        .insert_job(
            1,
            &JobDescription::new("alice", "g1", 100)
                .with_sites(["CERN"])
                .with_priority(8),
        )
        .unwrap();
    engine
        .insert_job(
            2,
            &JobDescription::new("alice", "g1", 100)
                .with_sites(["RAL"])
                .with_priority(2),
        )
        .unwrap();

    engine.recalculate_priorities();

    let summaries = engine.retrieve_task_queues();
    let heavy = summaries
        .iter()
        .find(|s| s.definition.sites.contains("CERN"))
        .unwrap();
    let light = summaries
        .iter()
        .find(|s| s.definition.sites.contains("RAL"))
        .unwrap();
    assert!((heavy.priority - 800.0).abs() < 1e-6);
    assert!((light.priority - 200.0).abs() < 1e-6);
}

// ==================== Background carve-out ====================

/// A queue whose weighted share is negligible is demoted to exactly the
/// background floor when the group allows it.
#[test]
fn test_background_queue_gets_exactly_the_floor() {
    let registry = StaticRegistry::new().with_background_group("g1");
    let engine = engine_with_registry(registry);
    // Priority 0 clamps to the lower boundary, i.e. a near-zero weight.
    engine
        .insert_job(
            1,
            &JobDescription::new("alice", "g1", 100)
                .with_sites(["CERN"])
                .with_priority(5),
        )
        .unwrap();
    engine
        .insert_job(
            2,
            &JobDescription::new("alice", "g1", 100)
                .with_sites(["RAL"])
                .with_priority(0),
        )
        .unwrap();

    engine.recalculate_priorities();

    let summaries = engine.retrieve_task_queues();
    let background = summaries
        .iter()
        .find(|s| s.definition.sites.contains("RAL"))
        .unwrap();
    let foreground = summaries
        .iter()
        .find(|s| s.definition.sites.contains("CERN"))
        .unwrap();

    assert_eq!(background.priority, TQ_MIN_SHARE);
    // The foreground queue keeps the whole owner share.
    assert!((foreground.priority - 1000.0).abs() < 1e-6);
}

/// Without the group flag the same near-zero queue is not demoted, it
/// keeps its (tiny but proportional) share, floored.
#[test]
fn test_no_background_demotion_without_group_flag() {
    let engine = engine_with_registry(StaticRegistry::new());
    engine
        .insert_job(
            1,
            &JobDescription::new("alice", "g1", 100)
                .with_sites(["CERN"])
                .with_priority(5),
        )
        .unwrap();
    engine
        .insert_job(
            2,
            &JobDescription::new("alice", "g1", 100)
                .with_sites(["RAL"])
                .with_priority(0),
        )
        .unwrap();

    engine.recalculate_priorities();

    let total: f64 = engine.retrieve_task_queues().iter().map(|s| s.priority).sum();
    // Both queues are foreground; the owner share is fully distributed.
    assert!((total - 1000.0).abs() < 1e-6);
}

// ==================== Degenerate weights ====================

/// Queues whose jobs are all gone weigh zero; the share is split evenly
/// instead of dividing by zero.
#[test]
fn test_zero_weight_queues_split_share_evenly() {
    let engine = engine_with_registry(StaticRegistry::new());
    let tq_id = engine
        .insert_job(1, &JobDescription::new("alice", "g1", 100))
        .unwrap();
    engine.delete_job(1);

    engine.recalculate_priorities();

    let priority = engine.store().priority(tq_id).unwrap();
    assert!(priority.is_finite());
    assert!((priority - 1000.0).abs() < 1e-6);
}

// ==================== Job-sharing groups ====================

/// A job-sharing group is one scheduling entity: the group share is
/// distributed over all queues regardless of owner.
#[test]
fn test_job_sharing_group_skips_owner_split() {
    let registry = StaticRegistry::new().with_job_sharing_group("shared");
    let engine = engine_with_registry(registry);
    engine
        .insert_job(1, &JobDescription::new("alice", "shared", 100).with_priority(1))
        .unwrap();
    engine
        .insert_job(2, &JobDescription::new("bob", "shared", 100).with_priority(1))
        .unwrap();

    engine.recalculate_priorities();

    // Two queues (different owners), each gets half of the whole group
    // share rather than half of a per-owner slice.
    let summaries = engine.retrieve_task_queues();
    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert!((summary.priority - 500.0).abs() < 1e-6);
    }
}

// ==================== External shares correction ====================

struct SkewedCorrector;

impl SharesCorrector for SkewedCorrector {
    fn correct_shares(
        &self,
        shares: &BTreeMap<String, f64>,
        _group: Option<&str>,
    ) -> BTreeMap<String, f64> {
        let total: f64 = shares.values().sum();
        // Hand three quarters of the group to alice.
        shares
            .keys()
            .map(|owner| {
                let share = if owner == "alice" {
                    total * 0.75
                } else {
                    total * 0.25 / (shares.len() - 1) as f64
                };
                (owner.clone(), share)
            })
            .collect()
    }
}

#[test]
fn test_shares_corrector_applied_when_enabled() {
    let config = TqConfig::default().with_shares_correction(true);
    let engine = TaskQueueEngine::with_collaborators(
        config,
        Arc::new(StaticRegistry::new()),
        Arc::new(SkewedCorrector),
    );
    engine
        .insert_job(1, &JobDescription::new("alice", "g1", 100).with_priority(1))
        .unwrap();
    engine
        .insert_job(2, &JobDescription::new("bob", "g1", 100).with_priority(1))
        .unwrap();

    engine.recalculate_priorities();

    let summaries = engine.retrieve_task_queues();
    let alice = summaries.iter().find(|s| s.definition.owner == "alice").unwrap();
    let bob = summaries.iter().find(|s| s.definition.owner == "bob").unwrap();
    assert!((alice.priority - 750.0).abs() < 1e-6);
    assert!((bob.priority - 250.0).abs() < 1e-6);
}

#[test]
fn test_shares_corrector_ignored_when_disabled() {
    let engine = TaskQueueEngine::with_collaborators(
        TqConfig::default(),
        Arc::new(StaticRegistry::new()),
        Arc::new(SkewedCorrector),
    );
    engine
        .insert_job(1, &JobDescription::new("alice", "g1", 100).with_priority(1))
        .unwrap();
    engine
        .insert_job(2, &JobDescription::new("bob", "g1", 100).with_priority(1))
        .unwrap();

    engine.recalculate_priorities();

    for summary in engine.retrieve_task_queues() {
        assert!((summary.priority - 500.0).abs() < 1e-6);
    }
}

// ==================== Structural duplicate merging ====================

/// Structurally identical queues (which enqueue-side dedup should never
/// produce) are detected during recalculation and their priorities summed.
#[test]
fn test_identical_queues_share_a_summed_priority() {
    let engine = engine_with_registry(StaticRegistry::new());
    let definition = {
        // Build one real queue through the engine to borrow its shape.
        engine
            .insert_job(1, &JobDescription::new("alice", "g1", 100).with_priority(1))
            .unwrap();
        engine.retrieve_task_queues()[0].definition.clone()
    };

    // Force a duplicate behind the engine's back.
    let store = engine.store();
    let duplicate = store.create_queue(definition);
    store.upsert_job(2, duplicate, 1, 1.0).unwrap();
    store.set_enabled(duplicate, true);

    engine.recalculate_group_priorities("g1");

    let summaries = engine.retrieve_task_queues();
    assert_eq!(summaries.len(), 2);
    // Each would individually get 500; the grouping pass assigns both the
    // combined 1000.
    for summary in &summaries {
        assert!((summary.priority - 1000.0).abs() < 1e-6);
    }
}
