//! Split fallback scenarios: regions individually too hot to move.

mod common;

use std::time::Duration;

use hot_balance::{
    BalanceConfig, HotRegionScheduler, OpClass, OperatorKind, SplitDim, SplitSide,
};

use common::{hot_peer, region, write_bytes, MockCluster, KIB};

fn oversized_region_cluster() -> MockCluster {
    // One region carries all of store 1's write load (2.0x the mean).
    // Moving it whole would underfill the source, so it can only split.
    MockCluster::new()
        .with_store(1, write_bytes(400.0 * KIB))
        .with_store(2, write_bytes(100.0 * KIB))
        .with_store(3, write_bytes(100.0 * KIB))
        .with_hot_peer(hot_peer(50, 1, write_bytes(400.0 * KIB), true))
        .with_hot_peer(hot_peer(20, 2, write_bytes(95.0 * KIB), true))
        .with_hot_peer(hot_peer(21, 3, write_bytes(95.0 * KIB), true))
        .with_region(region(50, &[1, 2], 1))
        .with_region(region(20, &[2, 3], 2))
        .with_region(region(21, &[3, 2], 3))
}

/// The fallback fires on the fifth consecutive no-progress cycle and emits a
/// ratio split along the overloaded axis.
#[test]
fn oversized_region_splits_after_five_no_progress_cycles() {
    let cluster = oversized_region_cluster();
    let scheduler = HotRegionScheduler::new(BalanceConfig::default());

    for cycle in 0..4 {
        let ops = scheduler.schedule(&cluster);
        assert!(ops.is_empty(), "cycle {cycle} should make no progress");
        assert!(!scheduler.has_pending_split());
    }

    let ops = scheduler.schedule(&cluster);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].region_id, 50);
    assert_eq!(ops[0].class, OpClass::Admin);
    match ops[0].kind {
        OperatorKind::SplitRegion { dim, side, ratio } => {
            assert_eq!(dim, SplitDim::Bytes);
            assert_eq!(side, SplitSide::Write);
            // balance_ratio / normalized region load = 0.1 / 2.0.
            assert!((ratio - 0.05).abs() < 1e-9);
        }
        ref other => panic!("unexpected operator kind: {other:?}"),
    }
    assert!(scheduler.has_pending_split());
    assert_eq!(scheduler.pending_region_count(), 1);

    // With the split in flight, scheduling pauses entirely.
    assert!(scheduler.schedule(&cluster).is_empty());
    assert!(scheduler.schedule(&cluster).is_empty());
    assert_eq!(scheduler.metrics().snapshot().op_split, 1);
}

/// Once the split operator finishes and outlives the zombie window, its
/// pending entry is collected and scheduling resumes.
#[test]
fn zombie_gc_releases_pending_split() {
    let cluster = oversized_region_cluster();
    let config = BalanceConfig {
        max_zombie_millis: 30,
        ..BalanceConfig::default()
    };
    let scheduler = HotRegionScheduler::new(config);

    for _ in 0..4 {
        assert!(scheduler.schedule(&cluster).is_empty());
    }
    let ops = scheduler.schedule(&cluster);
    assert_eq!(ops.len(), 1);

    ops[0].mark_finished();
    std::thread::sleep(Duration::from_millis(50));

    // The next cycle prunes the zombie, clears the split latch, and gets
    // back to counting no-progress cycles.
    assert!(scheduler.schedule(&cluster).is_empty());
    assert_eq!(scheduler.pending_region_count(), 0);
    assert!(!scheduler.has_pending_split());
    assert!(scheduler.metrics().snapshot().pending_op_pruned >= 1);
}

/// A region already pending is not split again; splitting stops once the
/// excess is shed.
#[test]
fn split_batch_skips_pending_regions() {
    let cluster = oversized_region_cluster();
    let scheduler = HotRegionScheduler::new(BalanceConfig::default());

    for _ in 0..4 {
        assert!(scheduler.schedule(&cluster).is_empty());
    }
    let first = scheduler.schedule(&cluster);
    assert_eq!(first.len(), 1);

    // Even after another five no-progress rounds the pending region stays
    // untouched: the split latch holds scheduling back entirely.
    for _ in 0..6 {
        assert!(scheduler.schedule(&cluster).is_empty());
    }
    assert_eq!(scheduler.pending_region_count(), 1);
    assert_eq!(scheduler.metrics().snapshot().op_split, 1);
}
