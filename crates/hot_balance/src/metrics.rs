//! In-process counters for the balancer.
//!
//! Counters are lock-free atomics so the scheduling cycle can bump them
//! without extra synchronization; the per-store gauges sit behind a mutex
//! because they are rewritten wholesale once per snapshot build.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::cluster::StoreId;

/// Direction of an emitted migration relative to one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }
}

/// Per-store per-axis gauges refreshed during snapshot construction.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreAxisGauges {
    /// Pending influence as a fraction of the store's adjusted load.
    pub pending_ratio: f64,
    /// Raw load after pending influence has been folded in.
    pub adjusted_load: f64,
}

/// Aggregated counters for scheduling cycles and operator emission.
#[derive(Debug, Default)]
pub struct BalanceMetrics {
    /// Number of `schedule` invocations.
    schedule: AtomicU64,
    /// Candidate skipped because its region metadata was gone.
    no_region: AtomicU64,
    /// Candidate skipped because the region was unhealthy.
    unhealthy_replica: AtomicU64,
    /// Candidate skipped because the region had an abnormal replica count.
    abnormal_replica: AtomicU64,
    /// Operator builder rejections.
    create_operator_fail: AtomicU64,
    /// Operators successfully built.
    new_operator: AtomicU64,
    /// Emitted move-peer (including move-leader) operators.
    op_move_peer: AtomicU64,
    /// Emitted transfer-leader operators.
    op_transfer_leader: AtomicU64,
    /// Emitted split operators.
    op_split: AtomicU64,
    /// Pending ledger registrations.
    pending_op_create: AtomicU64,
    /// Pending ledger registration conflicts.
    pending_op_fails: AtomicU64,
    /// Pending ledger entries pruned by gc or summarize.
    pending_op_pruned: AtomicU64,
    /// Whole cycles skipped (no allowed dimension, unstable load, mode).
    cycle_skipped: AtomicU64,
    /// Per-store emission direction counters keyed by (store, op, direction).
    directions: Mutex<BTreeMap<(StoreId, &'static str, Direction), u64>>,
    /// Per-store per-axis gauges keyed by (store, axis label).
    store_gauges: Mutex<BTreeMap<(StoreId, &'static str), StoreAxisGauges>>,
}

/// Point-in-time copy of the scalar counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceMetricsSnapshot {
    pub schedule: u64,
    pub no_region: u64,
    pub unhealthy_replica: u64,
    pub abnormal_replica: u64,
    pub create_operator_fail: u64,
    pub new_operator: u64,
    pub op_move_peer: u64,
    pub op_transfer_leader: u64,
    pub op_split: u64,
    pub pending_op_create: u64,
    pub pending_op_fails: u64,
    pub pending_op_pruned: u64,
    pub cycle_skipped: u64,
}

impl BalanceMetrics {
    pub fn record_schedule(&self) {
        self.schedule.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_region(&self) {
        self.no_region.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhealthy_replica(&self) {
        self.unhealthy_replica.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abnormal_replica(&self) {
        self.abnormal_replica.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_create_operator_fail(&self) {
        self.create_operator_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new_operator(&self, op_label: &'static str) {
        self.new_operator.fetch_add(1, Ordering::Relaxed);
        match op_label {
            "move-peer" => self.op_move_peer.fetch_add(1, Ordering::Relaxed),
            "transfer-leader" => self.op_transfer_leader.fetch_add(1, Ordering::Relaxed),
            _ => self.op_split.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_pending_create(&self) {
        self.pending_op_create.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pending_fail(&self) {
        self.pending_op_fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pending_pruned(&self, count: u64) {
        if count > 0 {
            self.pending_op_pruned.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_cycle_skipped(&self) {
        self.cycle_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one emitted migration as an outflow on the source and an
    /// inflow on the destination.
    pub fn record_direction(&self, op_label: &'static str, src: StoreId, dst: StoreId) {
        let mut directions = self
            .directions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *directions.entry((src, op_label, Direction::Out)).or_default() += 1;
        *directions.entry((dst, op_label, Direction::In)).or_default() += 1;
    }

    /// Replaces one store/axis gauge pair.
    pub fn set_store_gauges(&self, store_id: StoreId, axis: &'static str, gauges: StoreAxisGauges) {
        let mut store_gauges = self
            .store_gauges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        store_gauges.insert((store_id, axis), gauges);
    }

    pub fn snapshot(&self) -> BalanceMetricsSnapshot {
        BalanceMetricsSnapshot {
            schedule: self.schedule.load(Ordering::Relaxed),
            no_region: self.no_region.load(Ordering::Relaxed),
            unhealthy_replica: self.unhealthy_replica.load(Ordering::Relaxed),
            abnormal_replica: self.abnormal_replica.load(Ordering::Relaxed),
            create_operator_fail: self.create_operator_fail.load(Ordering::Relaxed),
            new_operator: self.new_operator.load(Ordering::Relaxed),
            op_move_peer: self.op_move_peer.load(Ordering::Relaxed),
            op_transfer_leader: self.op_transfer_leader.load(Ordering::Relaxed),
            op_split: self.op_split.load(Ordering::Relaxed),
            pending_op_create: self.pending_op_create.load(Ordering::Relaxed),
            pending_op_fails: self.pending_op_fails.load(Ordering::Relaxed),
            pending_op_pruned: self.pending_op_pruned.load(Ordering::Relaxed),
            cycle_skipped: self.cycle_skipped.load(Ordering::Relaxed),
        }
    }

    /// Renders counters in a plain-text format suitable for `/metrics`.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            "balancer_schedule={}\nbalancer_no_region={}\nbalancer_unhealthy_replica={}\nbalancer_abnormal_replica={}\nbalancer_create_operator_fail={}\nbalancer_new_operator={}\nbalancer_op_move_peer={}\nbalancer_op_transfer_leader={}\nbalancer_op_split={}\nbalancer_pending_op_create={}\nbalancer_pending_op_fails={}\nbalancer_pending_op_pruned={}\nbalancer_cycle_skipped={}\n",
            s.schedule,
            s.no_region,
            s.unhealthy_replica,
            s.abnormal_replica,
            s.create_operator_fail,
            s.new_operator,
            s.op_move_peer,
            s.op_transfer_leader,
            s.op_split,
            s.pending_op_create,
            s.pending_op_fails,
            s.pending_op_pruned,
            s.cycle_skipped,
        );
        let directions = self
            .directions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for ((store, op, dir), count) in directions.iter() {
            out.push_str(&format!(
                "balancer_direction_store_{store}_{op}_{}={count}\n",
                dir.label()
            ));
        }
        drop(directions);
        let store_gauges = self
            .store_gauges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for ((store, axis), gauges) in store_gauges.iter() {
            out.push_str(&format!(
                "balancer_store_{store}_{axis}_pending_ratio={}\nbalancer_store_{store}_{axis}_adjusted_load={}\n",
                gauges.pending_ratio, gauges.adjusted_load
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_counters_split_by_kind() {
        let metrics = BalanceMetrics::default();
        metrics.record_new_operator("move-peer");
        metrics.record_new_operator("transfer-leader");
        metrics.record_new_operator("split-region");
        let s = metrics.snapshot();
        assert_eq!(s.new_operator, 3);
        assert_eq!(s.op_move_peer, 1);
        assert_eq!(s.op_transfer_leader, 1);
        assert_eq!(s.op_split, 1);
    }

    #[test]
    fn direction_counters_track_both_ends() {
        let metrics = BalanceMetrics::default();
        metrics.record_direction("move-peer", 1, 2);
        metrics.record_direction("move-peer", 1, 3);
        let text = metrics.render_text();
        assert!(text.contains("balancer_direction_store_1_move-peer_out=2"));
        assert!(text.contains("balancer_direction_store_2_move-peer_in=1"));
        assert!(text.contains("balancer_direction_store_3_move-peer_in=1"));
    }

    #[test]
    fn render_includes_store_gauges() {
        let metrics = BalanceMetrics::default();
        metrics.set_store_gauges(
            7,
            "write-byte-rate",
            StoreAxisGauges {
                pending_ratio: 0.25,
                adjusted_load: 2048.0,
            },
        );
        let text = metrics.render_text();
        assert!(text.contains("balancer_store_7_write-byte-rate_pending_ratio=0.25"));
        assert!(text.contains("balancer_store_7_write-byte-rate_adjusted_load=2048"));
    }
}
