//! Pending influence ledger.
//!
//! Operators run asynchronously, so the load they are about to move must be
//! charged to the destination (and credited to the source) before the
//! statistics pipeline observes it. Otherwise consecutive cycles would keep
//! re-balancing the same load. The ledger tracks one influence quantum per
//! in-flight operator and enforces the one-outstanding-operator-per-region
//! invariant.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cluster::{RegionId, StoreId};
use crate::load::LoadVector;
use crate::operator::Operator;

/// Load attributed to one still-executing operator.
#[derive(Clone, Debug)]
pub struct PendingInfluence {
    op: Arc<Operator>,
    pub from: StoreId,
    pub to: StoreId,
    pub loads: LoadVector,
}

impl PendingInfluence {
    pub fn operator(&self) -> &Arc<Operator> {
        &self.op
    }
}

/// Decay weight for one pending entry.
///
/// A running operator counts in full. Once finished, its influence fades
/// linearly across the zombie window so the real statistics can take over
/// smoothly. A negative return marks the entry for pruning.
pub fn pending_weight(op: &Operator, now: Instant, max_zombie: Duration) -> f64 {
    let Some(finished_for) = op.finished_for(now) else {
        return 1.0;
    };
    if finished_for >= max_zombie || max_zombie.is_zero() {
        return -1.0;
    }
    1.0 - finished_for.as_secs_f64() / max_zombie.as_secs_f64()
}

/// Result of one [`PendingLedger::summarize`] pass.
#[derive(Debug, Default)]
pub struct PendingSummary {
    /// Weighted per-store influence: positive on destinations, negative on
    /// sources.
    pub sums: BTreeMap<StoreId, LoadVector>,
    /// Entries dropped because their operator outlived the zombie window.
    pub pruned: usize,
}

/// Tracks influences and the region-pending index.
#[derive(Debug)]
pub struct PendingLedger {
    max_zombie: Duration,
    entries: Vec<PendingInfluence>,
    region_ops: BTreeMap<RegionId, Arc<Operator>>,
}

impl PendingLedger {
    pub fn new(max_zombie: Duration) -> Self {
        Self {
            max_zombie,
            entries: Vec::new(),
            region_ops: BTreeMap::new(),
        }
    }

    pub fn set_max_zombie(&mut self, max_zombie: Duration) {
        self.max_zombie = max_zombie;
    }

    /// Register the influence of a freshly emitted operator. Fails when the
    /// region already has an outstanding operator.
    pub fn add(
        &mut self,
        op: Arc<Operator>,
        from: StoreId,
        to: StoreId,
        loads: LoadVector,
    ) -> bool {
        if self.region_ops.contains_key(&op.region_id) {
            return false;
        }
        self.region_ops.insert(op.region_id, op.clone());
        self.entries.push(PendingInfluence {
            op,
            from,
            to,
            loads,
        });
        true
    }

    /// Drop every trace of `region_id`. Used to roll back a partially
    /// registered batch.
    pub fn remove_region(&mut self, region_id: RegionId) -> bool {
        let removed = self.region_ops.remove(&region_id).is_some();
        self.entries.retain(|entry| entry.op.region_id != region_id);
        removed
    }

    pub fn has_region(&self, region_id: RegionId) -> bool {
        self.region_ops.contains_key(&region_id)
    }

    pub fn pending_region_count(&self) -> usize {
        self.region_ops.len()
    }

    pub fn pending_op(&self, region_id: RegionId) -> Option<Arc<Operator>> {
        self.region_ops.get(&region_id).cloned()
    }

    /// Recompute the per-store pending sums, pruning entries whose operator
    /// has been finished for longer than the zombie window.
    pub fn summarize(&mut self, now: Instant) -> PendingSummary {
        let max_zombie = self.max_zombie;
        let mut summary = PendingSummary::default();
        self.entries.retain(|entry| {
            let weight = pending_weight(&entry.op, now, max_zombie);
            if weight < 0.0 {
                summary.pruned += 1;
                return false;
            }
            let weighted = entry.loads.scale(weight);
            summary.sums.entry(entry.to).or_default().add(&weighted);
            summary.sums.entry(entry.from).or_default().sub(&weighted);
            true
        });
        summary
    }

    /// Remove region-pending index entries whose operator has been finished
    /// for longer than the zombie window. Returns the number removed.
    pub fn gc(&mut self, now: Instant) -> usize {
        let max_zombie = self.max_zombie;
        let before = self.region_ops.len();
        self.region_ops.retain(|_, op| {
            match op.finished_for(now) {
                Some(finished_for) => finished_for < max_zombie,
                None => true,
            }
        });
        before - self.region_ops.len()
    }

    /// Influence entries restricted to one axis predicate, for the status
    /// surfaces.
    pub fn influence_by_store(
        &self,
        keep_axis: impl Fn(crate::load::Dimension) -> bool,
    ) -> BTreeMap<StoreId, LoadVector> {
        let mut out: BTreeMap<StoreId, LoadVector> = BTreeMap::new();
        for entry in &self.entries {
            let mut loads = entry.loads;
            for dim in crate::load::Dimension::ALL {
                if !keep_axis(dim) {
                    loads[dim] = 0.0;
                }
            }
            out.entry(entry.to).or_default().add(&loads);
            out.entry(entry.from).or_default().sub(&loads);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::Dimension;
    use crate::operator::build_split_operator;
    use crate::operator::{build_move_operator, build_transfer_leader_operator};
    use crate::cluster::{PeerRole, RegionDesc, RegionPeer};

    fn region(region_id: RegionId) -> RegionDesc {
        RegionDesc {
            region_id,
            peers: vec![
                RegionPeer {
                    store_id: 1,
                    role: PeerRole::Voter,
                },
                RegionPeer {
                    store_id: 2,
                    role: PeerRole::Voter,
                },
            ],
            leader: 1,
        }
    }

    fn loads(write_bytes: f64) -> LoadVector {
        let mut v = LoadVector::ZERO;
        v[Dimension::WriteBytes] = write_bytes;
        v
    }

    #[test]
    fn second_add_for_same_region_fails() {
        let mut ledger = PendingLedger::new(Duration::from_secs(60));
        let op1 = Arc::new(build_move_operator(&region(5), 1, 2).unwrap());
        let op2 = Arc::new(build_transfer_leader_operator(&region(5), 1, 2).unwrap());
        assert!(ledger.add(op1, 1, 2, loads(100.0)));
        assert!(!ledger.add(op2, 1, 2, loads(50.0)));
        assert_eq!(ledger.pending_region_count(), 1);
    }

    #[test]
    fn summarize_charges_destination_and_credits_source() {
        let mut ledger = PendingLedger::new(Duration::from_secs(60));
        let op = Arc::new(build_move_operator(&region(5), 1, 2).unwrap());
        ledger.add(op, 1, 2, loads(100.0));

        let summary = ledger.summarize(Instant::now());
        assert_eq!(summary.pruned, 0);
        assert!((summary.sums[&2][Dimension::WriteBytes] - 100.0).abs() < 1e-9);
        assert!((summary.sums[&1][Dimension::WriteBytes] + 100.0).abs() < 1e-9);
    }

    #[test]
    fn finished_operator_influence_decays_then_prunes() {
        let max_zombie = Duration::from_secs(10);
        let op = build_split_operator(5, Dimension::WriteBytes, 0.5);
        op.mark_finished();

        let now = Instant::now();
        let early = pending_weight(&op, now + Duration::from_secs(2), max_zombie);
        let late = pending_weight(&op, now + Duration::from_secs(8), max_zombie);
        assert!(early > late && late > 0.0);
        assert!(pending_weight(&op, now + Duration::from_secs(11), max_zombie) < 0.0);
    }

    #[test]
    fn gc_removes_regions_past_zombie_window() {
        let mut ledger = PendingLedger::new(Duration::from_millis(0));
        let op = Arc::new(build_move_operator(&region(5), 1, 2).unwrap());
        ledger.add(op.clone(), 1, 2, loads(1.0));

        // Unfinished operators survive gc regardless of age.
        assert_eq!(ledger.gc(Instant::now()), 0);

        op.mark_finished();
        assert_eq!(ledger.gc(Instant::now() + Duration::from_millis(1)), 1);
        assert!(!ledger.has_region(5));
    }

    #[test]
    fn rollback_clears_region_and_entries() {
        let mut ledger = PendingLedger::new(Duration::from_secs(60));
        let op = Arc::new(build_move_operator(&region(5), 1, 2).unwrap());
        ledger.add(op, 1, 2, loads(1.0));
        assert!(ledger.remove_region(5));
        assert!(!ledger.has_region(5));
        assert!(ledger.summarize(Instant::now()).sums.is_empty());
    }

    #[test]
    fn influence_by_store_filters_axes() {
        let mut ledger = PendingLedger::new(Duration::from_secs(60));
        let op = Arc::new(build_move_operator(&region(5), 1, 2).unwrap());
        let mut both = loads(100.0);
        both[Dimension::ReadBytes] = 40.0;
        ledger.add(op, 1, 2, both);

        let reads = ledger.influence_by_store(|dim| dim.is_read());
        assert_eq!(reads[&2][Dimension::WriteBytes], 0.0);
        assert!((reads[&2][Dimension::ReadBytes] - 40.0).abs() < 1e-9);
    }
}
