//! The per-cycle decision loop.
//!
//! One balancing pass emits at most one migration (move-peer or
//! transfer-leader), or a batch of split operators from the fallback, or
//! nothing. Convergence comes from the outer loop invoking the pass
//! repeatedly while the pending ledger keeps already-moved load out of the
//! candidate set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cluster::{ClusterView, RegionDesc, RegionId, StoreId};
use crate::config::BalanceConfig;
use crate::load::{Dimension, LoadVector};
use crate::metrics::BalanceMetrics;
use crate::operator::{
    build_move_operator, build_split_operator, build_transfer_leader_operator, Operator,
};
use crate::pending::PendingLedger;
use crate::snapshot::{BalanceSnapshot, PeerInfo, SortedPeers};

/// Migration flavor decided per candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationKind {
    MovePeer,
    TransferLeader,
}

/// Cross-cycle decision-protocol state, serialized by the scheduler lock.
#[derive(Debug)]
pub struct ProtocolState {
    /// Effective tolerance this cycle; refreshed from cluster options by the
    /// frame, with the relaxation increment applied when latched.
    pub balance_ratio: f64,
    /// Relaxation latch: set when the cluster is near equilibrium so it can
    /// settle instead of oscillating.
    pub relax_balance: bool,
    /// Consecutive no-progress cycles counted toward the split fallback.
    pub split_trigger_count: u32,
    /// A split batch is in flight; scheduling pauses until it finishes.
    pub has_split: bool,
    /// The next cycle must rebuild the snapshot.
    pub need_init: bool,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self {
            balance_ratio: crate::config::DEFAULT_BALANCE_RATIO,
            relax_balance: false,
            split_trigger_count: 0,
            has_split: false,
            need_init: true,
        }
    }
}

/// Ephemeral per-migration record.
#[derive(Debug)]
struct Decision {
    src_store_id: StoreId,
    dst_store_id: StoreId,
    kind: MigrationKind,
    peer: PeerInfo,
    region: RegionDesc,
}

/// One balancer instance: a snapshot plus the per-lifetime bookkeeping that
/// keeps consecutive passes from touching the same region twice.
#[derive(Debug)]
pub struct MultiBalancer {
    snapshot: BalanceSnapshot,
    scheduled_regions: BTreeSet<RegionId>,
    split_candidates: BTreeMap<StoreId, Vec<PeerInfo>>,
}

impl MultiBalancer {
    pub fn new(snapshot: BalanceSnapshot) -> Self {
        Self {
            snapshot,
            scheduled_regions: BTreeSet::new(),
            split_candidates: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> &BalanceSnapshot {
        &self.snapshot
    }

    /// Run one balancing pass. See the module docs for the emission shape.
    pub fn solve_multi_loads<C: ClusterView>(
        &mut self,
        cluster: &C,
        state: &mut ProtocolState,
        ledger: &mut PendingLedger,
        metrics: &BalanceMetrics,
        config: &BalanceConfig,
    ) -> Vec<Arc<Operator>> {
        if self.snapshot.skip {
            return Vec::new();
        }

        let allowed = self.snapshot.allowed.clone();
        let order = self.store_order(&allowed);
        tracing::info!(allowed = ?allowed, "run solve");
        for &idx in &order {
            let store = &self.snapshot.stores[idx];
            tracing::debug!(store_id = store.id, loads = ?store.loads.0, "store load");
        }

        self.split_candidates.clear();

        for &src_idx in &order {
            let store_id = self.snapshot.stores[src_idx].id;
            let Some((max_dim, max_load)) = self.snapshot.stores[src_idx].max_load(&allowed)
            else {
                continue;
            };
            if max_load <= 1.0 + state.balance_ratio {
                continue;
            }

            // An over-tolerance store ends the settling phase: fall back to
            // the configured base tolerance.
            if state.relax_balance {
                state.balance_ratio = base_balance_ratio(cluster, config);
                state.relax_balance = false;
            }

            let mut sorted = SortedPeers::build(&self.snapshot.stores[src_idx], max_dim);
            tracing::info!(
                store_id,
                dim = ?max_dim,
                max_load,
                remain_load = sorted.remain_loads(),
                "check loads"
            );

            while let Some(peer) = sorted.pop() {
                if self.scheduled_regions.contains(&peer.region_id) {
                    tracing::debug!(
                        store_id,
                        region_id = peer.region_id,
                        "region already scheduled this balancer, skipping"
                    );
                    continue;
                }

                let remain_load = peer.loads[max_dim] + sorted.remain_loads();
                if remain_load < state.balance_ratio
                    || remain_load < (max_load - 1.0) * 0.8
                {
                    tracing::info!(
                        store_id,
                        region_load = ?peer.loads.0,
                        remain_load = sorted.remain_loads(),
                        max_load,
                        "remaining hot mass too small, next store"
                    );
                    break;
                }

                // Moving the whole peer would underfill the source: it is
                // too big to move and becomes a split candidate.
                if max_load - peer.loads[max_dim] < 1.0 - state.balance_ratio {
                    self.split_candidates
                        .entry(store_id)
                        .or_default()
                        .push(peer);
                    continue;
                }

                let Some(region) = lookup_region(cluster, peer.region_id, metrics) else {
                    continue;
                };

                let mut decision = Decision {
                    src_store_id: store_id,
                    dst_store_id: 0,
                    kind: MigrationKind::MovePeer,
                    peer,
                    region,
                };

                let Some(dst_idx) =
                    self.pick_best_dst_store(cluster, &mut decision, max_dim, state.balance_ratio)
                else {
                    tracing::info!(
                        region_id = decision.peer.region_id,
                        src_store_id = store_id,
                        region_load = ?decision.peer.loads.0,
                        dim = ?max_dim,
                        "no suitable destination store"
                    );
                    self.split_candidates
                        .entry(store_id)
                        .or_default()
                        .push(decision.peer);
                    continue;
                };

                tracing::info!(
                    region_id = decision.peer.region_id,
                    src_store_id = store_id,
                    dst_store_id = decision.dst_store_id,
                    kind = ?decision.kind,
                    dim = ?max_dim,
                    "find placement"
                );

                let Some((op, influence)) = build_migration_operator(&decision, metrics) else {
                    continue;
                };

                let op = Arc::new(op);
                if !ledger.add(
                    op.clone(),
                    decision.src_store_id,
                    decision.dst_store_id,
                    influence,
                ) {
                    // The region picked up an operator through another path;
                    // abort the cycle rather than emit against stale state.
                    metrics.record_pending_fail();
                    return Vec::new();
                }
                metrics.record_pending_create();
                metrics.record_direction(
                    op.op_label(),
                    decision.src_store_id,
                    decision.dst_store_id,
                );

                self.apply_migration(src_idx, dst_idx, &decision.peer, decision.kind);
                self.scheduled_regions.insert(decision.peer.region_id);
                state.split_trigger_count = 0;
                return vec![op];
            }

            tracing::info!(store_id, "no candidate region on store");
        }

        // Nothing emitted. Near equilibrium, loosen the tolerance so the
        // cluster settles instead of oscillating around the target.
        let ratio = self.snapshot.balance_ratio();
        if !state.relax_balance
            && ratio <= 1.0 + state.balance_ratio + config.allowed_deviation
        {
            state.relax_balance = true;
            state.balance_ratio += config.allowed_deviation;
            tracing::info!(ratio, "relax balance condition");
        }

        if ratio > 1.0 + state.balance_ratio {
            return self.process_split(state, ledger, metrics, config);
        }

        Vec::new()
    }

    /// Store evaluation order: descending on the globally hottest axis.
    fn store_order(&self, allowed: &[Dimension]) -> Vec<usize> {
        let mut max_dim = None;
        let mut max_load = f64::MIN;
        for store in &self.snapshot.stores {
            for &dim in allowed {
                if store.loads[dim] > max_load {
                    max_load = store.loads[dim];
                    max_dim = Some(dim);
                }
            }
        }
        let mut order: Vec<usize> = (0..self.snapshot.stores.len()).collect();
        if let Some(dim) = max_dim {
            order.sort_by(|&a, &b| {
                let left = self.snapshot.stores[a].loads[dim];
                let right = self.snapshot.stores[b].loads[dim];
                right.partial_cmp(&left).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        order
    }

    /// Candidate destination stores for one migration flavor, after the
    /// control plane's placement and state filters.
    fn candidate_store_ids<C: ClusterView>(
        &self,
        cluster: &C,
        decision: &Decision,
        kind: MigrationKind,
    ) -> BTreeSet<StoreId> {
        match kind {
            MigrationKind::MovePeer => {
                let excluded: BTreeSet<StoreId> =
                    decision.region.store_ids().into_iter().collect();
                self.snapshot
                    .stores
                    .iter()
                    .map(|store| store.id)
                    .filter(|store_id| !excluded.contains(store_id))
                    .filter(|store_id| cluster.store_accepts_peer(*store_id, &decision.region))
                    .collect()
            }
            MigrationKind::TransferLeader => cluster
                .follower_stores(&decision.region)
                .into_iter()
                .filter(|store_id| cluster.store_accepts_leader(*store_id, &decision.region))
                .collect(),
        }
    }

    /// Worst-axis load of a destination after accepting the peer. Leader
    /// transfers only move load on the leader-transferable axes.
    fn load_of_migrated(&self, dst_idx: usize, peer: &PeerInfo, kind: MigrationKind) -> f64 {
        let store = &self.snapshot.stores[dst_idx];
        let mut max_load: f64 = 0.0;
        for &dim in &self.snapshot.allowed {
            if kind == MigrationKind::TransferLeader && !dim.leader_transferable() {
                continue;
            }
            max_load = max_load.max(store.loads[dim] + peer.loads[dim]);
        }
        max_load
    }

    /// Best destination for one flavor: the candidate with the lowest
    /// post-migration worst-axis load. Large regions may not create a new
    /// hotspot, so their destinations are capped at the tolerance.
    fn filter_dst_stores<C: ClusterView>(
        &self,
        cluster: &C,
        decision: &Decision,
        kind: MigrationKind,
        is_large_region: bool,
        balance_ratio: f64,
    ) -> Option<(usize, f64)> {
        let candidates = self.candidate_store_ids(cluster, decision, kind);
        let mut best: Option<(usize, f64)> = None;
        for (idx, store) in self.snapshot.stores.iter().enumerate() {
            if !candidates.contains(&store.id) {
                continue;
            }
            let new_load = self.load_of_migrated(idx, &decision.peer, kind);
            if new_load <= 1.0 + balance_ratio || !is_large_region {
                match best {
                    Some((_, min_load)) if min_load <= new_load => {}
                    _ => best = Some((idx, new_load)),
                }
            }
        }
        best
    }

    /// Choose the destination and flavor for the current decision. Leader
    /// transfer is tried first for leading peers on read axes; move-peer
    /// replaces it only when strictly better.
    fn pick_best_dst_store<C: ClusterView>(
        &self,
        cluster: &C,
        decision: &mut Decision,
        target_dim: Dimension,
        balance_ratio: f64,
    ) -> Option<usize> {
        let is_large_region = self
            .snapshot
            .allowed
            .iter()
            .any(|&dim| decision.peer.loads[dim] > balance_ratio);

        let mut best: Option<(usize, f64)> = None;
        if decision.peer.is_leader && target_dim.leader_transferable() {
            if let Some((idx, load)) = self.filter_dst_stores(
                cluster,
                decision,
                MigrationKind::TransferLeader,
                is_large_region,
                balance_ratio,
            ) {
                decision.kind = MigrationKind::TransferLeader;
                decision.dst_store_id = self.snapshot.stores[idx].id;
                best = Some((idx, load));
            }
        }

        if let Some((idx, load)) = self.filter_dst_stores(
            cluster,
            decision,
            MigrationKind::MovePeer,
            is_large_region,
            balance_ratio,
        ) {
            let strictly_better = match best {
                Some((_, current)) => load < current,
                None => true,
            };
            if strictly_better {
                decision.kind = MigrationKind::MovePeer;
                decision.dst_store_id = self.snapshot.stores[idx].id;
                best = Some((idx, load));
            }
        }

        best.map(|(idx, _)| idx)
    }

    /// Reflect an emitted migration in the in-memory snapshot so later
    /// passes on the same balancer see the predicted loads.
    fn apply_migration(
        &mut self,
        src_idx: usize,
        dst_idx: usize,
        peer: &PeerInfo,
        kind: MigrationKind,
    ) {
        let mut moved = peer.loads;
        if kind == MigrationKind::TransferLeader {
            moved.zero_write_axes();
        }
        {
            let src = &mut self.snapshot.stores[src_idx];
            src.loads.sub(&moved);
            match kind {
                MigrationKind::MovePeer => {
                    src.hot_peers.remove(&peer.region_id);
                }
                MigrationKind::TransferLeader => {
                    if let Some(entry) = src.hot_peers.get_mut(&peer.region_id) {
                        entry.is_leader = false;
                        entry.loads.zero_read_axes();
                    }
                }
            }
        }
        let dst = &mut self.snapshot.stores[dst_idx];
        dst.loads.add(&moved);
        match kind {
            MigrationKind::MovePeer => {
                let mut entry = peer.clone();
                entry.store_id = dst.id;
                dst.hot_peers.insert(peer.region_id, entry);
            }
            MigrationKind::TransferLeader => {
                let dst_id = dst.id;
                let entry = dst.hot_peers.entry(peer.region_id).or_insert_with(|| {
                    let mut entry = peer.clone();
                    entry.store_id = dst_id;
                    entry.loads.zero_read_axes();
                    entry
                });
                entry.is_leader = true;
                entry.loads.add(&moved);
            }
        }
    }

    /// Split fallback: after enough no-progress cycles, break up the regions
    /// that were individually too hot to move.
    fn process_split(
        &mut self,
        state: &mut ProtocolState,
        ledger: &mut PendingLedger,
        metrics: &BalanceMetrics,
        config: &BalanceConfig,
    ) -> Vec<Arc<Operator>> {
        tracing::info!(
            trigger_count = state.split_trigger_count + 1,
            "no progress, counting toward split fallback"
        );
        state.split_trigger_count += 1;
        if state.split_trigger_count < config.split_trigger {
            return Vec::new();
        }
        state.split_trigger_count = 0;

        let allowed = &self.snapshot.allowed;
        let mut ops: Vec<Arc<Operator>> = Vec::new();
        let mut registered: Vec<RegionId> = Vec::new();

        for store in &self.snapshot.stores {
            let Some(candidates) = self.split_candidates.get(&store.id) else {
                continue;
            };
            let Some((max_dim, max_load)) = store.max_load(allowed) else {
                continue;
            };
            if max_load <= 1.0 + state.balance_ratio {
                continue;
            }

            // The excess mass this store must shed to come back under
            // tolerance.
            let load_threshold = max_load - 1.0 - state.balance_ratio;
            let mut shed = 0.0;
            for peer in candidates {
                if ledger.has_region(peer.region_id) || registered.contains(&peer.region_id) {
                    continue;
                }
                let split_ratio = state.balance_ratio / peer.loads[max_dim];
                if split_ratio >= 1.0 {
                    continue;
                }

                let op = Arc::new(build_split_operator(peer.region_id, max_dim, split_ratio));
                if !ledger.add(op.clone(), store.id, store.id, LoadVector::ZERO) {
                    // Pre-checked above, so this is a real conflict: undo the
                    // batch instead of emitting a half-registered one.
                    metrics.record_pending_fail();
                    for region_id in registered.drain(..) {
                        ledger.remove_region(region_id);
                    }
                    return Vec::new();
                }
                metrics.record_pending_create();
                metrics.record_new_operator("split-region");
                registered.push(peer.region_id);

                tracing::info!(
                    region_id = peer.region_id,
                    store_id = store.id,
                    split_ratio,
                    dim = ?max_dim,
                    region_load = ?peer.loads.0,
                    "create split operation"
                );

                ops.push(op);
                state.has_split = true;

                shed += peer.loads[max_dim];
                if shed >= load_threshold {
                    break;
                }
            }
        }

        ops
    }
}

/// The base tolerance from cluster options, falling back to local config.
fn base_balance_ratio<C: ClusterView>(cluster: &C, config: &BalanceConfig) -> f64 {
    let opts = cluster.options();
    if opts.hot_balance_ratio > 0.0 {
        opts.hot_balance_ratio
    } else {
        config.balance_ratio
    }
}

/// Fetch and vet region metadata for a candidate. Unhealthy or
/// under-replicated regions are silently skipped with a counter bump.
fn lookup_region<C: ClusterView>(
    cluster: &C,
    region_id: RegionId,
    metrics: &BalanceMetrics,
) -> Option<RegionDesc> {
    let Some(region) = cluster.region(region_id) else {
        metrics.record_no_region();
        tracing::info!(region_id, "no region metadata");
        return None;
    };
    if !cluster.is_region_healthy(&region) {
        metrics.record_unhealthy_replica();
        return None;
    }
    if !cluster.is_region_replicated(&region) {
        tracing::debug!(region_id, "region has abnormal replica count");
        metrics.record_abnormal_replica();
        return None;
    }
    Some(region)
}

/// Build the operator for a migration decision and the pending influence to
/// register with it. Transfer-leader moves only read load, so its write-axis
/// influence is zeroed.
fn build_migration_operator(
    decision: &Decision,
    metrics: &BalanceMetrics,
) -> Option<(Operator, LoadVector)> {
    let built = match decision.kind {
        MigrationKind::MovePeer => build_move_operator(
            &decision.region,
            decision.src_store_id,
            decision.dst_store_id,
        ),
        MigrationKind::TransferLeader => build_transfer_leader_operator(
            &decision.region,
            decision.src_store_id,
            decision.dst_store_id,
        ),
    };
    match built {
        Ok(op) => {
            metrics.record_new_operator(op.op_label());
            let mut influence = decision.peer.stat.loads;
            if decision.kind == MigrationKind::TransferLeader {
                influence.zero_write_axes();
            }
            Some((op, influence))
        }
        Err(error) => {
            tracing::info!(
                region_id = decision.region.region_id,
                kind = ?decision.kind,
                %error,
                "fail to create operator"
            );
            metrics.record_create_operator_fail();
            None
        }
    }
}
