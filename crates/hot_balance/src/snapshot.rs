//! Per-cycle snapshot of normalized store and hot-peer loads.
//!
//! Built once at the start of a balancing pass and treated as immutable
//! input by the decision loop (the loop only adjusts its in-memory copy when
//! it emits a migration). The snapshot also decides which axes are allowed
//! this cycle and whether the cycle should be skipped outright.

use std::collections::BTreeMap;

use crate::cluster::{ClusterView, HotPeerStat, RegionId, StoreId};
use crate::config::BalanceConfig;
use crate::load::{Dimension, LoadVector};
use crate::metrics::{BalanceMetrics, StoreAxisGauges};

/// One hot replica with loads normalized against the cluster means.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub region_id: RegionId,
    pub store_id: StoreId,
    pub is_leader: bool,
    /// Normalized loads; read axes are zero for followers.
    pub loads: LoadVector,
    /// Raw statistics, kept for operator influence attribution.
    pub stat: HotPeerStat,
}

/// One store with normalized loads and its hot peer set.
#[derive(Clone, Debug)]
pub struct StoreInfo {
    pub id: StoreId,
    /// Normalized loads with pending influence folded in.
    pub loads: LoadVector,
    pub hot_peers: BTreeMap<RegionId, PeerInfo>,
}

impl StoreInfo {
    /// Worst allowed axis and its normalized load.
    pub fn max_load(&self, allowed: &[Dimension]) -> Option<(Dimension, f64)> {
        self.loads.max_over(allowed)
    }
}

/// Hot peers of one store ranked by contribution to a single axis,
/// descending, with the running mass of still-unpopped peers.
#[derive(Debug)]
pub struct SortedPeers {
    dim: Dimension,
    peers: Vec<PeerInfo>,
    cursor: usize,
    remain: f64,
}

impl SortedPeers {
    pub fn build(store: &StoreInfo, dim: Dimension) -> Self {
        let mut peers: Vec<PeerInfo> = store.hot_peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            b.loads[dim]
                .partial_cmp(&a.loads[dim])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let remain = peers.iter().map(|peer| peer.loads[dim]).sum();
        Self {
            dim,
            peers,
            cursor: 0,
            remain,
        }
    }

    /// Mass on the ranked axis across peers not yet popped.
    pub fn remain_loads(&self) -> f64 {
        self.remain
    }

    /// Next hottest peer; shrinks the remaining mass by its contribution.
    pub fn pop(&mut self) -> Option<PeerInfo> {
        let peer = self.peers.get(self.cursor)?.clone();
        self.cursor += 1;
        self.remain -= peer.loads[self.dim];
        Some(peer)
    }
}

/// Immutable inputs for one balancing pass.
#[derive(Debug, Default)]
pub struct BalanceSnapshot {
    pub stores: Vec<StoreInfo>,
    /// Axes above their noise floor this cycle, ops axes excluded.
    pub allowed: Vec<Dimension>,
    /// Per-axis cluster means the loads were normalized against.
    pub exp_loads: LoadVector,
    /// Skip the whole cycle: no allowed axis, or load unstable.
    pub skip: bool,
    /// Hot peers do not explain the store loads; the next cycle must
    /// rebuild.
    pub unstable: bool,
}

impl BalanceSnapshot {
    /// Highest normalized store load across the allowed axes. The cluster
    /// mean is 1.0, so this is the imbalance ratio of the hottest store.
    pub fn balance_ratio(&self) -> f64 {
        let mut ratio: f64 = 0.0;
        for store in &self.stores {
            for &dim in &self.allowed {
                ratio = ratio.max(store.loads[dim]);
            }
        }
        ratio
    }
}

/// Select the axes eligible for balancing this cycle.
fn allowed_dimensions(exp_loads: &LoadVector, min_exp_loads: &[f64]) -> Vec<Dimension> {
    Dimension::balance_candidates()
        .filter(|dim| exp_loads[*dim] >= min_exp_loads[dim.index()])
        .collect()
}

/// Build the per-cycle snapshot.
///
/// Raw store loads are folded with the pending influence sums before
/// normalization so the pass reasons about predicted load rather than the
/// stale statistics of in-flight operators.
pub fn build_snapshot<C: ClusterView>(
    cluster: &C,
    pending_sums: &BTreeMap<StoreId, LoadVector>,
    config: &BalanceConfig,
    metrics: &BalanceMetrics,
) -> BalanceSnapshot {
    let opts = cluster.options();
    let raw_loads = cluster.store_loads();
    let store_count = raw_loads.len();
    if store_count == 0 {
        return BalanceSnapshot {
            skip: true,
            ..BalanceSnapshot::default()
        };
    }

    let min_degree = opts.hot_region_cache_hits_threshold;
    let mut hot_peers = cluster.hot_peers();
    for peers in hot_peers.values_mut() {
        peers.retain(|peer| peer.hit_degree >= min_degree);
    }

    let exp_loads = crate::load::axis_means(raw_loads.values(), store_count);

    // Predicted load: statistics plus what in-flight operators will move.
    let mut folded_loads = raw_loads.clone();
    for (store_id, loads) in folded_loads.iter_mut() {
        if let Some(pending) = pending_sums.get(store_id) {
            loads.add(pending);
        }
    }

    let allowed = allowed_dimensions(&exp_loads, &config.min_exp_loads);
    if allowed.is_empty() {
        tracing::debug!("no load axis above its noise floor, skipping cycle");
        return BalanceSnapshot {
            allowed,
            exp_loads,
            skip: true,
            ..BalanceSnapshot::default()
        };
    }

    for (store_id, loads) in &folded_loads {
        let pending = pending_sums.get(store_id).copied().unwrap_or_default();
        for &dim in &allowed {
            let adjusted = loads[dim];
            let pending_ratio = if adjusted != 0.0 {
                pending[dim] / adjusted
            } else {
                0.0
            };
            metrics.set_store_gauges(
                *store_id,
                dim.label(),
                StoreAxisGauges {
                    pending_ratio,
                    adjusted_load: adjusted,
                },
            );
        }
    }

    let mut stores = Vec::with_capacity(store_count);
    let mut max_load_diff_ratio: f64 = 0.0;
    for (&store_id, folded) in &folded_loads {
        let mut peers = BTreeMap::new();
        let mut hot_peer_totals = LoadVector::ZERO;
        for stat in hot_peers.remove(&store_id).unwrap_or_default() {
            let mut loads = stat.loads.normalized_by(&exp_loads);
            if !stat.is_leader {
                // Followers replicate writes but serve no reads.
                loads.zero_read_axes();
            }
            for dim in Dimension::ALL {
                hot_peer_totals[dim] += loads[dim] * exp_loads[dim];
            }
            peers.insert(
                stat.region_id,
                PeerInfo {
                    region_id: stat.region_id,
                    store_id,
                    is_leader: stat.is_leader,
                    loads,
                    stat,
                },
            );
        }

        let store_info = StoreInfo {
            id: store_id,
            loads: folded.normalized_by(&exp_loads),
            hot_peers: peers,
        };

        for &dim in &allowed {
            let store_total = folded[dim];
            if store_total > 0.0 {
                let ratio = ((store_total - hot_peer_totals[dim]) / store_total).abs();
                max_load_diff_ratio = max_load_diff_ratio.max(ratio);
            }
        }

        tracing::debug!(
            store_id,
            total = ?folded.0,
            hot_peer_total = ?hot_peer_totals.0,
            "store load info"
        );
        stores.push(store_info);
    }

    let unstable = max_load_diff_ratio > config.load_stable_threshold;
    if unstable {
        tracing::info!(max_load_diff_ratio, "load not stable, skipping cycle");
    }

    BalanceSnapshot {
        stores,
        allowed,
        exp_loads,
        skip: unstable,
        unstable,
    }
}
