//! Read-only cluster view consumed by the balancer.
//!
//! The balancer does not own region metadata or load statistics. It reads
//! both through [`ClusterView`], a snapshot-style interface the surrounding
//! control plane implements over its cached state. All calls are treated as
//! fast local reads; a scheduling cycle never blocks on them.

use std::collections::BTreeMap;

use crate::load::LoadVector;

/// Storage node identifier.
pub type StoreId = u64;
/// Region (contiguous key range) identifier.
pub type RegionId = u64;

/// Replica role within a region's raft group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    Voter,
    Learner,
}

/// One replica of a region.
#[derive(Clone, Copy, Debug)]
pub struct RegionPeer {
    pub store_id: StoreId,
    pub role: PeerRole,
}

/// Region metadata as served by the control plane.
#[derive(Clone, Debug)]
pub struct RegionDesc {
    pub region_id: RegionId,
    pub peers: Vec<RegionPeer>,
    /// Store hosting the leader replica.
    pub leader: StoreId,
}

impl RegionDesc {
    /// Stores currently holding a replica of this region.
    pub fn store_ids(&self) -> Vec<StoreId> {
        self.peers.iter().map(|peer| peer.store_id).collect()
    }

    pub fn peer_on(&self, store_id: StoreId) -> Option<&RegionPeer> {
        self.peers.iter().find(|peer| peer.store_id == store_id)
    }

    /// True when `store_id` hosts a voter replica. Leader transfers require
    /// a voter at the destination.
    pub fn has_voter_on(&self, store_id: StoreId) -> bool {
        matches!(self.peer_on(store_id), Some(peer) if peer.role == PeerRole::Voter)
    }

    pub fn is_leader_store(&self, store_id: StoreId) -> bool {
        self.leader == store_id
    }
}

/// Per-peer hot statistics from the hot-statistics pipeline.
///
/// `loads` are raw rates. `hit_degree` counts consecutive cache hits; peers
/// below the configured threshold are not considered hot.
#[derive(Clone, Debug)]
pub struct HotPeerStat {
    pub region_id: RegionId,
    pub store_id: StoreId,
    pub is_leader: bool,
    pub hit_degree: u64,
    pub loads: LoadVector,
}

/// Cluster-owned scheduling options, re-read every cycle.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerOptions {
    /// When greater than zero this scheduler is disabled in favor of others.
    pub hot_scheduler_mode: u32,
    /// Fractional tolerance around normalized load 1.0.
    pub hot_balance_ratio: f64,
    /// Cap on concurrently running hot-region operators.
    pub hot_region_schedule_limit: u64,
    /// Cap on concurrently running leader operators.
    pub leader_schedule_limit: u64,
    /// Minimum hit degree for a peer to count as hot.
    pub hot_region_cache_hits_threshold: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            hot_scheduler_mode: 0,
            hot_balance_ratio: 0.1,
            hot_region_schedule_limit: 4,
            leader_schedule_limit: 4,
            hot_region_cache_hits_threshold: 3,
        }
    }
}

/// Read-only view over cluster metadata and statistics.
///
/// The placement, store-state, and special-use filters live with the control
/// plane; the balancer only asks the aggregate questions
/// ([`ClusterView::store_accepts_peer`], [`ClusterView::store_accepts_leader`]).
pub trait ClusterView {
    fn options(&self) -> SchedulerOptions;

    /// Raw per-store load rates across all six axes, including cold regions.
    fn store_loads(&self) -> BTreeMap<StoreId, LoadVector>;

    /// Hot peer statistics grouped by host store.
    fn hot_peers(&self) -> BTreeMap<StoreId, Vec<HotPeerStat>>;

    fn region(&self, region_id: RegionId) -> Option<RegionDesc>;

    /// Stores hosting a non-leader replica of `region`.
    fn follower_stores(&self, region: &RegionDesc) -> Vec<StoreId> {
        region
            .peers
            .iter()
            .filter(|peer| peer.store_id != region.leader)
            .map(|peer| peer.store_id)
            .collect()
    }

    /// Region has no pending-peer or down-peer anomalies that forbid
    /// scheduling.
    fn is_region_healthy(&self, region: &RegionDesc) -> bool;

    /// Region has its full complement of replicas.
    fn is_region_replicated(&self, region: &RegionDesc) -> bool;

    /// Store state, placement rules, and special-use labels allow the store
    /// to accept a new replica of `region`.
    fn store_accepts_peer(&self, store_id: StoreId, region: &RegionDesc) -> bool;

    /// Store state, leader placement rules, and special-use labels allow the
    /// store to accept leadership of `region`.
    fn store_accepts_leader(&self, store_id: StoreId, region: &RegionDesc) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> RegionDesc {
        RegionDesc {
            region_id: 7,
            peers: vec![
                RegionPeer {
                    store_id: 1,
                    role: PeerRole::Voter,
                },
                RegionPeer {
                    store_id: 2,
                    role: PeerRole::Voter,
                },
                RegionPeer {
                    store_id: 3,
                    role: PeerRole::Learner,
                },
            ],
            leader: 1,
        }
    }

    #[test]
    fn voter_check_distinguishes_learners() {
        let region = region();
        assert!(region.has_voter_on(2));
        assert!(!region.has_voter_on(3));
        assert!(!region.has_voter_on(9));
    }

    #[test]
    fn store_ids_cover_all_replicas() {
        assert_eq!(region().store_ids(), vec![1, 2, 3]);
    }
}
