//! Shared fixtures for balancer integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hot_balance::{
    ClusterView, Dimension, HotPeerStat, LoadVector, OpClass, Operator, OperatorController,
    PeerRole, RegionDesc, RegionId, RegionPeer, SchedulerOptions, StoreId,
};

/// Static cluster view assembled per test.
#[derive(Default)]
pub struct MockCluster {
    pub opts: SchedulerOptions,
    pub loads: BTreeMap<StoreId, LoadVector>,
    pub peers: BTreeMap<StoreId, Vec<HotPeerStat>>,
    pub regions: BTreeMap<RegionId, RegionDesc>,
    pub unhealthy: BTreeSet<RegionId>,
    pub under_replicated: BTreeSet<RegionId>,
    pub reject_peer_stores: BTreeSet<StoreId>,
    pub reject_leader_stores: BTreeSet<StoreId>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            opts: SchedulerOptions::default(),
            ..Self::default()
        }
    }

    pub fn with_store(mut self, store_id: StoreId, loads: LoadVector) -> Self {
        self.loads.insert(store_id, loads);
        self
    }

    pub fn with_hot_peer(mut self, stat: HotPeerStat) -> Self {
        self.peers.entry(stat.store_id).or_default().push(stat);
        self
    }

    pub fn with_region(mut self, region: RegionDesc) -> Self {
        self.regions.insert(region.region_id, region);
        self
    }
}

impl ClusterView for MockCluster {
    fn options(&self) -> SchedulerOptions {
        self.opts
    }

    fn store_loads(&self) -> BTreeMap<StoreId, LoadVector> {
        self.loads.clone()
    }

    fn hot_peers(&self) -> BTreeMap<StoreId, Vec<HotPeerStat>> {
        self.peers.clone()
    }

    fn region(&self, region_id: RegionId) -> Option<RegionDesc> {
        self.regions.get(&region_id).cloned()
    }

    fn is_region_healthy(&self, region: &RegionDesc) -> bool {
        !self.unhealthy.contains(&region.region_id)
    }

    fn is_region_replicated(&self, region: &RegionDesc) -> bool {
        !self.under_replicated.contains(&region.region_id)
    }

    fn store_accepts_peer(&self, store_id: StoreId, _region: &RegionDesc) -> bool {
        !self.reject_peer_stores.contains(&store_id)
    }

    fn store_accepts_leader(&self, store_id: StoreId, _region: &RegionDesc) -> bool {
        !self.reject_leader_stores.contains(&store_id)
    }
}

/// Operator controller that records everything it is handed.
#[derive(Default)]
pub struct MockController {
    hot_region: AtomicU64,
    leader: AtomicU64,
    admin: AtomicU64,
    pub enqueued: Mutex<Vec<Arc<Operator>>>,
}

impl MockController {
    pub fn set_count(&self, class: OpClass, count: u64) {
        match class {
            OpClass::HotRegion => self.hot_region.store(count, Ordering::Relaxed),
            OpClass::Leader => self.leader.store(count, Ordering::Relaxed),
            OpClass::Admin => self.admin.store(count, Ordering::Relaxed),
        }
    }

    pub fn enqueued_count(&self) -> usize {
        self.enqueued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl OperatorController for MockController {
    fn operator_count(&self, class: OpClass) -> u64 {
        match class {
            OpClass::HotRegion => self.hot_region.load(Ordering::Relaxed),
            OpClass::Leader => self.leader.load(Ordering::Relaxed),
            OpClass::Admin => self.admin.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, ops: &[Arc<Operator>]) {
        self.enqueued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(ops.iter().cloned());
    }
}

/// Load vector with only write-byte rate set.
pub fn write_bytes(rate: f64) -> LoadVector {
    let mut loads = LoadVector::ZERO;
    loads[Dimension::WriteBytes] = rate;
    loads
}

/// Load vector with only read-byte rate set.
pub fn read_bytes(rate: f64) -> LoadVector {
    let mut loads = LoadVector::ZERO;
    loads[Dimension::ReadBytes] = rate;
    loads
}

/// Load vector with both byte-rate axes set.
pub fn rw_bytes(write: f64, read: f64) -> LoadVector {
    let mut loads = LoadVector::ZERO;
    loads[Dimension::WriteBytes] = write;
    loads[Dimension::ReadBytes] = read;
    loads
}

/// Hot peer statistic with a hit degree above the default threshold.
pub fn hot_peer(
    region_id: RegionId,
    store_id: StoreId,
    loads: LoadVector,
    is_leader: bool,
) -> HotPeerStat {
    HotPeerStat {
        region_id,
        store_id,
        is_leader,
        hit_degree: 10,
        loads,
    }
}

/// Region with voter replicas on `stores`, led from `leader`.
pub fn region(region_id: RegionId, stores: &[StoreId], leader: StoreId) -> RegionDesc {
    RegionDesc {
        region_id,
        peers: stores
            .iter()
            .map(|&store_id| RegionPeer {
                store_id,
                role: PeerRole::Voter,
            })
            .collect(),
        leader,
    }
}

pub const KIB: f64 = 1024.0;
