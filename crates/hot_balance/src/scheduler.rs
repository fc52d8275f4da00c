//! Scheduler frame: the per-cycle entry point and its cross-cycle state.
//!
//! All scheduler state (ledger, relaxation, split latch, cached balancer)
//! sits behind one mutex; a scheduling cycle holds it end to end. The cycle
//! itself has no suspension points: every collaborator call is a fast local
//! read over cached views.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::balancer::{MultiBalancer, ProtocolState};
use crate::cluster::{ClusterView, StoreId};
use crate::config::BalanceConfig;
use crate::load::{Dimension, LoadVector};
use crate::metrics::BalanceMetrics;
use crate::operator::{OpClass, Operator, OperatorController};
use crate::pending::PendingLedger;
use crate::snapshot::build_snapshot;

pub const SCHEDULER_NAME: &str = "hot-region-balancer";
pub const SCHEDULER_KIND: &str = "hot-region";

/// Per-store hot summary served by the status endpoints.
#[derive(Clone, Debug)]
pub struct StoreHotStatus {
    pub store_id: StoreId,
    /// Normalized loads masked to the requested axis group.
    pub loads: LoadVector,
    /// Hot peers contributing on that group.
    pub hot_peer_count: usize,
}

#[derive(Debug)]
struct SchedulerState {
    protocol: ProtocolState,
    ledger: PendingLedger,
    pending_sums: BTreeMap<StoreId, LoadVector>,
    balancer: Option<MultiBalancer>,
}

/// The multi-dimensional hot-region balancer.
pub struct HotRegionScheduler {
    config: Mutex<BalanceConfig>,
    state: Mutex<SchedulerState>,
    metrics: Arc<BalanceMetrics>,
}

impl HotRegionScheduler {
    pub fn new(config: BalanceConfig) -> Self {
        let ledger = PendingLedger::new(config.max_zombie());
        Self {
            config: Mutex::new(config),
            state: Mutex::new(SchedulerState {
                protocol: ProtocolState::default(),
                ledger,
                pending_sums: BTreeMap::new(),
                balancer: None,
            }),
            metrics: Arc::new(BalanceMetrics::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        SCHEDULER_NAME
    }

    pub fn kind(&self) -> &'static str {
        SCHEDULER_KIND
    }

    pub fn metrics(&self) -> Arc<BalanceMetrics> {
        self.metrics.clone()
    }

    fn config_snapshot(&self) -> BalanceConfig {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current config as JSON, for the control plane's config endpoint.
    pub fn config_json(&self) -> String {
        self.config_snapshot().to_json()
    }

    /// Apply a JSON config update. Fails without side effects on invalid
    /// payloads.
    pub fn apply_config_json(&self, payload: &str) -> anyhow::Result<()> {
        let mut config = self
            .config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        config.apply_json(payload)
    }

    pub fn min_interval(&self) -> Duration {
        self.config_snapshot().min_interval()
    }

    /// Exponential interval growth toward the configured cap.
    pub fn next_interval(&self, prev: Duration) -> Duration {
        let config = self.config_snapshot();
        let min = config.min_interval();
        let max = config.max_interval();
        if prev < min {
            return min;
        }
        (prev * 2).min(max)
    }

    /// Whether the operator budget leaves room for another cycle.
    pub fn is_schedule_allowed<C: ClusterView, O: OperatorController + ?Sized>(
        &self,
        cluster: &C,
        controller: &O,
    ) -> bool {
        self.allow_balance_leader(cluster, controller)
            || self.allow_balance_region(cluster, controller)
    }

    fn allow_balance_leader<C: ClusterView, O: OperatorController + ?Sized>(
        &self,
        cluster: &C,
        controller: &O,
    ) -> bool {
        let opts = cluster.options();
        controller.operator_count(OpClass::HotRegion) < opts.hot_region_schedule_limit
            && controller.operator_count(OpClass::Leader) < opts.leader_schedule_limit
    }

    fn allow_balance_region<C: ClusterView, O: OperatorController + ?Sized>(
        &self,
        cluster: &C,
        controller: &O,
    ) -> bool {
        controller.operator_count(OpClass::HotRegion) < cluster.options().hot_region_schedule_limit
    }

    /// Run one scheduling cycle and return the operators to execute.
    pub fn schedule<C: ClusterView>(&self, cluster: &C) -> Vec<Arc<Operator>> {
        self.metrics.record_schedule();
        let config = self.config_snapshot();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let opts = cluster.options();
        if opts.hot_scheduler_mode > 0 {
            return Vec::new();
        }

        let base_ratio = if opts.hot_balance_ratio > 0.0 {
            opts.hot_balance_ratio
        } else {
            config.balance_ratio
        };
        state.protocol.balance_ratio = if state.protocol.relax_balance {
            base_ratio + config.allowed_deviation
        } else {
            base_ratio
        };

        state.ledger.set_max_zombie(config.max_zombie());
        let now = Instant::now();
        let summary = state.ledger.summarize(now);
        self.metrics.record_pending_pruned(summary.pruned as u64);
        state.pending_sums = summary.sums;
        let collected = state.ledger.gc(now);
        self.metrics.record_pending_pruned(collected as u64);

        if state.ledger.pending_region_count() == 0 {
            state.protocol.has_split = false;
            state.protocol.need_init = true;
            tracing::info!("wakeup scheduler, no pending ops");
        } else if state.protocol.relax_balance || state.protocol.has_split {
            // Let in-flight work land before deciding anything new.
            return Vec::new();
        }

        if state.balancer.is_none() || state.protocol.need_init {
            let snapshot = build_snapshot(cluster, &state.pending_sums, &config, &self.metrics);
            if snapshot.unstable {
                state.protocol.need_init = true;
            } else {
                state.protocol.need_init = false;
            }
            if snapshot.skip {
                self.metrics.record_cycle_skipped();
            }
            state.balancer = Some(MultiBalancer::new(snapshot));
        }

        let SchedulerState {
            protocol,
            ledger,
            balancer,
            ..
        } = &mut *state;
        let Some(balancer) = balancer.as_mut() else {
            return Vec::new();
        };
        balancer.solve_multi_loads(cluster, protocol, ledger, &self.metrics, &config)
    }

    /// Number of regions with an operator still in flight.
    pub fn pending_region_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .ledger
            .pending_region_count()
    }

    /// Whether the relaxation latch is currently set.
    pub fn is_relaxed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .protocol
            .relax_balance
    }

    /// Whether a split batch is still in flight.
    pub fn has_pending_split(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .protocol
            .has_split
    }

    /// Per-store hot summary over the write axes.
    pub fn hot_write_status(&self) -> Vec<StoreHotStatus> {
        self.hot_status(Dimension::is_write)
    }

    /// Per-store hot summary over the read axes.
    pub fn hot_read_status(&self) -> Vec<StoreHotStatus> {
        self.hot_status(Dimension::is_read)
    }

    fn hot_status(&self, keep_axis: fn(Dimension) -> bool) -> Vec<StoreHotStatus> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(balancer) = state.balancer.as_ref() else {
            return Vec::new();
        };
        balancer
            .snapshot()
            .stores
            .iter()
            .map(|store| {
                let mut loads = store.loads;
                for dim in Dimension::ALL {
                    if !keep_axis(dim) {
                        loads[dim] = 0.0;
                    }
                }
                let hot_peer_count = store
                    .hot_peers
                    .values()
                    .filter(|peer| {
                        Dimension::ALL
                            .into_iter()
                            .any(|dim| keep_axis(dim) && peer.loads[dim] > 0.0)
                    })
                    .count();
                StoreHotStatus {
                    store_id: store.id,
                    loads,
                    hot_peer_count,
                }
            })
            .collect()
    }

    /// Raw pending influence per store, restricted to read axes.
    pub fn read_pending_influence(&self) -> BTreeMap<StoreId, LoadVector> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.ledger.influence_by_store(Dimension::is_read)
    }

    /// Raw pending influence per store, restricted to write axes.
    pub fn write_pending_influence(&self) -> BTreeMap<StoreId, LoadVector> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.ledger.influence_by_store(Dimension::is_write)
    }
}

/// Spawn the background driver loop.
///
/// The driver invokes the scheduler at a growing interval (reset to the
/// minimum whenever a cycle makes progress) and hands emitted operators to
/// the controller for execution.
pub fn spawn<C, O>(scheduler: Arc<HotRegionScheduler>, cluster: Arc<C>, controller: Arc<O>)
where
    C: ClusterView + Send + Sync + 'static,
    O: OperatorController + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut interval = scheduler.min_interval();
        loop {
            // Jitter up to 10% keeps co-located schedulers from ticking in
            // lockstep.
            let jitter_cap = (interval.as_millis() as u64 / 10).max(1);
            let jitter = Duration::from_millis(rng.gen_range(0..jitter_cap));
            tokio::time::sleep(interval + jitter).await;

            if !scheduler.is_schedule_allowed(cluster.as_ref(), controller.as_ref()) {
                interval = scheduler.next_interval(interval);
                continue;
            }

            let ops = scheduler.schedule(cluster.as_ref());
            if ops.is_empty() {
                interval = scheduler.next_interval(interval);
            } else {
                tracing::info!(count = ops.len(), "emitting operators");
                controller.enqueue(&ops);
                interval = scheduler.min_interval();
            }
        }
    });
}
