//! Operator model: the executable plans the balancer emits.
//!
//! Operators are constructed here but executed by the surrounding operator
//! controller. The balancer only observes their terminal state through the
//! shared completion flag when it summarizes pending influence.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::bail;

use crate::cluster::{PeerRole, RegionDesc, RegionId, StoreId};
use crate::load::Dimension;

/// Operator class used for concurrency limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    HotRegion,
    Leader,
    Admin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpPriority {
    Normal,
    High,
}

/// Key-range axis a split divides along.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitDim {
    Bytes,
    Keys,
}

impl SplitDim {
    /// Wire encoding consumed by the split executor.
    pub fn wire(self) -> u64 {
        match self {
            SplitDim::Bytes => 0,
            SplitDim::Keys => 1,
        }
    }
}

/// Which statistics stream drives a split: read 0, write 1 on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitSide {
    Read,
    Write,
}

impl SplitSide {
    pub fn wire(self) -> u64 {
        match self {
            SplitSide::Read => 0,
            SplitSide::Write => 1,
        }
    }
}

/// Map a balancing axis to split parameters. Byte axes split by bytes,
/// key and ops axes split by keys.
pub fn split_params_for(dim: Dimension) -> (SplitDim, SplitSide) {
    let split_dim = match dim {
        Dimension::WriteBytes | Dimension::ReadBytes => SplitDim::Bytes,
        _ => SplitDim::Keys,
    };
    let side = if dim.is_write() {
        SplitSide::Write
    } else {
        SplitSide::Read
    };
    (split_dim, side)
}

/// Concrete plan payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OperatorKind {
    /// Add a replica on `to`, remove the one on `from`. Role is copied from
    /// the source peer.
    MovePeer {
        from: StoreId,
        to: StoreId,
        role: PeerRole,
    },
    /// Move the leader replica: transfer leadership away first, then move
    /// the peer.
    MoveLeader { from: StoreId, to: StoreId },
    /// Transfer leadership to an existing voter replica.
    TransferLeader { from: StoreId, to: StoreId },
    /// Split the region at the point where `ratio` of the tracked load
    /// (ratio check policy) falls to the left.
    SplitRegion {
        dim: SplitDim,
        side: SplitSide,
        ratio: f64,
    },
}

/// An emitted plan plus its shared completion state.
#[derive(Debug)]
pub struct Operator {
    pub region_id: RegionId,
    pub desc: &'static str,
    pub kind: OperatorKind,
    pub class: OpClass,
    pub priority: OpPriority,
    created_at: Instant,
    finished_at: Mutex<Option<Instant>>,
}

impl Operator {
    pub fn new(
        region_id: RegionId,
        desc: &'static str,
        kind: OperatorKind,
        class: OpClass,
        priority: OpPriority,
    ) -> Self {
        Self {
            region_id,
            desc,
            kind,
            class,
            priority,
            created_at: Instant::now(),
            finished_at: Mutex::new(None),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Called by the controller when execution reaches a terminal state.
    /// Idempotent; the first call wins.
    pub fn mark_finished(&self) {
        let mut finished = self
            .finished_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if finished.is_none() {
            *finished = Some(Instant::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Time since the operator finished, `None` while it is still running.
    pub fn finished_for(&self, now: Instant) -> Option<Duration> {
        self.finished_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn op_label(&self) -> &'static str {
        match self.kind {
            OperatorKind::MovePeer { .. } | OperatorKind::MoveLeader { .. } => "move-peer",
            OperatorKind::TransferLeader { .. } => "transfer-leader",
            OperatorKind::SplitRegion { .. } => "split-region",
        }
    }
}

/// Build the operator that moves `region`'s replica from `src` to `dst`.
/// A leading source peer becomes a compound move-leader plan.
pub fn build_move_operator(
    region: &RegionDesc,
    src: StoreId,
    dst: StoreId,
) -> anyhow::Result<Operator> {
    let Some(src_peer) = region.peer_on(src) else {
        bail!("region {} has no peer on store {src}", region.region_id);
    };
    let kind = if region.is_leader_store(src) {
        OperatorKind::MoveLeader { from: src, to: dst }
    } else {
        OperatorKind::MovePeer {
            from: src,
            to: dst,
            role: src_peer.role,
        }
    };
    Ok(Operator::new(
        region.region_id,
        "move-hot-peer",
        kind,
        OpClass::HotRegion,
        OpPriority::High,
    ))
}

/// Build the operator that transfers `region`'s leadership from `src` to
/// `dst`. The destination must already host a voter replica.
pub fn build_transfer_leader_operator(
    region: &RegionDesc,
    src: StoreId,
    dst: StoreId,
) -> anyhow::Result<Operator> {
    if !region.has_voter_on(dst) {
        bail!(
            "region {} has no voter on destination store {dst}",
            region.region_id
        );
    }
    Ok(Operator::new(
        region.region_id,
        "transfer-hot-leader",
        OperatorKind::TransferLeader { from: src, to: dst },
        OpClass::HotRegion,
        OpPriority::High,
    ))
}

/// Build the operator that splits `region_id` along the axis that made it
/// too hot to move.
pub fn build_split_operator(region_id: RegionId, dim: Dimension, ratio: f64) -> Operator {
    let (split_dim, side) = split_params_for(dim);
    Operator::new(
        region_id,
        "hotspot-split-region",
        OperatorKind::SplitRegion {
            dim: split_dim,
            side,
            ratio,
        },
        OpClass::Admin,
        OpPriority::High,
    )
}

/// The operator controller collaborator: executes operators and reports how
/// many are in flight per class.
pub trait OperatorController {
    fn operator_count(&self, class: OpClass) -> u64;

    /// Hand a batch of freshly built operators to the executor.
    fn enqueue(&self, ops: &[std::sync::Arc<Operator>]);
}
