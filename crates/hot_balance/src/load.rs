//! Six-axis load vectors and the axis model used by the balancer.
//!
//! Every replica contributes load along six rate axes: write bytes, write
//! keys, write ops, read bytes, read keys, read ops. Write load is charged to
//! all replicas of a region, read load only to the leader. The balancer
//! reasons about loads normalized against the cluster per-axis mean, so 1.0
//! is "an average store" on that axis.

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// Number of tracked load axes.
pub const DIMENSION_COUNT: usize = 6;

/// One load axis.
///
/// The ops axes are tracked for observability but never drive balancing
/// decisions. Read axes are the only ones a leader transfer can move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    WriteBytes,
    WriteKeys,
    WriteOps,
    ReadBytes,
    ReadKeys,
    ReadOps,
}

impl Dimension {
    /// All axes in vector order.
    pub const ALL: [Dimension; DIMENSION_COUNT] = [
        Dimension::WriteBytes,
        Dimension::WriteKeys,
        Dimension::WriteOps,
        Dimension::ReadBytes,
        Dimension::ReadKeys,
        Dimension::ReadOps,
    ];

    /// Position of this axis inside a [`LoadVector`].
    pub fn index(self) -> usize {
        match self {
            Dimension::WriteBytes => 0,
            Dimension::WriteKeys => 1,
            Dimension::WriteOps => 2,
            Dimension::ReadBytes => 3,
            Dimension::ReadKeys => 4,
            Dimension::ReadOps => 5,
        }
    }

    /// Reverse of [`Dimension::index`].
    pub fn from_index(index: usize) -> Option<Dimension> {
        Self::ALL.get(index).copied()
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            Dimension::WriteBytes | Dimension::WriteKeys | Dimension::WriteOps
        )
    }

    pub fn is_read(self) -> bool {
        !self.is_write()
    }

    /// Ops axes are structurally excluded from balancing decisions.
    pub fn is_ops(self) -> bool {
        matches!(self, Dimension::WriteOps | Dimension::ReadOps)
    }

    /// Whether a leader transfer can move load on this axis.
    ///
    /// Followers replicate writes regardless of leadership, so only read
    /// load follows the leader.
    pub fn leader_transferable(self) -> bool {
        self.is_read()
    }

    /// Axes eligible for balancing: everything except the ops axes.
    pub fn balance_candidates() -> impl Iterator<Item = Dimension> {
        Self::ALL.into_iter().filter(|dim| !dim.is_ops())
    }

    /// Metric label for this axis.
    pub fn label(self) -> &'static str {
        match self {
            Dimension::WriteBytes => "write-byte-rate",
            Dimension::WriteKeys => "write-key-rate",
            Dimension::WriteOps => "write-ops",
            Dimension::ReadBytes => "read-byte-rate",
            Dimension::ReadKeys => "read-key-rate",
            Dimension::ReadOps => "read-ops",
        }
    }
}

/// Fixed-length vector of per-axis rates, raw or normalized depending on
/// context.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadVector(pub [f64; DIMENSION_COUNT]);

impl LoadVector {
    pub const ZERO: LoadVector = LoadVector([0.0; DIMENSION_COUNT]);

    pub fn new(values: [f64; DIMENSION_COUNT]) -> Self {
        Self(values)
    }

    /// Component-wise addition in place.
    pub fn add(&mut self, other: &LoadVector) {
        for i in 0..DIMENSION_COUNT {
            self.0[i] += other.0[i];
        }
    }

    /// Component-wise subtraction in place.
    pub fn sub(&mut self, other: &LoadVector) {
        for i in 0..DIMENSION_COUNT {
            self.0[i] -= other.0[i];
        }
    }

    /// Scale every component by `factor`.
    pub fn scale(&self, factor: f64) -> LoadVector {
        let mut out = *self;
        for value in out.0.iter_mut() {
            *value *= factor;
        }
        out
    }

    /// Divide component-wise by per-axis means. Axes with a non-positive
    /// mean are meaningless this cycle and normalize to zero.
    pub fn normalized_by(&self, means: &LoadVector) -> LoadVector {
        let mut out = LoadVector::ZERO;
        for dim in Dimension::ALL {
            let mean = means[dim];
            if mean > 0.0 {
                out[dim] = self[dim] / mean;
            }
        }
        out
    }

    /// Worst axis among `dims`: the dimension with the highest component and
    /// that component's value. Returns `None` when `dims` is empty.
    pub fn max_over(&self, dims: &[Dimension]) -> Option<(Dimension, f64)> {
        let mut best: Option<(Dimension, f64)> = None;
        for &dim in dims {
            let load = self[dim];
            match best {
                Some((_, max)) if max >= load => {}
                _ => best = Some((dim, load)),
            }
        }
        best
    }

    /// Zero the read axes. Applied to follower peers, which carry no read
    /// load.
    pub fn zero_read_axes(&mut self) {
        for dim in Dimension::ALL {
            if dim.is_read() {
                self[dim] = 0.0;
            }
        }
    }

    /// Zero the write axes. Applied to transfer-leader influence, which
    /// moves only read load.
    pub fn zero_write_axes(&mut self) {
        for dim in Dimension::ALL {
            if dim.is_write() {
                self[dim] = 0.0;
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|value| *value == 0.0)
    }
}

impl Index<Dimension> for LoadVector {
    type Output = f64;

    fn index(&self, dim: Dimension) -> &f64 {
        &self.0[dim.index()]
    }
}

impl IndexMut<Dimension> for LoadVector {
    fn index_mut(&mut self, dim: Dimension) -> &mut f64 {
        &mut self.0[dim.index()]
    }
}

/// Per-axis cluster means over a set of store load vectors.
pub fn axis_means<'a>(loads: impl Iterator<Item = &'a LoadVector>, store_count: usize) -> LoadVector {
    let mut sums = LoadVector::ZERO;
    for load in loads {
        sums.add(load);
    }
    if store_count == 0 {
        return LoadVector::ZERO;
    }
    sums.scale(1.0 / store_count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_groups_partition_the_vector() {
        for dim in Dimension::ALL {
            assert_ne!(dim.is_write(), dim.is_read());
            assert_eq!(dim.leader_transferable(), dim.is_read());
        }
        let candidates: Vec<_> = Dimension::balance_candidates().collect();
        assert_eq!(
            candidates,
            vec![
                Dimension::WriteBytes,
                Dimension::WriteKeys,
                Dimension::ReadBytes,
                Dimension::ReadKeys
            ]
        );
    }

    #[test]
    fn normalization_against_means_sums_to_store_count() {
        let stores = vec![
            LoadVector::new([100.0, 10.0, 1.0, 300.0, 30.0, 3.0]),
            LoadVector::new([300.0, 30.0, 3.0, 100.0, 10.0, 1.0]),
        ];
        let means = axis_means(stores.iter(), stores.len());
        let mut normalized_sum = LoadVector::ZERO;
        for store in &stores {
            normalized_sum.add(&store.normalized_by(&means));
        }
        for dim in Dimension::ALL {
            assert!((normalized_sum[dim] - stores.len() as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_mean_axis_normalizes_to_zero() {
        let raw = LoadVector::new([5.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let means = LoadVector::new([0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(raw.normalized_by(&means).is_zero());
    }

    #[test]
    fn max_over_reports_worst_axis() {
        let load = LoadVector::new([1.2, 0.4, 9.0, 1.5, 0.2, 9.0]);
        let dims: Vec<_> = Dimension::balance_candidates().collect();
        let (dim, value) = load.max_over(&dims).unwrap();
        assert_eq!(dim, Dimension::ReadBytes);
        assert!((value - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn follower_zeroing_clears_only_read_axes() {
        let mut load = LoadVector::new([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        load.zero_read_axes();
        assert_eq!(load, LoadVector::new([1.0, 2.0, 3.0, 0.0, 0.0, 0.0]));
    }
}
