use anyhow::Result;
use likely_stable::unlikely;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error_bail;

/// Max number of dimensions a cuboid id can address.
pub const MAX_DIMENSIONS: usize = 63;

/// Identifier of a cuboid.
///
/// It's a bitmask over the dimension columns, bit `i` set means dimension `i` is included
/// in the aggregate. The base cuboid has all bits set.
///
/// Dimension columns of a cuboid are always laid out in ascending bit order, so the `k`-th
/// dimension column of a row is the `k`-th set bit of the id.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CuboidId(pub u64);

impl CuboidId {
    #[inline]
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// The base cuboid id of `num_dimensions` dimensions.
    pub fn base(num_dimensions: usize) -> Result<Self> {
        if unlikely(num_dimensions == 0 || num_dimensions > MAX_DIMENSIONS) {
            error_bail!(
                "invalid number of dimensions: {}, must be in [1, {}]",
                num_dimensions,
                MAX_DIMENSIONS
            );
        }

        Ok(Self((1u64 << num_dimensions) - 1))
    }

    #[inline]
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Number of dimensions in the cuboid.
    #[inline]
    pub fn dimension_count(&self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub fn contains_dimension(&self, dim: usize) -> bool {
        dim < 64 && self.0 & (1u64 << dim) != 0
    }

    /// Whether the dimensions of `self` are a subset of `other`'s.
    #[inline]
    pub fn is_subset_of(&self, other: CuboidId) -> bool {
        self.0 & !other.0 == 0
    }

    /// Whether `self` is a subset of `other` with at least one dimension less.
    #[inline]
    pub fn is_strict_subset_of(&self, other: CuboidId) -> bool {
        self.is_subset_of(other) && self.0 != other.0
    }

    /// Dimension indices of the cuboid, in column order.
    pub fn dimensions(&self) -> Vec<usize> {
        (0..64).filter(|i| self.contains_dimension(*i)).collect()
    }

    /// Remove one dimension from the cuboid.
    #[inline]
    pub fn without_dimension(&self, dim: usize) -> CuboidId {
        CuboidId(self.0 & !(1u64 << dim))
    }

    /// Positions of `child`'s dimension columns inside `self`'s row layout.
    ///
    /// Used as the projection when a child is aggregated from its parent's table.
    pub fn projection_of(&self, child: CuboidId) -> Result<Vec<usize>> {
        if unlikely(!child.is_subset_of(*self)) {
            error_bail!(
                "cuboid {} is not a subset of parent cuboid {}",
                child,
                self
            );
        }

        let parent_dims = self.dimensions();

        Ok(parent_dims
            .iter()
            .enumerate()
            .filter(|(_, dim)| child.contains_dimension(**dim))
            .map(|(pos, _)| pos)
            .collect())
    }
}

impl fmt::Display for CuboidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CuboidId {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}
