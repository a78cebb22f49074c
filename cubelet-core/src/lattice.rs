//! Cuboid lattice definitions.
//!
//! The lattice is a DAG rooted at the base cuboid, but each build walks it as a tree: every
//! non-base cuboid is spanned from exactly one chosen parent. A `CuboidScheduler` answers
//! which children a cuboid spans. It's queried read-only during a build.
use anyhow::Result;
use likely_stable::unlikely;
use log::info;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::cuboid::CuboidId;
use crate::error_bail;

/// The lattice-definition contract used by the builders.
pub trait CuboidScheduler: Send + Sync {
    /// The root of the lattice.
    fn base_cuboid_id(&self) -> CuboidId;

    /// Direct children spanned from `parent`. Empty for leaves.
    fn spanning_cuboids(&self, parent: CuboidId) -> Vec<CuboidId>;

    /// Total number of cuboids in the lattice, base included.
    fn cuboid_count(&self) -> usize;

    /// All cuboids reachable from the base cuboid, in breadth first order.
    fn all_cuboids(&self) -> Vec<CuboidId> {
        let mut result = Vec::with_capacity(self.cuboid_count());
        let mut queue = VecDeque::new();
        queue.push_back(self.base_cuboid_id());

        while let Some(cuboid) = queue.pop_front() {
            result.push(cuboid);
            queue.extend(self.spanning_cuboids(cuboid));
        }

        result
    }

    /// The parent that spans `cuboid`, `None` for the base cuboid or unknown cuboids.
    fn parent_of(&self, cuboid: CuboidId) -> Option<CuboidId> {
        self.all_cuboids()
            .into_iter()
            .find(|p| self.spanning_cuboids(*p).contains(&cuboid))
    }
}

/// All `2^n` cuboids of `n` dimensions.
///
/// Every non-base cuboid is spanned by the parent that adds back its lowest missing
/// dimension. So cuboid `c` spans `c - {i}` for every set bit `i` below the lowest missing
/// dimension of `c`.
pub struct FullLatticeScheduler {
    num_dimensions: usize,
    base: CuboidId,
}

impl FullLatticeScheduler {
    pub fn new(num_dimensions: usize) -> Result<Self> {
        let base = CuboidId::base(num_dimensions)?;

        Ok(Self {
            num_dimensions,
            base,
        })
    }

    pub fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    /// Lowest dimension of the base cuboid which is not in `cuboid`.
    fn lowest_missing_dimension(&self, cuboid: CuboidId) -> usize {
        (0..self.num_dimensions)
            .find(|d| !cuboid.contains_dimension(*d))
            .unwrap_or(self.num_dimensions)
    }
}

impl CuboidScheduler for FullLatticeScheduler {
    fn base_cuboid_id(&self) -> CuboidId {
        self.base
    }

    fn spanning_cuboids(&self, parent: CuboidId) -> Vec<CuboidId> {
        if !parent.is_subset_of(self.base) {
            return vec![];
        }

        let limit = self.lowest_missing_dimension(parent);

        (0..limit)
            .filter(|d| parent.contains_dimension(*d))
            .map(|d| parent.without_dimension(d))
            .collect()
    }

    fn cuboid_count(&self) -> usize {
        1usize << self.num_dimensions
    }
}

/// Lattice given explicitly as a parent to children map.
///
/// Validated at construction: every child must be a strict subset of its parent, and every
/// cuboid must be spanned at most once, so that the traversal is a tree.
pub struct ExplicitLatticeScheduler {
    base: CuboidId,
    children: BTreeMap<CuboidId, Vec<CuboidId>>,
    count: usize,
}

impl ExplicitLatticeScheduler {
    pub fn new(base: CuboidId, children: BTreeMap<CuboidId, Vec<CuboidId>>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        seen.insert(base);

        let mut queue = VecDeque::new();
        queue.push_back(base);

        while let Some(parent) = queue.pop_front() {
            let Some(spanning) = children.get(&parent) else {
                continue;
            };

            for child in spanning {
                if unlikely(!child.is_strict_subset_of(parent)) {
                    error_bail!(
                        "child cuboid {} is not a strict subset of parent cuboid {}",
                        child,
                        parent
                    );
                }

                if unlikely(!seen.insert(*child)) {
                    error_bail!("cuboid {} is spanned more than once", child);
                }

                queue.push_back(*child);
            }
        }

        let unreachable = children
            .keys()
            .filter(|k| !seen.contains(*k))
            .collect::<Vec<_>>();

        if !unreachable.is_empty() {
            info!(
                "ignore parents not reachable from base cuboid {}: {:?}",
                base, unreachable
            );
        }

        Ok(Self {
            base,
            children,
            count: seen.len(),
        })
    }
}

impl CuboidScheduler for ExplicitLatticeScheduler {
    fn base_cuboid_id(&self) -> CuboidId {
        self.base
    }

    fn spanning_cuboids(&self, parent: CuboidId) -> Vec<CuboidId> {
        self.children.get(&parent).cloned().unwrap_or_default()
    }

    fn cuboid_count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lattice_covers_all_cuboids_once() -> Result<()> {
        for n in 1..=5 {
            let scheduler = FullLatticeScheduler::new(n)?;
            let all = scheduler.all_cuboids();

            assert_eq!(all.len(), 1 << n);
            assert_eq!(scheduler.cuboid_count(), 1 << n);

            let unique = all.iter().collect::<BTreeSet<_>>();
            assert_eq!(unique.len(), all.len());
        }

        Ok(())
    }

    #[test]
    fn test_full_lattice_children_drop_one_dimension() -> Result<()> {
        let scheduler = FullLatticeScheduler::new(4)?;

        for parent in scheduler.all_cuboids() {
            for child in scheduler.spanning_cuboids(parent) {
                assert!(child.is_strict_subset_of(parent));
                assert_eq!(child.dimension_count() + 1, parent.dimension_count());
            }
        }

        assert!(scheduler.spanning_cuboids(CuboidId::new(0b1100)).is_empty());
        assert_eq!(
            scheduler.spanning_cuboids(CuboidId::new(0b0011)),
            vec![CuboidId::new(0b0010), CuboidId::new(0b0001)]
        );
        assert_eq!(
            scheduler.spanning_cuboids(CuboidId::new(0b1111)),
            vec![
                CuboidId::new(0b1110),
                CuboidId::new(0b1101),
                CuboidId::new(0b1011),
                CuboidId::new(0b0111)
            ]
        );

        Ok(())
    }

    #[test]
    fn test_explicit_lattice() -> Result<()> {
        let mut children = BTreeMap::new();
        children.insert(
            CuboidId::new(0b111),
            vec![CuboidId::new(0b011), CuboidId::new(0b110)],
        );
        children.insert(CuboidId::new(0b011), vec![CuboidId::new(0b001)]);

        let scheduler = ExplicitLatticeScheduler::new(CuboidId::new(0b111), children)?;

        assert_eq!(scheduler.cuboid_count(), 4);
        assert_eq!(
            scheduler.parent_of(CuboidId::new(0b001)),
            Some(CuboidId::new(0b011))
        );
        assert_eq!(scheduler.parent_of(CuboidId::new(0b111)), None);

        Ok(())
    }

    #[test]
    fn test_explicit_lattice_rejects_invalid_child() {
        let mut children = BTreeMap::new();
        children.insert(CuboidId::new(0b011), vec![CuboidId::new(0b100)]);

        assert!(ExplicitLatticeScheduler::new(CuboidId::new(0b011), children).is_err());

        let mut children = BTreeMap::new();
        children.insert(
            CuboidId::new(0b111),
            vec![CuboidId::new(0b011), CuboidId::new(0b101)],
        );
        children.insert(CuboidId::new(0b011), vec![CuboidId::new(0b001)]);
        children.insert(CuboidId::new(0b101), vec![CuboidId::new(0b001)]);

        assert!(ExplicitLatticeScheduler::new(CuboidId::new(0b111), children).is_err());
    }
}
