use anyhow::Result;
use likely_stable::unlikely;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::error_bail;
use crate::grid_table::GridRow;
use crate::measure::{MeasureAggregators, MeasureValue};

/// Overhead of one entry in the aggregation cache, besides key and states.
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Group-by aggregation over a stream of rows.
///
/// Each input row is projected onto the kept dimension columns, then merged into the
/// aggregation cache by key. The cache is ordered, so the output rows come out in primary
/// key order, ready to be written into a `GridTable`.
///
/// The estimated size of the cache is tracked while aggregating, it's the gauge used to
/// measure the memory of the base cuboid.
pub struct AggregateScanner {
    /// Positions of the kept dimension columns in the input rows. `None` keeps all.
    projection: Option<Vec<usize>>,

    aggregators: MeasureAggregators,

    cache: BTreeMap<Vec<u32>, Vec<MeasureValue>>,

    cache_bytes: usize,

    input_rows: usize,
}

impl AggregateScanner {
    /// Aggregate by all dimension columns of the input.
    pub fn new(aggregators: MeasureAggregators) -> Self {
        Self {
            projection: None,
            aggregators,
            cache: BTreeMap::new(),
            cache_bytes: 0,
            input_rows: 0,
        }
    }

    /// Aggregate by the dimension columns at `projection` of the input.
    pub fn with_projection(projection: Vec<usize>, aggregators: MeasureAggregators) -> Self {
        Self {
            projection: Some(projection),
            ..Self::new(aggregators)
        }
    }

    fn project(&self, dims: Vec<u32>) -> Result<Vec<u32>> {
        match &self.projection {
            None => Ok(dims),
            Some(projection) => {
                let mut key = Vec::with_capacity(projection.len());
                for pos in projection {
                    match dims.get(*pos) {
                        Some(v) => key.push(*v),
                        None => {
                            error_bail!(
                                "projection out of bounds, pos: {}, dims: {}",
                                pos,
                                dims.len()
                            );
                        }
                    }
                }

                Ok(key)
            }
        }
    }

    /// Merge one row into the cache.
    pub fn aggregate(&mut self, row: GridRow) -> Result<()> {
        if unlikely(row.measures.len() != self.aggregators.len()) {
            error_bail!(
                "measure count mismatch, expected: {}, got: {}",
                self.aggregators.len(),
                row.measures.len()
            );
        }

        let key = self.project(row.dims)?;
        self.input_rows += 1;

        match self.cache.entry(key) {
            Entry::Vacant(entry) => {
                self.cache_bytes += ENTRY_OVERHEAD_BYTES
                    + entry.key().len() * 4
                    + states_bytes(&row.measures);
                entry.insert(row.measures);
            }
            Entry::Occupied(mut entry) => {
                let before = states_bytes(entry.get());
                self.aggregators.merge_into(entry.get_mut(), &row.measures)?;
                let after = states_bytes(entry.get());

                self.cache_bytes = (self.cache_bytes + after).saturating_sub(before);
            }
        }

        Ok(())
    }

    /// Estimated bytes of the aggregation cache.
    #[inline]
    pub fn estimated_cache_bytes(&self) -> usize {
        self.cache_bytes
    }

    pub fn input_rows(&self) -> usize {
        self.input_rows
    }

    /// Number of distinct keys aggregated so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Consume the scanner, returning the aggregated rows in key order.
    pub fn into_rows(self) -> impl Iterator<Item = GridRow> {
        self.cache
            .into_iter()
            .map(|(dims, measures)| GridRow::new(dims, measures))
    }
}

fn states_bytes(states: &[MeasureValue]) -> usize {
    states.iter().map(|s| s.estimated_bytes()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::{MeasureDesc, MeasureFunction};

    fn descs() -> Vec<MeasureDesc> {
        vec![
            MeasureDesc::new("amount", MeasureFunction::Sum),
            MeasureDesc::new("cnt", MeasureFunction::Count),
        ]
    }

    fn row(dims: &[u32], amount: i64) -> GridRow {
        GridRow::new(
            dims.to_vec(),
            vec![MeasureValue::Long(amount), MeasureValue::Long(1)],
        )
    }

    #[test]
    fn test_aggregate_all_dims() -> Result<()> {
        let mut scanner = AggregateScanner::new(MeasureAggregators::new(&descs()));

        scanner.aggregate(row(&[1, 2], 3))?;
        scanner.aggregate(row(&[1, 1], 10))?;
        scanner.aggregate(row(&[1, 1], 5))?;

        assert_eq!(scanner.input_rows(), 3);
        assert_eq!(scanner.len(), 2);
        assert!(scanner.estimated_cache_bytes() > 0);

        let rows = scanner.into_rows().collect::<Vec<_>>();
        assert_eq!(rows[0].dims, vec![1, 1]);
        assert_eq!(rows[0].measure_values(), vec![15, 2]);
        assert_eq!(rows[1].dims, vec![1, 2]);
        assert_eq!(rows[1].measure_values(), vec![3, 1]);

        Ok(())
    }

    #[test]
    fn test_aggregate_with_projection() -> Result<()> {
        let mut scanner =
            AggregateScanner::with_projection(vec![1], MeasureAggregators::new(&descs()));

        scanner.aggregate(row(&[2, 7], 1))?;
        scanner.aggregate(row(&[1, 7], 2))?;
        scanner.aggregate(row(&[1, 3], 4))?;

        let rows = scanner.into_rows().collect::<Vec<_>>();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].dims, vec![3]);
        assert_eq!(rows[0].measure_values(), vec![4, 1]);
        assert_eq!(rows[1].dims, vec![7]);
        assert_eq!(rows[1].measure_values(), vec![3, 2]);

        Ok(())
    }

    #[test]
    fn test_aggregate_bad_row() {
        let mut scanner =
            AggregateScanner::with_projection(vec![3], MeasureAggregators::new(&descs()));
        assert!(scanner.aggregate(row(&[1, 2], 1)).is_err());

        let mut scanner = AggregateScanner::new(MeasureAggregators::new(&descs()));
        assert!(scanner
            .aggregate(GridRow::new(vec![1], vec![MeasureValue::Long(1)]))
            .is_err());
    }
}
