//! Merge of the same cuboid built by several splits.
//!
//! Each split result is a table sorted by primary key, so the merge is a k-way merge: one
//! slot per split lazily fetching rows, and a min heap of the current row of each slot,
//! ordered by `(cuboid_id, dims)`. The smallest row is popped, every following row with the
//! same key is merged into it, then it's written.
//!
//! Why are measures merged without the aggregation mask?
//!
//! The mask only applies when a cuboid is aggregated from its parent. Here the rows are
//! partial states of the same cuboid from different splits, every measure must be merged.
use anyhow::Result;
use likely_stable::unlikely;
use log::info;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::grid_table::{GridRow, GridScanner};
use cubelet_core::measure::{MeasureAggregators, MeasureDesc};
use cubelet_core::writer::{output_cuboid, CuboidWriter};

use crate::cuboid_result::CuboidResult;

/// Cursor over the rows of one split result.
struct ResultMergeSlot {
    scanner: GridScanner,
}

impl ResultMergeSlot {
    fn new(result: &CuboidResult) -> Result<Self> {
        Ok(Self {
            scanner: result.table().scan()?,
        })
    }

    fn fetch_next(&mut self) -> Option<GridRow> {
        self.scanner.next()
    }
}

/// Current row of a slot in the merge heap.
///
/// Ordered by cuboid and primary key. Equal keys are ordered by slot, so rows of the same
/// key are merged in split order.
struct MergeEntry {
    cuboid_id: CuboidId,
    row: GridRow,
    slot: usize,
}

impl MergeEntry {
    fn same_key(&self, other: &MergeEntry) -> bool {
        self.cuboid_id == other.cuboid_id && self.row.dims == other.row.dims
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cuboid_id
            .cmp(&other.cuboid_id)
            .then_with(|| self.row.cmp_key(&other.row))
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

pub struct SplitMerger {
    aggregators: MeasureAggregators,
}

impl SplitMerger {
    pub fn new(measures: &[MeasureDesc]) -> Self {
        Self {
            aggregators: MeasureAggregators::new(measures),
        }
    }

    /// Merge the results of one cuboid from all splits, and write the merged rows.
    ///
    /// `results` are in split order. Returns the number of rows written.
    pub fn merge_and_output<W: CuboidWriter + ?Sized>(
        &self,
        cuboid_id: CuboidId,
        results: &[Arc<CuboidResult>],
        writer: &mut W,
    ) -> Result<usize> {
        if unlikely(results.is_empty()) {
            error_bail!("no result to merge for cuboid {}", cuboid_id);
        }

        if let Some(other) = results.iter().find(|r| r.cuboid_id() != cuboid_id) {
            error_bail!(
                "cannot merge cuboid {} into cuboid {}",
                other.cuboid_id(),
                cuboid_id
            );
        }

        if results.len() == 1 {
            return output_cuboid(cuboid_id, results[0].table(), writer);
        }

        let start = coarsetime::Instant::now();

        let mut slots = results
            .iter()
            .map(|r| ResultMergeSlot::new(r))
            .collect::<Result<Vec<_>>>()?;

        let mut heap = BinaryHeap::with_capacity(slots.len());
        for (i, slot) in slots.iter_mut().enumerate() {
            if let Some(row) = slot.fetch_next() {
                heap.push(Reverse(MergeEntry {
                    cuboid_id,
                    row,
                    slot: i,
                }));
            }
        }

        let mut count = 0;

        while let Some(Reverse(mut smallest)) = heap.pop() {
            Self::refill(&mut heap, &mut slots, cuboid_id, smallest.slot);

            while let Some(Reverse(next)) = heap.peek() {
                if !next.same_key(&smallest) {
                    break;
                }

                if let Some(Reverse(next)) = heap.pop() {
                    Self::refill(&mut heap, &mut slots, cuboid_id, next.slot);
                    self.aggregators
                        .merge_into(&mut smallest.row.measures, &next.row.measures)?;
                }
            }

            writer.write(cuboid_id, &smallest.row)?;
            count += 1;
        }

        writer.flush()?;

        info!(
            "merged cuboid {} from {} splits, rows: {}, takes {} ms",
            cuboid_id,
            results.len(),
            count,
            start.elapsed().as_millis()
        );

        Ok(count)
    }

    fn refill(
        heap: &mut BinaryHeap<Reverse<MergeEntry>>,
        slots: &mut [ResultMergeSlot],
        cuboid_id: CuboidId,
        slot: usize,
    ) {
        if let Some(row) = slots[slot].fetch_next() {
            heap.push(Reverse(MergeEntry {
                cuboid_id,
                row,
                slot,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubelet_core::grid_table::{GridInfo, GridTable, MemStoreFactory, TableTracker};
    use cubelet_core::measure::{MeasureFunction, MeasureValue};
    use cubelet_core::tool::setup_log;
    use cubelet_sinker::mem_writer::MemCuboidWriter;

    fn measures() -> Vec<MeasureDesc> {
        vec![
            MeasureDesc::new("amount", MeasureFunction::Sum),
            MeasureDesc::new("first", MeasureFunction::Min).with_only_aggr_in_base(true),
        ]
    }

    fn result(
        cuboid_id: CuboidId,
        rows: &[(&[u32], i64)],
        tracker: &Arc<TableTracker>,
    ) -> Result<Arc<CuboidResult>> {
        let table = GridTable::new(
            GridInfo::new(cuboid_id, Arc::new(measures())),
            &MemStoreFactory,
            tracker.clone(),
        )?;

        let mut builder = table.rebuild()?;
        for (dims, v) in rows {
            builder.write(GridRow::new(
                dims.to_vec(),
                vec![MeasureValue::Long(*v), MeasureValue::Long(*v)],
            ))?;
        }
        let count = builder.close()?;

        Ok(Arc::new(CuboidResult::new(cuboid_id, table, count, 0, 10)))
    }

    #[test]
    fn test_merge_three_splits() -> Result<()> {
        setup_log();

        let tracker = Arc::new(TableTracker::new());
        let cuboid = CuboidId::new(0b11);

        let results = vec![
            result(cuboid, &[(&[1, 1], 1), (&[2, 5], 2)], &tracker)?,
            result(cuboid, &[], &tracker)?,
            result(cuboid, &[(&[0, 9], 4), (&[1, 1], 8), (&[3, 0], 16)], &tracker)?,
            result(cuboid, &[(&[1, 1], -3), (&[2, 5], 32)], &tracker)?,
        ];

        let mut writer = MemCuboidWriter::new();
        let output = writer.output();

        let merger = SplitMerger::new(&measures());
        assert_eq!(merger.merge_and_output(cuboid, &results, &mut writer)?, 4);

        let rows = output.rows_of(cuboid)?;
        let dims = rows.iter().map(|r| r.dims.clone()).collect::<Vec<_>>();
        assert_eq!(dims, vec![vec![0, 9], vec![1, 1], vec![2, 5], vec![3, 0]]);

        // Every measure is merged, including the one only aggregated in base.
        assert_eq!(rows[1].measure_values(), vec![6, -3]);
        assert_eq!(rows[2].measure_values(), vec![34, 2]);

        for r in results.iter() {
            r.table().close()?;
        }

        Ok(())
    }

    #[test]
    fn test_merge_single_split_and_mismatch() -> Result<()> {
        let tracker = Arc::new(TableTracker::new());
        let cuboid = CuboidId::new(0b1);
        let merger = SplitMerger::new(&measures());

        let single = vec![result(cuboid, &[(&[1], 1), (&[2], 2)], &tracker)?];
        let mut writer = MemCuboidWriter::new();
        assert_eq!(merger.merge_and_output(cuboid, &single, &mut writer)?, 2);

        let other = vec![
            result(cuboid, &[(&[1], 1)], &tracker)?,
            result(CuboidId::new(0b10), &[(&[1], 1)], &tracker)?,
        ];
        assert!(merger.merge_and_output(cuboid, &other, &mut writer).is_err());
        assert!(merger.merge_and_output(cuboid, &[], &mut writer).is_err());

        Ok(())
    }
}
