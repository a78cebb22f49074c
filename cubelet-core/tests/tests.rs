use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

use cubelet_core::aggregate_scanner::AggregateScanner;
use cubelet_core::cuboid::CuboidId;
use cubelet_core::grid_block::GridBlock;
use cubelet_core::grid_table::{GridInfo, GridRow, GridTable, MemStoreFactory, TableTracker};
use cubelet_core::lattice::{CuboidScheduler, FullLatticeScheduler};
use cubelet_core::measure::{MeasureAggregators, MeasureDesc, MeasureFunction, MeasureValue};
use cubelet_core::tool::setup_log;
use cubelet_core::writer::{output_cuboid, CuboidWriter};

/// Writer collecting rows in memory.
#[derive(Default)]
struct VecWriter {
    rows: Vec<(CuboidId, GridRow)>,
    flushed: usize,
}

impl CuboidWriter for VecWriter {
    fn write(&mut self, cuboid_id: CuboidId, row: &GridRow) -> Result<()> {
        self.rows.push((cuboid_id, row.clone()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushed += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn measures() -> Arc<Vec<MeasureDesc>> {
    Arc::new(vec![
        MeasureDesc::new("amount", MeasureFunction::Sum),
        MeasureDesc::new("cnt", MeasureFunction::Count),
        MeasureDesc::new("users", MeasureFunction::CountDistinct),
    ])
}

fn input_row(dims: &[u32], amount: i64, user: i64) -> GridRow {
    GridRow::new(
        dims.to_vec(),
        vec![
            MeasureFunction::Sum.init(amount),
            MeasureFunction::Count.init(amount),
            MeasureFunction::CountDistinct.init(user),
        ],
    )
}

fn build_table(
    info: GridInfo,
    rows: impl Iterator<Item = GridRow>,
    tracker: Arc<TableTracker>,
) -> Result<GridTable> {
    let table = GridTable::new(info, &MemStoreFactory, tracker)?;

    let mut builder = table.rebuild()?;
    for row in rows {
        builder.write(row)?;
    }
    builder.close()?;

    Ok(table)
}

/// Aggregate every cuboid of the lattice from its parent's table, and compare with the
/// cuboid aggregated directly from the input.
#[test]
fn test_lattice_from_parent_tables() -> Result<()> {
    setup_log();

    let scheduler = FullLatticeScheduler::new(3)?;
    let measures = measures();
    let tracker = Arc::new(TableTracker::new());

    let input = (0..200u32)
        .map(|i| input_row(&[i % 3, i % 5, i % 7], i as i64, (i % 11) as i64))
        .collect::<Vec<_>>();

    let base_id = scheduler.base_cuboid_id();
    let mut base_scanner = AggregateScanner::new(MeasureAggregators::new(&measures));
    for row in input.iter() {
        base_scanner.aggregate(row.clone())?;
    }

    let mut tables = BTreeMap::new();
    tables.insert(
        base_id,
        build_table(
            GridInfo::new(base_id, measures.clone()),
            base_scanner.into_rows(),
            tracker.clone(),
        )?,
    );

    for cuboid in scheduler.all_cuboids().into_iter().skip(1) {
        let parent = scheduler
            .parent_of(cuboid)
            .ok_or_else(|| anyhow::anyhow!("no parent of {}", cuboid))?;

        let mut scanner = AggregateScanner::with_projection(
            parent.projection_of(cuboid)?,
            MeasureAggregators::for_descendant(&measures),
        );
        for row in tables[&parent].scan()? {
            scanner.aggregate(row)?;
        }

        let table = build_table(
            GridInfo::new(cuboid, measures.clone()),
            scanner.into_rows(),
            tracker.clone(),
        )?;
        tables.insert(cuboid, table);
    }

    assert_eq!(tables.len(), scheduler.cuboid_count());

    for (cuboid, table) in tables.iter() {
        let mut direct = AggregateScanner::with_projection(
            base_id.projection_of(*cuboid)?,
            MeasureAggregators::new(&measures),
        );
        for row in input.iter() {
            direct.aggregate(row.clone())?;
        }

        let expected = direct.into_rows().collect::<Vec<_>>();
        let actual = table.scan()?.collect::<Vec<_>>();

        assert_eq!(actual, expected, "cuboid {}", cuboid);
    }

    // Apex: one row, sum of all amounts, 200 rows, 11 users.
    let apex = tables[&CuboidId::new(0)].scan()?.collect::<Vec<_>>();
    assert_eq!(apex.len(), 1);
    assert_eq!(apex[0].measure_values(), vec![(0..200).sum::<i64>(), 200, 11]);

    for table in tables.values() {
        table.close()?;
    }
    assert_eq!(tracker.opened(), tracker.closed());

    Ok(())
}

#[test]
fn test_output_cuboid_through_grid_block() -> Result<()> {
    setup_log();

    let tracker = Arc::new(TableTracker::new());
    let cuboid = CuboidId::new(0b11);

    let rows = vec![
        GridRow::new(vec![1, 1], vec![MeasureValue::Long(10)]),
        GridRow::new(vec![1, 2], vec![MeasureValue::Long(20)]),
        GridRow::new(vec![2, 1], vec![MeasureValue::Long(30)]),
    ];

    let info = GridInfo::new(
        cuboid,
        Arc::new(vec![MeasureDesc::new("v", MeasureFunction::Sum)]),
    );
    let table = build_table(info, rows.clone().into_iter(), tracker.clone())?;

    let mut writer = VecWriter::default();
    assert_eq!(output_cuboid(cuboid, &table, &mut writer)?, 3);
    assert_eq!(writer.flushed, 1);

    let mut block = GridBlock::new(cuboid, 1);
    for (id, row) in writer.rows {
        assert_eq!(id, cuboid);
        block.push(row)?;
    }

    let decoded = GridBlock::from_base64(&block.to_base64())?;
    assert_eq!(decoded.into_rows(), rows);

    table.close()?;
    assert!(output_cuboid(cuboid, &table, &mut VecWriter::default()).is_err());

    Ok(())
}
