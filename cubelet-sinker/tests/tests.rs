use anyhow::Result;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

use cubelet_core::cuboid::CuboidId;
use cubelet_core::grid_table::GridRow;
use cubelet_core::measure::{MeasureFunction, MeasureValue};
use cubelet_core::tool::setup_log;
use cubelet_core::writer::CuboidWriter;
use cubelet_sinker::file_writer::{cuboid_file_path, FileCuboidWriter};
use cubelet_sinker::grid_block_reader::{list_cuboids, read_cuboid_rows, GridBlockFileReader};

fn test_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "cubelet_sinker_{}_{}",
        name,
        std::process::id()
    ));

    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }

    Ok(dir)
}

fn sorted_rows(num_dims: usize, count: usize, seed: u64) -> Vec<GridRow> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut keys = (0..count)
        .map(|_| (0..num_dims).map(|_| rng.gen_range(0..50)).collect::<Vec<u32>>())
        .collect::<Vec<_>>();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .map(|dims| {
            GridRow::new(
                dims,
                vec![
                    MeasureValue::Long(rng.gen_range(0..1000)),
                    MeasureFunction::CountDistinct.init(rng.gen_range(0..10)),
                ],
            )
        })
        .collect()
}

#[test]
fn test_file_writer_and_reader() -> Result<()> {
    setup_log();

    let dir = test_dir("file_writer")?;

    let base = CuboidId::new(0b111);
    let child = CuboidId::new(0b101);
    let apex = CuboidId::new(0);

    let base_rows = sorted_rows(3, 1000, 1);
    let child_rows = sorted_rows(2, 300, 2);
    let apex_rows = vec![GridRow::new(
        vec![],
        vec![MeasureValue::Long(1), MeasureFunction::CountDistinct.init(1)],
    )];

    let mut writer = FileCuboidWriter::with_block_rows(&dir, 100)?;

    // Rows of different cuboids interleave.
    let mut child_iter = child_rows.iter();
    for row in base_rows.iter() {
        writer.write(base, row)?;
        if let Some(r) = child_iter.next() {
            writer.write(child, r)?;
        }
    }
    for row in apex_rows.iter() {
        writer.write(apex, row)?;
    }

    writer.close()?;
    writer.close()?;
    assert_eq!(
        writer.total_rows(),
        base_rows.len() + child_rows.len() + apex_rows.len()
    );
    assert!(writer.write(base, &base_rows[0]).is_err());

    assert_eq!(list_cuboids(&dir)?, vec![apex, child, base]);

    assert_eq!(read_cuboid_rows(&dir, base)?, base_rows);
    assert_eq!(read_cuboid_rows(&dir, child)?, child_rows);
    assert_eq!(read_cuboid_rows(&dir, apex)?, apex_rows);
    assert!(read_cuboid_rows(&dir, CuboidId::new(0b1))?.is_empty());

    let blocks = GridBlockFileReader::new(&[cuboid_file_path(&dir, base)])?
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(blocks.len(), (base_rows.len() + 99) / 100);
    assert!(blocks.iter().all(|b| b.cuboid_id() == base));

    std::fs::remove_dir_all(&dir)?;

    Ok(())
}

#[test]
fn test_reader_missing_file() {
    setup_log();

    let missing = std::env::temp_dir().join("cubelet_sinker_no_such_file.grid");
    assert!(GridBlockFileReader::new(&[missing]).is_err());
}
