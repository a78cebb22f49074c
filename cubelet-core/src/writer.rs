use anyhow::Result;

use crate::cuboid::CuboidId;
use crate::grid_table::{GridRow, GridTable};

/// Destination of finished cuboids.
///
/// Rows of one cuboid are written in primary key order, but rows of different cuboids may
/// interleave only across calls of `output_cuboid`, never inside one. `close` is called
/// exactly once by the build, on success and on failure.
pub trait CuboidWriter: Send {
    fn write(&mut self, cuboid_id: CuboidId, row: &GridRow) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

impl<W: CuboidWriter + ?Sized> CuboidWriter for Box<W> {
    fn write(&mut self, cuboid_id: CuboidId, row: &GridRow) -> Result<()> {
        (**self).write(cuboid_id, row)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Write all rows of `table` as cuboid `cuboid_id`. Returns the number of rows written.
pub fn output_cuboid<W: CuboidWriter + ?Sized>(
    cuboid_id: CuboidId,
    table: &GridTable,
    writer: &mut W,
) -> Result<usize> {
    let mut count = 0;

    for row in table.scan()? {
        writer.write(cuboid_id, &row)?;
        count += 1;
    }

    writer.flush()?;

    Ok(count)
}
