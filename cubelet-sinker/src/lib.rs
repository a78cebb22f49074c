//! Sinks of finished cuboids.
//!
//! A cube build emits `(cuboid_id, row)` pairs through the `CuboidWriter` trait of
//! `cubelet_core`. Rows of one cuboid come sorted by primary key, rows of different cuboids
//! may interleave. A single pass build emits one cuboid at a time, but a dogged build emits
//! cuboids as soon as every split has finished them, in no particular order.
//!
//! Two sinks are provided:
//!
//! 1. `MemCuboidWriter` keeps all rows in memory. The rows are shared with the caller
//! through `MemCuboidOutput`, which also counts `flush` and `close` calls. It checks the key
//! order of each cuboid, so it's the sink used to verify builds.
//! 2. `FileCuboidWriter` writes each cuboid into `<dir>/<cuboid_id>.grid`. Rows are batched
//! per cuboid into `GridBlock`s, dimension columns bitpacked, and each block is written as
//! one base64 line. Since rows of a cuboid are sorted and blocks are appended in order,
//! reading the lines of a file back gives the rows of the cuboid in key order.
//!
//! `GridBlockFileReader` reads the blocks back, file after file.

pub mod file_writer;
pub mod grid_block_reader;
pub mod mem_writer;
