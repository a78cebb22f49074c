use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use likely_stable::unlikely;
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::grid_block::GridBlock;
use cubelet_core::grid_table::GridRow;
use cubelet_core::writer::CuboidWriter;

/// Default number of rows in one `GridBlock`.
pub const DEFAULT_BLOCK_ROWS: usize = 1024;

/// Path of the file holding the rows of `cuboid_id` under `dir`.
pub fn cuboid_file_path(dir: &Path, cuboid_id: CuboidId) -> PathBuf {
    dir.join(format!("{}.grid", cuboid_id))
}

/// Writes each cuboid into its own file, one base64 encoded `GridBlock` per line.
///
/// Rows are batched per cuboid, a block is written when it's full or on `flush`. The file
/// of a cuboid is created on its first block, existing files are truncated.
pub struct FileCuboidWriter {
    dir: PathBuf,
    block_rows: usize,

    /// Key: cuboid id, Value: rows not written yet.
    blocks: HashMap<CuboidId, GridBlock>,

    files: HashMap<CuboidId, BufWriter<File>>,

    total_rows: usize,
    total_blocks: usize,
    closed: bool,
}

impl FileCuboidWriter {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_block_rows(dir, DEFAULT_BLOCK_ROWS)
    }

    pub fn with_block_rows(dir: impl AsRef<Path>, block_rows: usize) -> Result<Self> {
        if unlikely(block_rows == 0) {
            error_bail!("block_rows must be positive");
        }

        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            anyhow!(
                "failed to create output dir {}, error: {}",
                dir.display(),
                e
            )
        })?;

        Ok(Self {
            dir,
            block_rows,
            blocks: HashMap::new(),
            files: HashMap::new(),
            total_rows: 0,
            total_blocks: 0,
            closed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    fn write_block(&mut self, block: GridBlock) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }

        let cuboid_id = block.cuboid_id();

        if !self.files.contains_key(&cuboid_id) {
            let path = cuboid_file_path(&self.dir, cuboid_id);
            let file = File::create(&path)
                .map_err(|e| anyhow!("failed to create {}, error: {}", path.display(), e))?;

            self.files.insert(cuboid_id, BufWriter::new(file));
        }

        let file = self
            .files
            .get_mut(&cuboid_id)
            .ok_or_else(|| anyhow!("no file of cuboid {}", cuboid_id))?;

        file.write_all(block.to_base64().as_bytes())?;
        file.write_all(b"\n")?;

        self.total_blocks += 1;

        Ok(())
    }
}

impl CuboidWriter for FileCuboidWriter {
    fn write(&mut self, cuboid_id: CuboidId, row: &GridRow) -> Result<()> {
        if unlikely(self.closed) {
            error_bail!("write to closed file cuboid writer, cuboid: {}", cuboid_id);
        }

        let block = self
            .blocks
            .entry(cuboid_id)
            .or_insert_with(|| GridBlock::new(cuboid_id, row.measures.len()));

        block.push(row.clone())?;
        self.total_rows += 1;

        if block.num_rows() >= self.block_rows {
            let full = std::mem::replace(block, GridBlock::new(cuboid_id, row.measures.len()));
            self.write_block(full)?;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let blocks = self.blocks.drain().map(|(_, b)| b).collect::<Vec<_>>();
        for block in blocks {
            self.write_block(block)?;
        }

        for file in self.files.values_mut() {
            file.flush()?;
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            warn!("file cuboid writer of {} is already closed", self.dir.display());
            return Ok(());
        }

        self.closed = true;
        self.flush()?;

        info!(
            "file cuboid writer closed, dir: {}, cuboids: {}, rows: {}, blocks: {}",
            self.dir.display(),
            self.files.len(),
            self.total_rows,
            self.total_blocks
        );

        self.files.clear();

        Ok(())
    }
}
