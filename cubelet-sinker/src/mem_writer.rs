use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use likely_stable::unlikely;
use log::info;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::grid_table::GridRow;
use cubelet_core::writer::CuboidWriter;

/// Everything written to a `MemCuboidWriter`, shared with the caller.
///
/// The writer is moved into the build, the output stays with the caller to check what was
/// written after the build is done.
#[derive(Default)]
pub struct MemCuboidOutput {
    /// All writes, in call order.
    writes: Mutex<Vec<(CuboidId, GridRow)>>,

    flush_count: AtomicUsize,
    close_count: AtomicUsize,
}

impl MemCuboidOutput {
    fn lock_writes(&self) -> Result<MutexGuard<'_, Vec<(CuboidId, GridRow)>>> {
        self.writes
            .lock()
            .map_err(|e| anyhow!("mem cuboid output poisoned: {}", e))
    }

    fn push(&self, cuboid_id: CuboidId, row: GridRow) -> Result<()> {
        self.lock_writes()?.push((cuboid_id, row));
        Ok(())
    }

    /// Rows grouped by cuboid, each group in write order.
    pub fn cuboid_rows(&self) -> Result<BTreeMap<CuboidId, Vec<GridRow>>> {
        let mut res: BTreeMap<CuboidId, Vec<GridRow>> = BTreeMap::new();

        for (cuboid_id, row) in self.lock_writes()?.iter() {
            res.entry(*cuboid_id).or_default().push(row.clone());
        }

        Ok(res)
    }

    pub fn rows_of(&self, cuboid_id: CuboidId) -> Result<Vec<GridRow>> {
        Ok(self
            .lock_writes()?
            .iter()
            .filter(|(id, _)| *id == cuboid_id)
            .map(|(_, row)| row.clone())
            .collect())
    }

    /// Cuboid of every write, in call order.
    pub fn write_order(&self) -> Result<Vec<CuboidId>> {
        Ok(self.lock_writes()?.iter().map(|(id, _)| *id).collect())
    }

    pub fn total_rows(&self) -> Result<usize> {
        Ok(self.lock_writes()?.len())
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

/// Collects cuboid rows in memory.
///
/// Rows of one cuboid must come in strictly ascending key order, a violation is an error.
/// Writing after `close` is an error too.
pub struct MemCuboidWriter {
    output: Arc<MemCuboidOutput>,
    last_keys: HashMap<CuboidId, Vec<u32>>,
    closed: bool,
}

impl MemCuboidWriter {
    pub fn new() -> Self {
        Self {
            output: Arc::new(MemCuboidOutput::default()),
            last_keys: HashMap::new(),
            closed: false,
        }
    }

    pub fn output(&self) -> Arc<MemCuboidOutput> {
        self.output.clone()
    }
}

impl Default for MemCuboidWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl CuboidWriter for MemCuboidWriter {
    fn write(&mut self, cuboid_id: CuboidId, row: &GridRow) -> Result<()> {
        if unlikely(self.closed) {
            error_bail!("write to closed mem cuboid writer, cuboid: {}", cuboid_id);
        }

        if let Some(last) = self.last_keys.get(&cuboid_id) {
            if unlikely(row.key() <= last.as_slice()) {
                error_bail!(
                    "rows of cuboid {} out of order, last: {:?}, current: {:?}",
                    cuboid_id,
                    last,
                    row.key()
                );
            }
        }

        self.last_keys.insert(cuboid_id, row.dims.clone());
        self.output.push(cuboid_id, row.clone())
    }

    fn flush(&mut self) -> Result<()> {
        self.output.flush_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        let count = self.output.close_count.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            "mem cuboid writer closed, cuboids: {}, close count: {}",
            self.last_keys.len(),
            count
        );

        Ok(())
    }
}
