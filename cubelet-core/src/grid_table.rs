//! Grid table: the row store of one cuboid.
//!
//! A `GridTable` is built once through `GridTableBuilder`, rows must be written in strictly
//! ascending primary key order. After that it can be scanned any number of times until it's
//! explicitly closed. Closing releases the storage, it's not left to `Drop`.
//!
//! The storage itself is behind the `GridStore` trait, created by a `StoreFactory`, so a
//! build can plug in another store.
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use likely_stable::unlikely;
use log::{error, info, warn};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cuboid::CuboidId;
use crate::error_bail;
use crate::measure::{MeasureDesc, MeasureValue};

/// Number of rows buffered by `GridTableBuilder` before appending to the store.
const WRITE_BATCH_SIZE: usize = 1024;

/// One row of a cuboid: dictionary encoded dimension values followed by measure states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridRow {
    /// Dimension values, also the primary key of the row.
    pub dims: Vec<u32>,

    /// Measure states.
    pub measures: Vec<MeasureValue>,
}

impl GridRow {
    pub fn new(dims: Vec<u32>, measures: Vec<MeasureValue>) -> Self {
        Self { dims, measures }
    }

    /// Primary key of the row.
    #[inline]
    pub fn key(&self) -> &[u32] {
        &self.dims
    }

    /// Compare two rows by primary key.
    #[inline]
    pub fn cmp_key(&self, other: &GridRow) -> Ordering {
        self.dims.cmp(&other.dims)
    }

    /// Final values of the measures.
    pub fn measure_values(&self) -> Vec<i64> {
        self.measures.iter().map(|m| m.value()).collect()
    }

    pub fn estimated_bytes(&self) -> usize {
        24 + self.dims.len() * 4
            + 24
            + self
                .measures
                .iter()
                .map(|m| m.estimated_bytes())
                .sum::<usize>()
    }
}

/// Schema of a grid table.
#[derive(Debug, Clone)]
pub struct GridInfo {
    cuboid_id: CuboidId,
    measures: Arc<Vec<MeasureDesc>>,
}

impl GridInfo {
    pub fn new(cuboid_id: CuboidId, measures: Arc<Vec<MeasureDesc>>) -> Self {
        Self {
            cuboid_id,
            measures,
        }
    }

    #[inline]
    pub fn cuboid_id(&self) -> CuboidId {
        self.cuboid_id
    }

    #[inline]
    pub fn dimension_count(&self) -> usize {
        self.cuboid_id.dimension_count()
    }

    #[inline]
    pub fn measure_count(&self) -> usize {
        self.measures.len()
    }

    /// Dimension columns first, then metric columns.
    #[inline]
    pub fn column_count(&self) -> usize {
        self.dimension_count() + self.measure_count()
    }

    pub fn measures(&self) -> &Arc<Vec<MeasureDesc>> {
        &self.measures
    }

    /// Check the row has the width of this table.
    pub fn check_row(&self, row: &GridRow) -> Result<()> {
        if unlikely(
            row.dims.len() != self.dimension_count() || row.measures.len() != self.measure_count(),
        ) {
            error_bail!(
                "row width mismatch for cuboid {}, expected dims: {}, measures: {}, got dims: {}, measures: {}",
                self.cuboid_id,
                self.dimension_count(),
                self.measure_count(),
                row.dims.len(),
                row.measures.len()
            );
        }

        Ok(())
    }
}

/// Storage of one grid table.
pub trait GridStore: Send + Sync {
    /// Append rows to the end of the store.
    fn append(&mut self, rows: Vec<GridRow>) -> Result<()>;

    /// Snapshot of all rows for scanning.
    fn rows(&self) -> Result<Arc<Vec<GridRow>>>;

    fn num_rows(&self) -> usize;

    fn estimated_bytes(&self) -> usize;

    /// Release the storage.
    fn close(&mut self) -> Result<()>;
}

/// Creates the store of new grid tables.
pub trait StoreFactory: Send + Sync {
    fn create_store(&self, info: &GridInfo) -> Result<Box<dyn GridStore>>;
}

/// In memory store.
#[derive(Default)]
pub struct MemStore {
    rows: Arc<Vec<GridRow>>,
    estimated_bytes: usize,
}

impl GridStore for MemStore {
    fn append(&mut self, rows: Vec<GridRow>) -> Result<()> {
        self.estimated_bytes += rows.iter().map(|r| r.estimated_bytes()).sum::<usize>();
        Arc::make_mut(&mut self.rows).extend(rows);

        Ok(())
    }

    fn rows(&self) -> Result<Arc<Vec<GridRow>>> {
        Ok(self.rows.clone())
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    fn close(&mut self) -> Result<()> {
        self.rows = Arc::new(Vec::new());
        self.estimated_bytes = 0;

        Ok(())
    }
}

#[derive(Default)]
pub struct MemStoreFactory;

impl StoreFactory for MemStoreFactory {
    fn create_store(&self, _info: &GridInfo) -> Result<Box<dyn GridStore>> {
        Ok(Box::new(MemStore::default()))
    }
}

/// Tracks open and closed grid tables of a build, to find leaked tables.
#[derive(Default)]
pub struct TableTracker {
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,

    /// Repeated `close` calls on an already closed table.
    repeated_close: AtomicUsize,

    /// Key: table id, Value: cuboid of the table.
    open_tables: DashMap<u64, CuboidId>,
}

impl TableTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn on_open(&self, cuboid_id: CuboidId) -> u64 {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.opened.fetch_add(1, AtomicOrdering::SeqCst);
        self.open_tables.insert(id, cuboid_id);

        id
    }

    fn on_close(&self, table_id: u64) {
        self.closed.fetch_add(1, AtomicOrdering::SeqCst);
        self.open_tables.remove(&table_id);
    }

    fn on_repeated_close(&self) {
        self.repeated_close.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(AtomicOrdering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    pub fn repeated_close(&self) -> usize {
        self.repeated_close.load(AtomicOrdering::SeqCst)
    }

    /// Cuboids of the tables not closed yet.
    pub fn open_cuboids(&self) -> Vec<CuboidId> {
        let mut cuboids = self
            .open_tables
            .iter()
            .map(|x| *x.value())
            .collect::<Vec<_>>();
        cuboids.sort();

        cuboids
    }
}

/// The row store of one cuboid.
pub struct GridTable {
    table_id: u64,
    info: GridInfo,
    store: Mutex<Box<dyn GridStore>>,
    closed: AtomicBool,
    tracker: Arc<TableTracker>,
}

impl GridTable {
    pub fn new(info: GridInfo, factory: &dyn StoreFactory, tracker: Arc<TableTracker>) -> Result<Self> {
        let store = factory.create_store(&info)?;
        let table_id = tracker.on_open(info.cuboid_id());

        Ok(Self {
            table_id,
            info,
            store: Mutex::new(store),
            closed: AtomicBool::new(false),
            tracker,
        })
    }

    pub fn info(&self) -> &GridInfo {
        &self.info
    }

    pub fn cuboid_id(&self) -> CuboidId {
        self.info.cuboid_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, Box<dyn GridStore>>> {
        self.store
            .lock()
            .map_err(|e| anyhow!("grid table store of cuboid {} poisoned: {}", self.cuboid_id(), e))
    }

    /// Start writing rows into the table.
    pub fn rebuild(&self) -> Result<GridTableBuilder<'_>> {
        if unlikely(self.is_closed()) {
            error_bail!("cannot rebuild closed grid table of cuboid {}", self.cuboid_id());
        }

        Ok(GridTableBuilder {
            table: self,
            buffer: Vec::with_capacity(WRITE_BATCH_SIZE),
            last_key: None,
            count: 0,
        })
    }

    fn append(&self, rows: Vec<GridRow>) -> Result<()> {
        self.lock_store()?.append(rows)
    }

    /// Scan all rows in primary key order.
    pub fn scan(&self) -> Result<GridScanner> {
        if unlikely(self.is_closed()) {
            error_bail!("cannot scan closed grid table of cuboid {}", self.cuboid_id());
        }

        let rows = self.lock_store()?.rows()?;

        Ok(GridScanner { rows, pos: 0 })
    }

    pub fn num_rows(&self) -> Result<usize> {
        Ok(self.lock_store()?.num_rows())
    }

    pub fn estimated_bytes(&self) -> Result<usize> {
        Ok(self.lock_store()?.estimated_bytes())
    }

    /// Close the table and release its storage.
    ///
    /// Only the first call closes, later calls are logged and ignored. Returns whether this
    /// call closed the table.
    pub fn close(&self) -> Result<bool> {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            warn!(
                "grid table {} of cuboid {} is already closed",
                self.table_id,
                self.cuboid_id()
            );
            self.tracker.on_repeated_close();
            return Ok(false);
        }

        self.tracker.on_close(self.table_id);
        self.lock_store()?.close()?;

        Ok(true)
    }

    /// Close the table during cleanup. Errors are logged, never returned, so they do not
    /// mask the original failure.
    pub fn close_quietly(&self) {
        if let Err(e) = self.close() {
            error!(
                "Error closing grid table {} of cuboid {}, error: {}",
                self.table_id,
                self.cuboid_id(),
                e
            );
        }
    }
}

/// Writes rows into a `GridTable`, in strictly ascending primary key order.
pub struct GridTableBuilder<'a> {
    table: &'a GridTable,
    buffer: Vec<GridRow>,
    last_key: Option<Vec<u32>>,
    count: usize,
}

impl<'a> GridTableBuilder<'a> {
    pub fn write(&mut self, row: GridRow) -> Result<()> {
        self.table.info().check_row(&row)?;

        if let Some(last_key) = &self.last_key {
            if unlikely(row.key() <= last_key.as_slice()) {
                error_bail!(
                    "rows of cuboid {} must be written in ascending key order, last: {:?}, current: {:?}",
                    self.table.cuboid_id(),
                    last_key,
                    row.key()
                );
            }
        }

        self.last_key = Some(row.dims.clone());
        self.buffer.push(row);
        self.count += 1;

        if self.buffer.len() >= WRITE_BATCH_SIZE {
            self.flush()?;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let rows = std::mem::replace(&mut self.buffer, Vec::with_capacity(WRITE_BATCH_SIZE));
            self.table.append(rows)?;
        }

        Ok(())
    }

    /// Number of rows written so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Flush buffered rows. Returns the total number of rows written.
    pub fn close(mut self) -> Result<usize> {
        self.flush()?;

        info!(
            "grid table of cuboid {} built, rows: {}",
            self.table.cuboid_id(),
            self.count
        );

        Ok(self.count)
    }
}

/// Iterator over the rows of a grid table, in primary key order.
///
/// It holds a snapshot of the rows, so it stays valid while rows are fetched lazily.
pub struct GridScanner {
    rows: Arc<Vec<GridRow>>,
    pos: usize,
}

impl Iterator for GridScanner {
    type Item = GridRow;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }

        row
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.rows.len().saturating_sub(self.pos);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GridScanner {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::MeasureFunction;
    use crate::tool::setup_log;

    fn sum_info(cuboid: u64) -> GridInfo {
        GridInfo::new(
            CuboidId::new(cuboid),
            Arc::new(vec![MeasureDesc::new("v", MeasureFunction::Sum)]),
        )
    }

    fn row(dims: &[u32], v: i64) -> GridRow {
        GridRow::new(dims.to_vec(), vec![MeasureValue::Long(v)])
    }

    #[test]
    fn test_build_and_scan() -> Result<()> {
        setup_log();

        let tracker = Arc::new(TableTracker::new());
        let table = GridTable::new(sum_info(0b11), &MemStoreFactory, tracker.clone())?;

        let mut builder = table.rebuild()?;
        for i in 0..3000u32 {
            builder.write(row(&[i / 10, i % 10], i as i64))?;
        }
        assert_eq!(builder.close()?, 3000);

        assert_eq!(table.num_rows()?, 3000);

        let rows = table.scan()?.collect::<Vec<_>>();
        assert_eq!(rows.len(), 3000);
        assert!(rows.windows(2).all(|w| w[0].cmp_key(&w[1]) == Ordering::Less));

        assert_eq!(tracker.opened(), 1);
        assert!(table.close()?);
        assert!(!table.close()?);
        assert_eq!(tracker.closed(), 1);
        assert_eq!(tracker.repeated_close(), 1);
        assert!(tracker.open_cuboids().is_empty());

        assert!(table.scan().is_err());

        Ok(())
    }

    #[test]
    fn test_write_out_of_order() -> Result<()> {
        let tracker = Arc::new(TableTracker::new());
        let table = GridTable::new(sum_info(0b11), &MemStoreFactory, tracker.clone())?;

        let mut builder = table.rebuild()?;
        builder.write(row(&[1, 2], 1))?;
        assert!(builder.write(row(&[1, 2], 1)).is_err());
        assert!(builder.write(row(&[1, 1], 1)).is_err());
        assert!(builder.write(row(&[1], 1)).is_err());

        table.close_quietly();
        assert_eq!(tracker.open_cuboids(), Vec::<CuboidId>::new());

        Ok(())
    }

    #[test]
    fn test_scanner_is_snapshot() -> Result<()> {
        let tracker = Arc::new(TableTracker::new());
        let table = GridTable::new(sum_info(0b1), &MemStoreFactory, tracker)?;

        let mut builder = table.rebuild()?;
        builder.write(row(&[1], 1))?;
        builder.write(row(&[2], 2))?;
        builder.close()?;

        let mut scanner = table.scan()?;
        assert_eq!(scanner.len(), 2);
        assert_eq!(scanner.next(), Some(row(&[1], 1)));

        table.close()?;

        assert_eq!(scanner.next(), Some(row(&[2], 2)));
        assert_eq!(scanner.next(), None);

        Ok(())
    }
}
