//! Input of a cube build.
//!
//! Records come from a bounded `async_channel` queue filled by an external producer. An
//! `InputConverterUnit` turns each record into a raw row of the base cuboid, and tells
//! which records mark the end of a split or the end of the input. The sender side closing
//! the channel is also the end of the input.
use anyhow::{anyhow, Result};
use likely_stable::unlikely;
use log::{debug, info};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cubelet_core::error_bail;
use cubelet_core::grid_table::GridRow;
use cubelet_core::measure::MeasureDesc;

/// One input row: dictionary encoded dimension values, and one raw value per measure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub dims: Vec<u32>,
    pub values: Vec<i64>,
}

impl RawRow {
    pub fn new(dims: Vec<u32>, values: Vec<i64>) -> Self {
        Self { dims, values }
    }

    /// Row of the base cuboid, with the initial state of every measure.
    pub fn into_grid_row(self, num_dims: usize, measures: &[MeasureDesc]) -> Result<GridRow> {
        if unlikely(self.dims.len() != num_dims || self.values.len() != measures.len()) {
            error_bail!(
                "input row width mismatch, expected dims: {}, measures: {}, got dims: {}, values: {}",
                num_dims,
                measures.len(),
                self.dims.len(),
                self.values.len()
            );
        }

        let states = measures
            .iter()
            .zip(self.values.iter())
            .map(|(m, v)| m.function.init(*v))
            .collect();

        Ok(GridRow::new(self.dims, states))
    }
}

/// Converts input records of type `T` into rows of the base cuboid.
pub trait InputConverterUnit<T>: Send + Sync {
    fn convert(&self, record: T) -> Result<RawRow>;

    /// Whether `record` marks the end of the current split.
    fn is_cut(&self, record: &T) -> bool;

    /// Whether `record` marks the end of the input.
    fn is_end(&self, record: &T) -> bool;
}

/// Already encoded input, with explicit markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedRecord {
    Row(RawRow),
    Cut,
    End,
}

impl EncodedRecord {
    pub fn row(dims: Vec<u32>, values: Vec<i64>) -> Self {
        EncodedRecord::Row(RawRow::new(dims, values))
    }
}

#[derive(Default)]
pub struct EncodedRecordConverter;

impl InputConverterUnit<EncodedRecord> for EncodedRecordConverter {
    fn convert(&self, record: EncodedRecord) -> Result<RawRow> {
        match record {
            EncodedRecord::Row(row) => Ok(row),
            other => Err(anyhow!("cannot convert marker record: {:?}", other)),
        }
    }

    fn is_cut(&self, record: &EncodedRecord) -> bool {
        matches!(record, EncodedRecord::Cut)
    }

    fn is_end(&self, record: &EncodedRecord) -> bool {
        matches!(record, EncodedRecord::End)
    }
}

/// Marker line of a split end in csv input.
pub const CSV_CUT_MARKER: &str = "#cut";

/// Marker line of the input end in csv input.
pub const CSV_END_MARKER: &str = "#end";

/// Comma separated lines, dimension values first, then one raw value per measure.
pub struct CsvRecordConverter {
    num_dims: usize,
    num_measures: usize,
}

impl CsvRecordConverter {
    pub fn new(num_dims: usize, num_measures: usize) -> Self {
        Self {
            num_dims,
            num_measures,
        }
    }

    /// Blank lines and `#` comments, except the markers, carry no record.
    pub fn is_comment(line: &str) -> bool {
        let line = line.trim();
        line.is_empty()
            || (line.starts_with('#') && line != CSV_CUT_MARKER && line != CSV_END_MARKER)
    }
}

impl InputConverterUnit<String> for CsvRecordConverter {
    fn convert(&self, record: String) -> Result<RawRow> {
        let fields = record.trim().split(',').map(|x| x.trim()).collect::<Vec<_>>();

        if unlikely(fields.len() != self.num_dims + self.num_measures) {
            error_bail!(
                "expect {} fields, got {}, line: {}",
                self.num_dims + self.num_measures,
                fields.len(),
                record
            );
        }

        let mut dims = Vec::with_capacity(self.num_dims);
        for field in &fields[..self.num_dims] {
            dims.push(
                field
                    .parse::<u32>()
                    .map_err(|e| anyhow!("invalid dimension value: {}, line: {}, error: {}", field, record, e))?,
            );
        }

        let mut values = Vec::with_capacity(self.num_measures);
        for field in &fields[self.num_dims..] {
            values.push(
                field
                    .parse::<i64>()
                    .map_err(|e| anyhow!("invalid measure value: {}, line: {}, error: {}", field, record, e))?,
            );
        }

        Ok(RawRow::new(dims, values))
    }

    fn is_cut(&self, record: &String) -> bool {
        record.trim() == CSV_CUT_MARKER
    }

    fn is_end(&self, record: &String) -> bool {
        record.trim() == CSV_END_MARKER
    }
}

/// Pulls rows from the input queue for the builders.
///
/// Polling waits at most `poll_timeout` each time, so a slow producer shows up in the log
/// instead of a silent hang. Cuts are only honored for split builds, where a split also ends
/// after `split_row_threshold` rows.
pub struct QueueController<T, C: InputConverterUnit<T>> {
    receiver: async_channel::Receiver<T>,
    converter: Arc<C>,
    poll_timeout: Duration,

    splittable: bool,
    split_row_threshold: Option<usize>,

    /// Rows of the current split.
    split_rows: usize,
    total_rows: usize,
    ended: bool,
}

impl<T: Send, C: InputConverterUnit<T>> QueueController<T, C> {
    pub fn new(receiver: async_channel::Receiver<T>, converter: Arc<C>, poll_timeout: Duration) -> Self {
        Self {
            receiver,
            converter,
            poll_timeout,
            splittable: false,
            split_row_threshold: None,
            split_rows: 0,
            total_rows: 0,
            ended: false,
        }
    }

    /// Honor cuts, and cut every `split_row_threshold` rows if set.
    pub fn splittable(mut self, split_row_threshold: Option<usize>) -> Self {
        self.splittable = true;
        self.split_row_threshold = split_row_threshold;
        self
    }

    pub fn is_splittable(&self) -> bool {
        self.splittable
    }

    /// Whether the end of the input has been reached.
    pub fn is_end(&self) -> bool {
        self.ended
    }

    pub fn split_rows(&self) -> usize {
        self.split_rows
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Start counting rows of a new split.
    pub fn start_split(&mut self) {
        self.split_rows = 0;
    }

    /// Next row of the current split. `None` at the end of the split or of the input.
    pub async fn next_row(&mut self) -> Result<Option<RawRow>> {
        if self.ended {
            return Ok(None);
        }

        if self.splittable {
            if let Some(threshold) = self.split_row_threshold {
                if self.split_rows >= threshold {
                    return Ok(None);
                }
            }
        }

        let mut waits = 0u64;

        loop {
            let record = match tokio::time::timeout(self.poll_timeout, self.receiver.recv()).await {
                Ok(Ok(record)) => record,
                Ok(Err(_)) => {
                    info!(
                        "input queue closed, total rows: {}, split rows: {}",
                        self.total_rows, self.split_rows
                    );
                    self.ended = true;
                    return Ok(None);
                }
                Err(_) => {
                    waits += 1;
                    if waits % 100 == 0 {
                        info!(
                            "waiting for input, {} polls of {} ms, total rows: {}",
                            waits,
                            self.poll_timeout.as_millis(),
                            self.total_rows
                        );
                    }
                    continue;
                }
            };

            if self.converter.is_end(&record) {
                info!("end of input, total rows: {}", self.total_rows);
                self.ended = true;
                return Ok(None);
            }

            if self.converter.is_cut(&record) {
                if self.splittable {
                    info!("split cut after {} rows", self.split_rows);
                    return Ok(None);
                }

                debug!("ignore cut in a single pass build");
                continue;
            }

            let row = self.converter.convert(record)?;
            self.split_rows += 1;
            self.total_rows += 1;

            return Ok(Some(row));
        }
    }
}

/// Send `records` into `sender`, then close it. Used to feed a build from memory.
pub async fn produce_records<T>(sender: async_channel::Sender<T>, records: Vec<T>) -> Result<()> {
    for record in records {
        sender
            .send(record)
            .await
            .map_err(|_| anyhow!("input queue closed by the builder"))?;
    }

    sender.close();

    Ok(())
}

/// Send the record lines of the csv file `path` into `sender`, then close it. Comments are
/// skipped. Returns the number of lines sent.
///
/// File reads block, so run it with `tokio::task::spawn_blocking`.
pub fn produce_csv_file(path: &Path, sender: async_channel::Sender<String>) -> Result<u64> {
    let file = File::open(path)
        .map_err(|e| anyhow!("failed to open {}, error: {}", path.display(), e))?;

    let mut count = 0;

    for line in BufReader::new(file).lines() {
        let line = line?;
        if CsvRecordConverter::is_comment(&line) {
            continue;
        }

        sender
            .send_blocking(line)
            .map_err(|_| anyhow!("input queue closed by the builder"))?;
        count += 1;
    }

    sender.close();
    info!("sent {} records of {}", count, path.display());

    Ok(count)
}
