use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cubelet_builder::context::BuildContext;
use cubelet_builder::cube_build::build_cube;
use cubelet_builder::input::{produce_csv_file, CsvRecordConverter, QueueController};
use cubelet_core::config::CubeBuilderConfig;
use cubelet_core::lattice::FullLatticeScheduler;
use cubelet_core::measure::MeasureDesc;
use cubelet_core::tool::init_log;
use cubelet_sinker::file_writer::FileCuboidWriter;

/// Capacity of the input queue.
const INPUT_QUEUE_CAPACITY: usize = 4096;

/// Build all cuboids of a csv file.
///
/// Each line holds the dimension values, then one raw value per measure. `#cut` ends a
/// split of a dogged build, other lines starting with `#` are comments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input csv file.
    #[arg(long)]
    input: PathBuf,

    /// Number of dimensions.
    #[arg(long)]
    dimensions: usize,

    /// Measure functions, such as `SUM,COUNT,MAX`.
    #[arg(long, value_delimiter = ',')]
    measures: Vec<String>,

    /// Config file in toml.
    #[arg(long)]
    config: Option<String>,

    /// Output dir.
    #[arg(long)]
    output: PathBuf,

    /// Force dogged build.
    #[arg(long, default_value_t = false)]
    dogged: bool,
}

/// Rough number of rows, by counting lines.
fn estimate_rows(path: &Path) -> Result<u64> {
    let file = File::open(path)
        .map_err(|e| anyhow!("failed to open {}, error: {}", path.display(), e))?;

    Ok(BufReader::new(file).lines().count() as u64)
}

async fn run(args: Args, config: CubeBuilderConfig) -> Result<()> {
    let measures = args
        .measures
        .iter()
        .enumerate()
        .map(|(i, f)| MeasureDesc::from_function_name(&format!("m{}", i), f))
        .collect::<Result<Vec<_>>>()?;

    let converter = Arc::new(CsvRecordConverter::new(args.dimensions, measures.len()));

    let ctx = Arc::new(BuildContext::new(
        config.clone(),
        Arc::new(FullLatticeScheduler::new(args.dimensions)?),
        measures,
    )?);

    let estimated_rows = estimate_rows(&args.input)?;

    let (sender, receiver) = async_channel::bounded::<String>(INPUT_QUEUE_CAPACITY);
    let input_path = args.input.clone();
    let producer = tokio::task::spawn_blocking(move || produce_csv_file(&input_path, sender));

    let input = QueueController::new(receiver, converter, config.input_poll_timeout());
    let writer = FileCuboidWriter::new(&args.output)?;

    let report = build_cube(ctx, input, writer, estimated_rows).await?;
    producer.await??;

    info!(
        "cube built, mode: {}, splits: {}, rows written: {}, output: {}",
        report.mode,
        report.splits,
        report.rows_written,
        args.output.display()
    );

    Ok(())
}

fn main() -> Result<()> {
    init_log();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(filename) => CubeBuilderConfig::from_config_file(filename)?,
        None => CubeBuilderConfig::default(),
    };

    if args.dogged {
        config.force_dogged = true;
    }

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("cuboid-worker")
        .enable_all()
        .build()?
        .block_on(run(args, config))
}
