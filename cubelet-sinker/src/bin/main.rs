use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

use cubelet_core::cuboid::CuboidId;
use cubelet_core::tool::init_log;
use cubelet_sinker::grid_block_reader::{list_cuboids, read_cuboid_rows};

/// Print cuboids written by the file sink.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Output dir of a cube build.
    #[arg(long)]
    dir: PathBuf,

    /// Only print this cuboid.
    #[arg(long)]
    cuboid: Option<u64>,

    /// Print the rows, not only the row counts.
    #[arg(long, default_value_t = false)]
    rows: bool,
}

fn main() -> Result<()> {
    init_log();

    let args = Args::parse();

    let cuboids = match args.cuboid {
        Some(bits) => vec![CuboidId::new(bits)],
        None => list_cuboids(&args.dir)?,
    };

    info!("{} cuboids in {}", cuboids.len(), args.dir.display());

    for cuboid in cuboids {
        let rows = read_cuboid_rows(&args.dir, cuboid)?;
        println!("cuboid {:#b}: {} rows", cuboid.bits(), rows.len());

        if args.rows {
            for row in rows {
                println!("  {:?} => {:?}", row.dims, row.measure_values());
            }
        }
    }

    Ok(())
}
