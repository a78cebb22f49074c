use anyhow::Result;
use log::info;
use std::sync::Arc;
use strum::Display;

use cubelet_core::writer::CuboidWriter;

use crate::context::BuildContext;
use crate::dogged_builder::DoggedCubeBuilder;
use crate::in_mem_builder::InMemCubeBuilder;
use crate::input::{InputConverterUnit, QueueController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BuildMode {
    SinglePass,
    Dogged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub mode: BuildMode,

    /// Number of splits of the input, `1` for a single pass build.
    pub splits: usize,

    pub rows_written: usize,
}

/// Build every cuboid of the input and write them to `writer`.
///
/// Dogged build is used if forced by the config, or if `estimated_rows` is above
/// `dogged_threshold_rows`.
pub async fn build_cube<T, C, W>(
    ctx: Arc<BuildContext>,
    input: QueueController<T, C>,
    mut writer: W,
    estimated_rows: u64,
) -> Result<BuildReport>
where
    T: Send,
    C: InputConverterUnit<T>,
    W: CuboidWriter + 'static,
{
    let mode = if ctx.config().use_dogged(estimated_rows) {
        BuildMode::Dogged
    } else {
        BuildMode::SinglePass
    };

    info!(
        "build cube in {} mode, estimated rows: {}, cuboids: {}",
        mode,
        estimated_rows,
        ctx.cuboid_count()
    );

    match mode {
        BuildMode::SinglePass => {
            let rows = InMemCubeBuilder::new("InMemCubeBuilder", ctx)
                .build(input, &mut writer)
                .await?;

            Ok(BuildReport {
                mode,
                splits: 1,
                rows_written: rows,
            })
        }
        BuildMode::Dogged => {
            let stats = DoggedCubeBuilder::new(ctx).build(input, writer).await?;

            Ok(BuildReport {
                mode,
                splits: stats.splits,
                rows_written: stats.rows_written,
            })
        }
    }
}
