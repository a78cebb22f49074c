//! Dogged cube build: split the input, build each split in memory, merge the results.
//!
//! When one pass over the whole input can't fit the memory budget, the input is cut into
//! splits, by cut records or by `split_row_threshold`. Each split has its own
//! `InMemCubeBuilder`.
//!
//! The build has three steps:
//!
//! 1. Base cuboids of the splits are built one after another. The next split starts once
//! the previous one has drained its part of the input.
//! 2. After all splits have a base cuboid, every split fans out concurrently.
//! 3. A watcher receives every finished cuboid of every split through a bounded completion
//! queue. It keeps them in a pending map until all splits have reported the cuboid, then
//! merges them with `SplitMerger` and writes the merged rows.
//!
//! Splits without rows are left out of the merge, the watcher only waits for the others.
//! The number of splits to wait for is sent to the watcher once all base cuboids are built,
//! so cuboids can be merged while the splits are still fanning out.
//!
//! How is the watcher stopped?
//!
//! The completion queue is closed after all splits are done, or failed. The watcher drains
//! what's left in the queue, then returns. It owns the writer during the build and gives it
//! back when it returns, so the writer is closed exactly once by the builder.
use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use likely_stable::unlikely;
use log::{error, info, warn};
use std::sync::Arc;

use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::measure::MeasureDesc;
use cubelet_core::tool::log_phase_done;
use cubelet_core::writer::CuboidWriter;

use crate::context::BuildContext;
use crate::cuboid_result::{offer_with_backoff, CompletionEvent, CuboidResult, ResultCollector, ResultNotifier};
use crate::in_mem_builder::{close_writer, InMemCubeBuilder};
use crate::input::{InputConverterUnit, QueueController};
use crate::split_merger::SplitMerger;

/// Summary of a dogged build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoggedBuildStats {
    /// All splits, empty ones included.
    pub splits: usize,

    /// Splits with rows, the ones merged.
    pub merged_splits: usize,

    pub cuboids_written: usize,
    pub rows_written: usize,
}

pub struct DoggedCubeBuilder {
    ctx: Arc<BuildContext>,
}

impl DoggedCubeBuilder {
    pub fn new(ctx: Arc<BuildContext>) -> Self {
        Self { ctx }
    }

    /// Build all cuboids of `input` split by split, and write the merged cuboids to
    /// `writer`.
    ///
    /// Every table of every split is closed, and the writer is closed once, on all paths.
    pub async fn build<T, C, W>(&self, input: QueueController<T, C>, writer: W) -> Result<DoggedBuildStats>
    where
        T: Send,
        C: InputConverterUnit<T>,
        W: CuboidWriter + 'static,
    {
        let start = coarsetime::Instant::now();
        info!("Dogged cube build start");

        let input = if input.is_splittable() {
            input
        } else {
            input.splittable(self.ctx.config().split_row_threshold)
        };

        let (sender, receiver) =
            async_channel::bounded::<CompletionEvent>(self.ctx.config().output_queue_capacity);

        let watcher = tokio::spawn(watch_results(
            receiver,
            writer,
            self.ctx.measures().clone(),
        ));

        let mut collectors = Vec::new();
        let mut stats = DoggedBuildStats::default();

        let res = self
            .build_splits(input, &sender, &mut collectors, &mut stats)
            .await;

        if let Err(e) = &res {
            error!("Dogged cube build failed, error: {}", e);
        }

        // Lets the watcher drain the queue and return.
        sender.close();

        let res = match watcher.await {
            Ok((mut writer, watch_res)) => {
                let res = match (res, watch_res) {
                    (Ok(()), Ok(written)) => {
                        stats.cuboids_written = written.cuboids;
                        Ok(written.rows)
                    }
                    (Ok(()), Err(e)) => Err(e),
                    (Err(e), Ok(_)) => Err(e),
                    (Err(e), Err(watch_err)) => {
                        error!("watcher failed too, error: {}", watch_err);
                        Err(e)
                    }
                };

                close_writer(&mut writer, res)
            }
            Err(e) => {
                error!("watcher panicked, the writer is lost, error: {}", e);
                Err(anyhow!("watcher panicked: {}", e))
            }
        };

        let closed = collectors.iter().map(|c| c.close_all()).sum::<usize>();
        info!("closed {} grid tables of {} splits", closed, collectors.len());

        let rows = res?;
        stats.rows_written = rows;

        log_phase_done("Dogged cube build", start);
        info!("Dogged cube build stats: {:?}", stats);

        Ok(stats)
    }

    async fn build_splits<T, C>(
        &self,
        mut input: QueueController<T, C>,
        sender: &async_channel::Sender<CompletionEvent>,
        collectors: &mut Vec<Arc<ResultCollector>>,
        stats: &mut DoggedBuildStats,
    ) -> Result<()>
    where
        T: Send,
        C: InputConverterUnit<T>,
    {
        let config = self.ctx.config();
        let mut builders = Vec::new();

        while !input.is_end() {
            let seq = stats.splits;
            stats.splits += 1;

            input.start_split();

            let notifier = ResultNotifier::new(
                seq,
                sender.clone(),
                config.output_retry_interval(),
                config.output_wait_ceiling(),
            );
            let mut builder =
                InMemCubeBuilder::new(&format!("Split #{}", seq), self.ctx.clone()).with_notifier(notifier);
            collectors.push(builder.collector());

            let start = coarsetime::Instant::now();
            info!("Split #{} kickoff", seq);

            let base = builder
                .build_base_cuboid(&mut input)
                .await
                .map_err(|e| anyhow!("Split #{} failed to build base cuboid, error: {}", seq, e))?;

            log_phase_done(&format!("Split #{} base cuboid", seq), start);

            if base.row_count() == 0 {
                info!("Split #{} has no rows, left out of the merge", seq);
            } else {
                builders.push(builder);
            }
        }

        stats.merged_splits = builders.len();
        info!(
            "all {} splits have base cuboid, {} with rows",
            stats.splits,
            builders.len()
        );

        offer_with_backoff(
            sender,
            CompletionEvent::SplitsSealed(builders.len()),
            config.output_retry_interval(),
            config.output_wait_ceiling(),
        )
        .await?;

        let handles = builders
            .into_iter()
            .map(|mut builder| {
                tokio::spawn(async move {
                    let start = coarsetime::Instant::now();
                    let res = builder.start_build_from_base_cuboid().await;

                    if res.is_ok() {
                        log_phase_done(&format!("{} fan out", builder.name()), start);
                    }

                    res.map_err(|e| anyhow!("{} failed, error: {}", builder.name(), e))
                })
            })
            .collect::<Vec<_>>();

        let mut first_error = None;

        for handle in handles {
            let res = match handle.await {
                Ok(res) => res,
                Err(e) => Err(anyhow!("split task panicked: {}", e)),
            };

            if let Err(e) = res {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    error!("more split failed, error: {}", e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// What the watcher has written.
#[derive(Debug, Default, Clone, Copy)]
struct Written {
    cuboids: usize,
    rows: usize,
}

/// Receive finished cuboids until the queue is closed, merging each cuboid once all splits
/// have it.
///
/// Returns the writer whatever happens.
async fn watch_results<W: CuboidWriter>(
    receiver: async_channel::Receiver<CompletionEvent>,
    mut writer: W,
    measures: Arc<Vec<MeasureDesc>>,
) -> (W, Result<Written>) {
    let res = watch_loop(&receiver, &mut writer, &measures).await;

    if res.is_err() {
        // Senders fail fast instead of waiting for a queue nobody reads.
        receiver.close();
    }

    (writer, res)
}

async fn watch_loop<W: CuboidWriter>(
    receiver: &async_channel::Receiver<CompletionEvent>,
    writer: &mut W,
    measures: &[MeasureDesc],
) -> Result<Written> {
    let merger = SplitMerger::new(measures);

    // Key: cuboid id, Value: results of the cuboid with their split sequence.
    let mut pending: HashMap<CuboidId, Vec<(usize, Arc<CuboidResult>)>> = HashMap::new();
    let mut num_splits: Option<usize> = None;
    let mut written = Written::default();

    while let Ok(event) = receiver.recv().await {
        match event {
            CompletionEvent::Result { split, result } => {
                let cuboid_id = result.cuboid_id();
                pending.entry(cuboid_id).or_default().push((split, result));

                if let Some(n) = num_splits {
                    try_merge(&merger, &mut pending, cuboid_id, n, writer, &mut written)?;
                }
            }
            CompletionEvent::SplitsSealed(n) => {
                if unlikely(num_splits.is_some()) {
                    error_bail!("splits are sealed twice");
                }

                info!("watcher waits for {} splits, {} cuboids pending", n, pending.len());
                num_splits = Some(n);

                let mut ready = pending.keys().copied().collect::<Vec<_>>();
                ready.sort();

                for cuboid_id in ready {
                    try_merge(&merger, &mut pending, cuboid_id, n, writer, &mut written)?;
                }
            }
        }
    }

    if unlikely(!pending.is_empty()) {
        let mut left = pending.keys().copied().collect::<Vec<_>>();
        left.sort();

        warn!("{} cuboids are not complete when the queue is closed: {:?}", left.len(), left);

        if num_splits.is_some() {
            error_bail!("cuboids not reported by every split: {:?}", left);
        }
    }

    info!(
        "watcher done, cuboids: {}, rows: {}",
        written.cuboids, written.rows
    );

    Ok(written)
}

/// Merge and write `cuboid_id` if all `num_splits` splits have reported it.
fn try_merge<W: CuboidWriter>(
    merger: &SplitMerger,
    pending: &mut HashMap<CuboidId, Vec<(usize, Arc<CuboidResult>)>>,
    cuboid_id: CuboidId,
    num_splits: usize,
    writer: &mut W,
    written: &mut Written,
) -> Result<()> {
    let count = pending.get(&cuboid_id).map(|x| x.len()).unwrap_or(0);

    if unlikely(count > num_splits) {
        error_bail!(
            "cuboid {} reported {} times, more than {} splits",
            cuboid_id,
            count,
            num_splits
        );
    }

    if count < num_splits {
        return Ok(());
    }

    if let Some(mut results) = pending.remove(&cuboid_id) {
        results.sort_by_key(|(split, _)| *split);

        let results = results.into_iter().map(|(_, r)| r).collect::<Vec<_>>();
        let rows = merger.merge_and_output(cuboid_id, &results, writer)?;

        written.cuboids += 1;
        written.rows += rows;
    }

    Ok(())
}
