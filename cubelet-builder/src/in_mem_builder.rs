//! Single pass cube build.
//!
//! The whole input is aggregated into the base cuboid first. Then every cuboid of the
//! lattice is aggregated from the table of its parent, one `CuboidTask` per cuboid. A task
//! spawns the tasks of its children right after its own table is built, then waits for
//! them, so the lattice is walked top down with all runtime workers busy.
//!
//! Each task reserves memory for its aggregation cache before aggregating, as much as the
//! parent's cache estimate, and releases it once the rows are in the table. Tasks wait
//! while the budget can't hold them.
use anyhow::{anyhow, Result};
use likely_stable::unlikely;
use log::{debug, error, info};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strum::Display;

use cubelet_core::aggregate_scanner::AggregateScanner;
use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::grid_table::{GridInfo, GridTable};
use cubelet_core::measure::{MeasureAggregators, MeasureDesc};
use cubelet_core::memory_budget::MemoryWaterLevel;
use cubelet_core::tool::{elapsed_millis, log_phase_done};
use cubelet_core::writer::{output_cuboid, CuboidWriter};

use crate::context::BuildContext;
use crate::cuboid_result::{CuboidResult, ResultCollector, ResultNotifier};
use crate::input::{InputConverterUnit, QueueController};

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    Idle,
    BuildingBase,
    FanningOut,
    Done,
    Failed,
}

/// State shared by all cuboid tasks of one builder.
struct TaskShared {
    name: String,
    ctx: Arc<BuildContext>,
    collector: Arc<ResultCollector>,
    completed: Arc<AtomicUsize>,
    base_rows: usize,
    base_aggr_cache_mb: usize,
}

/// Aggregate `parent` into the cuboid `child_id`.
pub struct CuboidTask {
    parent: Arc<CuboidResult>,
    child_id: CuboidId,
}

impl CuboidTask {
    pub fn new(parent: Arc<CuboidResult>, child_id: CuboidId) -> Self {
        Self { parent, child_id }
    }

    async fn run(self, shared: Arc<TaskShared>) -> Result<()> {
        let result = build_cuboid(&shared, &self.parent, self.child_id)
            .await
            .map_err(|e| {
                anyhow!(
                    "{} failed to build cuboid {} from {}, error: {}",
                    shared.name,
                    self.child_id,
                    self.parent.cuboid_id(),
                    e
                )
            })?;

        add_child_tasks(shared, result).await
    }
}

/// Spawn one task per child of `parent`, then wait for all of them.
///
/// All children are awaited even if one fails, so no task is left running when the build
/// returns. The first error is returned.
fn add_child_tasks(shared: Arc<TaskShared>, parent: Arc<CuboidResult>) -> TaskFuture {
    Box::pin(async move {
        let children = shared.ctx.scheduler().spanning_cuboids(parent.cuboid_id());

        let handles = children
            .into_iter()
            .map(|child| {
                let task = CuboidTask::new(parent.clone(), child);
                let shared = shared.clone();
                (child, tokio::spawn(task.run(shared)))
            })
            .collect::<Vec<_>>();

        let mut first_error = None;

        for (child, handle) in handles {
            let res = match handle.await {
                Ok(res) => res,
                Err(e) => Err(anyhow!("task of cuboid {} panicked: {}", child, e)),
            };

            if let Err(e) = res {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    error!("{}: more error after the first one, error: {}", shared.name, e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

async fn build_cuboid(
    shared: &TaskShared,
    parent: &CuboidResult,
    child_id: CuboidId,
) -> Result<Arc<CuboidResult>> {
    let consumer = format!("{}: AggrCache@Cuboid {}", shared.name, child_id);
    let budget = shared.ctx.memory_budget();

    // The child's cache can't be larger than the parent's.
    budget
        .reserve_insist(
            &consumer,
            parent.aggr_cache_mb(),
            shared.ctx.config().reserve_retry_interval(),
        )
        .await?;

    let res = aggregate_cuboid(shared, parent, child_id);
    budget.release(&consumer);

    let result = Arc::new(res?);
    shared.completed.fetch_add(1, Ordering::SeqCst);
    shared.collector.collect_and_notify(result.clone()).await?;

    Ok(result)
}

fn aggregate_cuboid(
    shared: &TaskShared,
    parent: &CuboidResult,
    child_id: CuboidId,
) -> Result<CuboidResult> {
    let start = coarsetime::Instant::now();
    info!("{}: Calculating cuboid {}", shared.name, child_id);

    let ctx = &shared.ctx;
    let table = GridTable::new(
        GridInfo::new(child_id, ctx.measures().clone()),
        ctx.store_factory(),
        ctx.tracker().clone(),
    )?;

    match fill_cuboid_table(ctx, parent, &table) {
        Ok(count) => {
            let millis = elapsed_millis(start);
            info!(
                "{}: Cuboid {} has {} rows, build takes {} ms",
                shared.name, child_id, count, millis
            );

            let aggr_cache_mb = ctx.config().aggr_cache.derive_mb(
                count,
                shared.base_rows,
                shared.base_aggr_cache_mb,
                parent.aggr_cache_mb(),
            );

            Ok(CuboidResult::new(child_id, table, count, millis, aggr_cache_mb))
        }
        Err(e) => {
            table.close_quietly();
            Err(e)
        }
    }
}

/// Aggregate the rows of `parent` into `table`, by the dimensions of `table`'s cuboid.
fn fill_cuboid_table(ctx: &BuildContext, parent: &CuboidResult, table: &GridTable) -> Result<usize> {
    let projection = parent.cuboid_id().projection_of(table.cuboid_id())?;

    let mut scanner =
        AggregateScanner::with_projection(projection, MeasureAggregators::for_descendant(ctx.measures()));

    for row in parent.table().scan()? {
        scanner.aggregate(row)?;
    }

    let mut builder = table.rebuild()?;
    for row in scanner.into_rows() {
        builder.write(row)?;
    }

    builder.close()
}

/// Aggregate the current split of `input` into the base cuboid `table`.
///
/// The high water mark is taken when the first row leaves the aggregation cache, at that
/// point the cache holds every row of the split.
async fn fill_base_table<T: Send, C: InputConverterUnit<T>>(
    input: &mut QueueController<T, C>,
    table: &GridTable,
    measures: &[MeasureDesc],
    water_level: &mut MemoryWaterLevel,
) -> Result<usize> {
    let mut scanner = AggregateScanner::new(MeasureAggregators::new(measures));
    let num_dims = table.info().dimension_count();

    while let Some(raw) = input.next_row().await? {
        scanner.aggregate(raw.into_grid_row(num_dims, measures)?)?;
    }

    let cache_bytes = scanner.estimated_cache_bytes();
    info!(
        "{} input rows aggregated into {} base rows, cache: {} bytes",
        scanner.input_rows(),
        scanner.len(),
        cache_bytes
    );

    let mut builder = table.rebuild()?;
    for (i, row) in scanner.into_rows().enumerate() {
        if i == 0 {
            water_level.mark_high(cache_bytes);
        }
        builder.write(row)?;
    }

    builder.close()
}

/// Builds all cuboids of one input, or of one split of the input.
pub struct InMemCubeBuilder {
    name: String,
    ctx: Arc<BuildContext>,
    state: BuildState,
    collector: Arc<ResultCollector>,
    completed: Arc<AtomicUsize>,
    base_result: Option<Arc<CuboidResult>>,
}

impl InMemCubeBuilder {
    pub fn new(name: &str, ctx: Arc<BuildContext>) -> Self {
        Self {
            name: name.to_string(),
            ctx,
            state: BuildState::Idle,
            collector: Arc::new(ResultCollector::new()),
            completed: Arc::new(AtomicUsize::new(0)),
            base_result: None,
        }
    }

    /// Send every result to a watcher as soon as it's built.
    pub fn with_notifier(mut self, notifier: ResultNotifier) -> Self {
        self.collector = Arc::new(ResultCollector::with_notifier(notifier));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn collector(&self) -> Arc<ResultCollector> {
        self.collector.clone()
    }

    pub fn base_result(&self) -> Option<Arc<CuboidResult>> {
        self.base_result.clone()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Whether every cuboid of the lattice is built.
    pub fn is_all_cuboid_done(&self) -> bool {
        self.completed_count() == self.ctx.cuboid_count()
    }

    fn check_state(&self, expected: BuildState, action: &str) -> Result<()> {
        if unlikely(self.state != expected) {
            error_bail!(
                "{}: cannot {} in state {}, expected: {}",
                self.name,
                action,
                self.state,
                expected
            );
        }

        Ok(())
    }

    /// Drain the current split of `input` into the base cuboid.
    ///
    /// The size of the aggregation cache is measured, and the memory budget is raised to
    /// hold it if needed. If there are no rows, all cuboids are considered done.
    pub async fn build_base_cuboid<T: Send, C: InputConverterUnit<T>>(
        &mut self,
        input: &mut QueueController<T, C>,
    ) -> Result<Arc<CuboidResult>> {
        self.check_state(BuildState::Idle, "build base cuboid")?;
        self.state = BuildState::BuildingBase;

        match self.create_base_cuboid(input).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.state = BuildState::Failed;
                Err(e)
            }
        }
    }

    async fn create_base_cuboid<T: Send, C: InputConverterUnit<T>>(
        &mut self,
        input: &mut QueueController<T, C>,
    ) -> Result<Arc<CuboidResult>> {
        let base_id = self.ctx.base_cuboid_id();
        let measures = self.ctx.measures().clone();

        info!("{}: Calculating base cuboid {}", self.name, base_id);
        let start = coarsetime::Instant::now();

        let table = GridTable::new(
            GridInfo::new(base_id, measures.clone()),
            self.ctx.store_factory(),
            self.ctx.tracker().clone(),
        )?;

        let mut water_level = MemoryWaterLevel::new();
        water_level.mark_low(0);

        let filled = fill_base_table(input, &table, &measures, &mut water_level).await;

        let count = match filled {
            Ok(count) => count,
            Err(e) => {
                table.close_quietly();
                return Err(e);
            }
        };

        let millis = elapsed_millis(start);
        info!(
            "{}: Cuboid {} has {} rows, build takes {} ms",
            self.name, base_id, count, millis
        );

        if count == 0 {
            let result = Arc::new(CuboidResult::new(base_id, table, 0, millis, 0));

            // Nothing to span, the whole lattice is done. An empty base is never notified.
            self.completed.store(self.ctx.cuboid_count(), Ordering::SeqCst);
            self.collector.collect(result.clone());
            self.base_result = Some(result.clone());
            self.state = BuildState::Done;

            return Ok(result);
        }

        info!(
            "{}: Wild estimate of base aggr cache is {} MB",
            self.name,
            water_level.estimate_mb()
        );

        let aggr_cache_mb = self.ctx.config().aggr_cache.floor_mb(water_level.estimate_mb());
        self.ctx.memory_budget().accommodate_base_cuboid(aggr_cache_mb);

        let result = Arc::new(CuboidResult::new(base_id, table, count, millis, aggr_cache_mb));

        self.completed.fetch_add(1, Ordering::SeqCst);
        self.base_result = Some(result.clone());
        self.collector.collect_and_notify(result.clone()).await?;

        Ok(result)
    }

    /// Build every cuboid below the base cuboid.
    pub async fn start_build_from_base_cuboid(&mut self) -> Result<()> {
        if self.state == BuildState::Done {
            return Ok(());
        }

        self.check_state(BuildState::BuildingBase, "start build from base cuboid")?;

        let base = match &self.base_result {
            Some(base) => base.clone(),
            None => {
                error_bail!("{}: no base cuboid", self.name);
            }
        };

        self.state = BuildState::FanningOut;
        let start = coarsetime::Instant::now();

        let shared = Arc::new(TaskShared {
            name: self.name.clone(),
            ctx: self.ctx.clone(),
            collector: self.collector.clone(),
            completed: self.completed.clone(),
            base_rows: base.row_count(),
            base_aggr_cache_mb: base.aggr_cache_mb(),
        });

        match add_child_tasks(shared, base).await {
            Ok(()) => {
                self.state = BuildState::Done;
                log_phase_done(&format!("{}: build from base cuboid", self.name), start);
                info!(
                    "{}: total CuboidResult count: {}",
                    self.name,
                    self.collector.len()
                );

                Ok(())
            }
            Err(e) => {
                self.state = BuildState::Failed;
                Err(e)
            }
        }
    }

    /// Build all cuboids, write them to `writer` in cuboid id order, and close it.
    ///
    /// Every table is closed and the writer is closed once, whatever happens.
    pub async fn build<T: Send, C: InputConverterUnit<T>, W: CuboidWriter>(
        mut self,
        mut input: QueueController<T, C>,
        writer: &mut W,
    ) -> Result<usize> {
        let start = coarsetime::Instant::now();
        info!("{}: in memory cube build start", self.name);

        let res = match self.build_base_cuboid(&mut input).await {
            Ok(_) => self.start_build_from_base_cuboid().await,
            Err(e) => Err(e),
        };

        let res = match res {
            Ok(()) => self.output_all(writer),
            Err(e) => Err(e),
        };

        self.collector.close_all();
        let res = close_writer(writer, res);

        if res.is_ok() {
            log_phase_done(&format!("{}: in memory cube build", self.name), start);
        }

        res
    }

    /// Write every result in cuboid id order, closing each table once written.
    fn output_all<W: CuboidWriter>(&self, writer: &mut W) -> Result<usize> {
        let mut total = 0;

        for result in self.collector.sorted_results() {
            let count = output_cuboid(result.cuboid_id(), result.table(), writer)?;
            total += count;
            debug!(
                "{}: cuboid {} written, rows: {}, build takes {} ms",
                self.name,
                result.cuboid_id(),
                count,
                result.build_millis()
            );

            result.table().close()?;
        }

        Ok(total)
    }
}

/// Close `writer`. A close error fails a successful build, and is only logged for a build
/// already failing.
pub(crate) fn close_writer<W: CuboidWriter + ?Sized>(writer: &mut W, res: Result<usize>) -> Result<usize> {
    match (res, writer.close()) {
        (Ok(total), Ok(())) => Ok(total),
        (Ok(_), Err(e)) => {
            error!("Error closing cuboid writer, error: {}", e);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            error!("Error closing cuboid writer, error: {}", close_err);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubelet_core::config::CubeBuilderConfig;
    use cubelet_core::lattice::{CuboidScheduler, ExplicitLatticeScheduler, FullLatticeScheduler};
    use cubelet_core::measure::MeasureFunction;
    use std::collections::BTreeMap;
    use cubelet_core::tool::setup_log;
    use std::time::Duration;

    use crate::input::{produce_records, EncodedRecord, EncodedRecordConverter};

    fn context(num_dims: usize) -> Result<Arc<BuildContext>> {
        context_with(Arc::new(FullLatticeScheduler::new(num_dims)?))
    }

    fn context_with(scheduler: Arc<dyn CuboidScheduler>) -> Result<Arc<BuildContext>> {
        let config = CubeBuilderConfig {
            system_memory_mb: Some(1024),
            ..Default::default()
        };

        Ok(Arc::new(BuildContext::new(
            config,
            scheduler,
            vec![MeasureDesc::new("v", MeasureFunction::Sum)],
        )?))
    }

    fn input(
        records: Vec<EncodedRecord>,
    ) -> QueueController<EncodedRecord, EncodedRecordConverter> {
        let (sender, receiver) = async_channel::bounded(16);
        tokio::spawn(produce_records(sender, records));

        QueueController::new(receiver, Arc::new(EncodedRecordConverter), Duration::from_millis(10))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_machine() -> Result<()> {
        setup_log();

        let ctx = context(2)?;
        let mut builder = InMemCubeBuilder::new("test", ctx.clone());
        assert_eq!(builder.state(), BuildState::Idle);
        assert_eq!(builder.state().to_string(), "IDLE");

        // Fan out before the base is built.
        assert!(builder.start_build_from_base_cuboid().await.is_err());

        let mut input = input(vec![
            EncodedRecord::row(vec![1, 1], vec![10]),
            EncodedRecord::row(vec![1, 2], vec![3]),
        ]);

        let base = builder.build_base_cuboid(&mut input).await?;
        assert_eq!(base.row_count(), 2);
        assert!(base.aggr_cache_mb() >= 10);
        assert_eq!(builder.state(), BuildState::BuildingBase);
        assert_eq!(builder.completed_count(), 1);
        assert!(!builder.is_all_cuboid_done());

        assert!(builder.build_base_cuboid(&mut input).await.is_err());

        builder.start_build_from_base_cuboid().await?;
        assert_eq!(builder.state(), BuildState::Done);
        assert!(builder.is_all_cuboid_done());
        assert_eq!(builder.collector().len(), 4);

        assert_eq!(builder.collector().close_all(), 4);
        assert_eq!(ctx.tracker().opened(), ctx.tracker().closed());
        assert_eq!(ctx.memory_budget().reserved_mb(), 0);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_cuboid_lattice() -> Result<()> {
        setup_log();

        let scheduler = ExplicitLatticeScheduler::new(CuboidId::new(0b1), BTreeMap::new())?;
        let ctx = context_with(Arc::new(scheduler))?;
        assert_eq!(ctx.cuboid_count(), 1);

        let mut builder = InMemCubeBuilder::new("single", ctx.clone());
        let mut input = input(vec![
            EncodedRecord::row(vec![1], vec![1]),
            EncodedRecord::row(vec![1], vec![2]),
        ]);

        let base = builder.build_base_cuboid(&mut input).await?;
        assert_eq!(base.row_count(), 1);
        assert!(builder.is_all_cuboid_done());

        builder.start_build_from_base_cuboid().await?;
        assert!(builder.is_all_cuboid_done());
        assert_eq!(builder.completed_count(), 1);

        builder.collector().close_all();

        Ok(())
    }
}
