use anyhow::Result;
use likely_stable::unlikely;
use log::info;
use std::collections::HashSet;
use std::sync::Arc;

use cubelet_core::config::CubeBuilderConfig;
use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::grid_table::{MemStoreFactory, StoreFactory, TableTracker};
use cubelet_core::lattice::CuboidScheduler;
use cubelet_core::measure::MeasureDesc;
use cubelet_core::memory_budget::{system_available_mb, MemoryBudgetController};

/// Everything a build needs, passed explicitly to every component.
///
/// One context is shared by all splits of a dogged build, so the memory budget and the
/// table tracker are process wide for the build.
pub struct BuildContext {
    config: CubeBuilderConfig,
    scheduler: Arc<dyn CuboidScheduler>,
    measures: Arc<Vec<MeasureDesc>>,
    store_factory: Arc<dyn StoreFactory>,
    tracker: Arc<TableTracker>,
    memory_budget: Arc<MemoryBudgetController>,
}

impl BuildContext {
    pub fn new(
        config: CubeBuilderConfig,
        scheduler: Arc<dyn CuboidScheduler>,
        measures: Vec<MeasureDesc>,
    ) -> Result<Self> {
        config.validate()?;

        let mut names = HashSet::new();
        for m in measures.iter() {
            if unlikely(!names.insert(m.name.as_str())) {
                error_bail!("duplicate measure name: {}", m.name);
            }
        }

        let system_mb = config
            .system_memory_mb
            .unwrap_or_else(system_available_mb);
        let memory_budget = MemoryBudgetController::from_system(system_mb, config.reserve_memory_mb);

        info!(
            "build context, base cuboid: {}, cuboids: {}, measures: {}, worker threads: {}",
            scheduler.base_cuboid_id(),
            scheduler.cuboid_count(),
            measures.len(),
            config.worker_threads
        );

        Ok(Self {
            config,
            scheduler,
            measures: Arc::new(measures),
            store_factory: Arc::new(MemStoreFactory),
            tracker: Arc::new(TableTracker::new()),
            memory_budget: Arc::new(memory_budget),
        })
    }

    /// Use another store for the grid tables.
    pub fn with_store_factory(mut self, store_factory: Arc<dyn StoreFactory>) -> Self {
        self.store_factory = store_factory;
        self
    }

    /// Use a fixed memory budget instead of the one derived from system memory.
    pub fn with_memory_budget_mb(mut self, total_mb: usize) -> Self {
        info!("Memory Budget is {} MB", total_mb);
        self.memory_budget = Arc::new(MemoryBudgetController::new(total_mb));
        self
    }

    #[inline]
    pub fn config(&self) -> &CubeBuilderConfig {
        &self.config
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<dyn CuboidScheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn base_cuboid_id(&self) -> CuboidId {
        self.scheduler.base_cuboid_id()
    }

    #[inline]
    pub fn cuboid_count(&self) -> usize {
        self.scheduler.cuboid_count()
    }

    #[inline]
    pub fn measures(&self) -> &Arc<Vec<MeasureDesc>> {
        &self.measures
    }

    #[inline]
    pub fn store_factory(&self) -> &dyn StoreFactory {
        self.store_factory.as_ref()
    }

    #[inline]
    pub fn tracker(&self) -> &Arc<TableTracker> {
        &self.tracker
    }

    #[inline]
    pub fn memory_budget(&self) -> &Arc<MemoryBudgetController> {
        &self.memory_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubelet_core::lattice::FullLatticeScheduler;
    use cubelet_core::measure::MeasureFunction;

    #[test]
    fn test_build_context() -> Result<()> {
        let config = CubeBuilderConfig {
            system_memory_mb: Some(1000),
            reserve_memory_mb: 100,
            ..Default::default()
        };

        let ctx = BuildContext::new(
            config.clone(),
            Arc::new(FullLatticeScheduler::new(3)?),
            vec![MeasureDesc::new("v", MeasureFunction::Sum)],
        )?;

        assert_eq!(ctx.memory_budget().total_mb(), 900);
        assert_eq!(ctx.cuboid_count(), 8);
        assert_eq!(ctx.base_cuboid_id(), CuboidId::new(0b111));

        let ctx = ctx.with_memory_budget_mb(50);
        assert_eq!(ctx.memory_budget().total_mb(), 50);

        let duplicated = BuildContext::new(
            config,
            Arc::new(FullLatticeScheduler::new(2)?),
            vec![
                MeasureDesc::new("v", MeasureFunction::Sum),
                MeasureDesc::new("v", MeasureFunction::Max),
            ],
        );
        assert!(duplicated.is_err());

        Ok(())
    }
}
