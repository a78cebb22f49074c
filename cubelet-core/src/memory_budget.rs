//! Memory budget of a cube build.
//!
//! Aggregation caches can't shrink on demand, so the controller never evicts anything. A
//! reservation is granted if it fits in what's left of the budget, otherwise it's refused.
//! Reservations larger than the whole budget can never be granted.
//!
//! The only exception is the base cuboid: its cache is the minimal working set of a build,
//! so the budget is raised to hold it, with a warning.
use anyhow::Result;
use dashmap::DashMap;
use likely_stable::unlikely;
use log::{info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error_bail;
use crate::tool::bytes_to_mb;

/// Memory available to the process, in MB.
pub fn system_available_mb() -> usize {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();

    let available = sys.available_memory() as usize;
    if available == 0 {
        warn!("could not detect available system memory, fall back to 4096 MB");
        4096
    } else {
        available / crate::tool::ONE_MB
    }
}

/// Tracks the low and high water mark of a memory gauge.
///
/// Mark low before the aggregation starts, and high when the first row is emitted. The
/// difference is the size of the aggregation cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryWaterLevel {
    low: usize,
    high: usize,
}

impl MemoryWaterLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_low(&mut self, bytes: usize) {
        self.low = bytes;
        self.high = self.high.max(bytes);
    }

    pub fn mark_high(&mut self, bytes: usize) {
        self.high = self.high.max(bytes);
    }

    pub fn estimate_bytes(&self) -> usize {
        self.high.saturating_sub(self.low)
    }

    pub fn estimate_mb(&self) -> usize {
        bytes_to_mb(self.estimate_bytes())
    }
}

/// Process wide memory budget in MB, shared by all tasks of a build.
pub struct MemoryBudgetController {
    total_mb: AtomicUsize,
    reserved_mb: AtomicUsize,

    /// Key: consumer name, Value: reserved MB.
    consumers: DashMap<String, usize>,
}

impl MemoryBudgetController {
    pub fn new(total_mb: usize) -> Self {
        Self {
            total_mb: AtomicUsize::new(total_mb),
            reserved_mb: AtomicUsize::new(0),
            consumers: DashMap::new(),
        }
    }

    /// Budget of a build: system available memory minus the reserve for the system.
    pub fn from_system(system_available_mb: usize, reserve_mb: usize) -> Self {
        info!("System avail {} MB", system_available_mb);
        info!("Reserve {} MB for system basics", reserve_mb);

        let budget = system_available_mb.saturating_sub(reserve_mb);
        info!("Memory Budget is {} MB", budget);

        Self::new(budget)
    }

    pub fn total_mb(&self) -> usize {
        self.total_mb.load(Ordering::SeqCst)
    }

    pub fn reserved_mb(&self) -> usize {
        self.reserved_mb.load(Ordering::SeqCst)
    }

    pub fn available_mb(&self) -> usize {
        self.total_mb().saturating_sub(self.reserved_mb())
    }

    /// MB currently held by `consumer`.
    pub fn reserved_by(&self, consumer: &str) -> usize {
        self.consumers.get(consumer).map(|x| *x.value()).unwrap_or(0)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Try to reserve `mb` for `consumer`. Returns whether it's granted.
    ///
    /// A consumer reserving again replaces its previous reservation.
    pub fn reserve(&self, consumer: &str, mb: usize) -> bool {
        let held = self.reserved_by(consumer);

        if mb <= held {
            return self.shrink(consumer, held, mb);
        }

        let delta = mb - held;
        let mut current = self.reserved_mb.load(Ordering::SeqCst);

        loop {
            if current + delta > self.total_mb() {
                return false;
            }

            match self.reserved_mb.compare_exchange(
                current,
                current + delta,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.consumers.insert(consumer.to_string(), mb);

        true
    }

    fn shrink(&self, consumer: &str, held: usize, mb: usize) -> bool {
        self.reserved_mb.fetch_sub(held - mb, Ordering::SeqCst);

        if mb == 0 {
            self.consumers.remove(consumer);
        } else {
            self.consumers.insert(consumer.to_string(), mb);
        }

        true
    }

    /// Reserve `mb` for `consumer`, waiting for other consumers to release if it doesn't
    /// fit right now.
    ///
    /// Fails without waiting if `mb` is larger than the whole budget, the caller must not
    /// go on with the work of the consumer.
    pub async fn reserve_insist(
        &self,
        consumer: &str,
        mb: usize,
        retry_interval: Duration,
    ) -> Result<()> {
        let mut retries = 0u64;

        loop {
            if unlikely(mb > self.total_mb()) {
                error_bail!(
                    "{} requests {} MB, larger than the total memory budget {} MB",
                    consumer,
                    mb,
                    self.total_mb()
                );
            }

            if self.reserve(consumer, mb) {
                if retries > 0 {
                    info!(
                        "{} reserved {} MB after {} retries",
                        consumer, mb, retries
                    );
                }

                return Ok(());
            }

            retries += 1;
            if retries % 100 == 1 {
                info!(
                    "{} waits for {} MB, available: {} MB, retries: {}",
                    consumer,
                    mb,
                    self.available_mb(),
                    retries
                );
            }

            tokio::time::sleep(retry_interval).await;
        }
    }

    /// Release all memory held by `consumer`. Returns the released MB.
    pub fn release(&self, consumer: &str) -> usize {
        match self.consumers.remove(consumer) {
            Some((_, mb)) => {
                self.reserved_mb.fetch_sub(mb, Ordering::SeqCst);
                mb
            }
            None => 0,
        }
    }

    /// Make sure the budget can hold the aggregation cache of a base cuboid.
    ///
    /// The base cuboid is always granted. If its cache is larger than the budget, the budget
    /// is raised to it and a warning is logged. Returns whether the budget was raised.
    pub fn accommodate_base_cuboid(&self, base_aggr_cache_mb: usize) -> bool {
        let mut current = self.total_mb();

        loop {
            if base_aggr_cache_mb <= current {
                return false;
            }

            match self.total_mb.compare_exchange(
                current,
                base_aggr_cache_mb,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    warn!(
                        "Memory budget ({} MB) is less than base aggr cache ({} MB), raise budget to {} MB, consider more memory or dogged build",
                        current, base_aggr_cache_mb, base_aggr_cache_mb
                    );
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_and_release() {
        let budget = MemoryBudgetController::new(100);

        assert!(budget.reserve("a", 60));
        assert_eq!(budget.available_mb(), 40);

        assert!(!budget.reserve("b", 50));
        assert_eq!(budget.reserved_by("b"), 0);

        assert!(budget.reserve("b", 40));
        assert_eq!(budget.available_mb(), 0);

        // Shrink and grow an existing reservation.
        assert!(budget.reserve("a", 10));
        assert_eq!(budget.available_mb(), 50);
        assert!(budget.reserve("a", 60));
        assert_eq!(budget.available_mb(), 0);

        assert_eq!(budget.release("a"), 60);
        assert_eq!(budget.release("a"), 0);
        assert_eq!(budget.release("b"), 40);
        assert_eq!(budget.available_mb(), 100);
        assert_eq!(budget.consumer_count(), 0);
    }

    #[test]
    fn test_reserve_above_total_refused() {
        let budget = MemoryBudgetController::new(100);
        assert!(!budget.reserve("big", 101));
        assert_eq!(budget.reserved_mb(), 0);
    }

    #[test]
    fn test_from_system() {
        let budget = MemoryBudgetController::from_system(1000, 100);
        assert_eq!(budget.total_mb(), 900);

        let budget = MemoryBudgetController::from_system(50, 100);
        assert_eq!(budget.total_mb(), 0);
    }

    #[test]
    fn test_accommodate_base_cuboid() {
        let budget = MemoryBudgetController::new(20);

        assert!(!budget.accommodate_base_cuboid(10));
        assert_eq!(budget.total_mb(), 20);

        assert!(budget.accommodate_base_cuboid(50));
        assert_eq!(budget.total_mb(), 50);
        assert!(budget.reserve("child", 50));
    }

    #[test]
    fn test_water_level() {
        let mut level = MemoryWaterLevel::new();
        level.mark_low(100);
        level.mark_high(100 + 3 * crate::tool::ONE_MB);

        assert_eq!(level.estimate_bytes(), 3 * crate::tool::ONE_MB);
        assert_eq!(level.estimate_mb(), 3);
    }

    #[test]
    fn test_system_available_mb() {
        assert!(system_available_mb() > 0);
    }

    #[tokio::test]
    async fn test_reserve_insist_waits_for_release() -> Result<()> {
        let budget = Arc::new(MemoryBudgetController::new(100));
        assert!(budget.reserve("holder", 80));

        let releaser = {
            let budget = budget.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                budget.release("holder");
            })
        };

        budget
            .reserve_insist("waiter", 50, Duration::from_millis(5))
            .await?;
        releaser.await?;

        assert_eq!(budget.reserved_by("waiter"), 50);
        assert!(budget.reserved_mb() <= budget.total_mb());

        assert!(budget
            .reserve_insist("too_big", 101, Duration::from_millis(5))
            .await
            .is_err());

        Ok(())
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_budget() {
        let budget = Arc::new(MemoryBudgetController::new(64));

        let handles = (0..8)
            .map(|i| {
                let budget = budget.clone();
                std::thread::spawn(move || {
                    for j in 0..1000 {
                        let consumer = format!("consumer_{}_{}", i, j);
                        if budget.reserve(&consumer, 16) {
                            assert!(budget.reserved_mb() <= 64);
                            budget.release(&consumer);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(budget.reserved_mb(), 0);
    }
}
