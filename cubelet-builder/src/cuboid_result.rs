use anyhow::{anyhow, Result};
use async_channel::TrySendError;
use dashmap::DashMap;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use cubelet_core::cuboid::CuboidId;
use cubelet_core::error_bail;
use cubelet_core::grid_table::GridTable;

/// One computed cuboid of a build, or of one split of a dogged build.
///
/// Immutable once created. The table is exclusive to the result until it's closed.
pub struct CuboidResult {
    cuboid_id: CuboidId,
    table: GridTable,
    row_count: usize,
    build_millis: u64,
    aggr_cache_mb: usize,
}

impl CuboidResult {
    pub fn new(
        cuboid_id: CuboidId,
        table: GridTable,
        row_count: usize,
        build_millis: u64,
        aggr_cache_mb: usize,
    ) -> Self {
        Self {
            cuboid_id,
            table,
            row_count,
            build_millis,
            aggr_cache_mb,
        }
    }

    #[inline]
    pub fn cuboid_id(&self) -> CuboidId {
        self.cuboid_id
    }

    #[inline]
    pub fn table(&self) -> &GridTable {
        &self.table
    }

    #[inline]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    #[inline]
    pub fn build_millis(&self) -> u64 {
        self.build_millis
    }

    /// Estimated aggregation cache needed to aggregate this cuboid into a child.
    #[inline]
    pub fn aggr_cache_mb(&self) -> usize {
        self.aggr_cache_mb
    }
}

/// Message to the watcher of a dogged build.
pub enum CompletionEvent {
    /// A cuboid of split `split` is done.
    Result {
        split: usize,
        result: Arc<CuboidResult>,
    },

    /// All splits are known. Only results of `num_splits` non empty splits will come.
    SplitsSealed(usize),
}

/// Offer `item` to a bounded queue, sleeping `retry_interval` while it's full.
///
/// Fails once the total wait is beyond `wait_ceiling`, or if the queue is closed.
pub async fn offer_with_backoff<T>(
    sender: &async_channel::Sender<T>,
    item: T,
    retry_interval: Duration,
    wait_ceiling: Duration,
) -> Result<()> {
    let mut item = item;
    let mut retries = 0u64;
    let mut waited = Duration::ZERO;

    loop {
        match sender.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => {
                error_bail!("output queue is closed, retries: {}", retries);
            }
            Err(TrySendError::Full(back)) => {
                item = back;

                if waited >= wait_ceiling {
                    error_bail!(
                        "output queue is still full after waiting {} ms, queue size: {}, retries: {}",
                        waited.as_millis(),
                        sender.len(),
                        retries
                    );
                }

                retries += 1;
                info!(
                    "output queue is full, queue size: {}, retries: {}, waited: {} ms",
                    sender.len(),
                    retries,
                    waited.as_millis()
                );

                let sleep = retry_interval.min(wait_ceiling - waited).max(Duration::from_millis(1));
                tokio::time::sleep(sleep).await;
                waited += sleep;
            }
        }
    }
}

/// Forwards results of one split to the watcher.
#[derive(Clone)]
pub struct ResultNotifier {
    split: usize,
    sender: async_channel::Sender<CompletionEvent>,
    retry_interval: Duration,
    wait_ceiling: Duration,
}

impl ResultNotifier {
    pub fn new(
        split: usize,
        sender: async_channel::Sender<CompletionEvent>,
        retry_interval: Duration,
        wait_ceiling: Duration,
    ) -> Self {
        Self {
            split,
            sender,
            retry_interval,
            wait_ceiling,
        }
    }

    pub fn split(&self) -> usize {
        self.split
    }

    pub async fn notify(&self, result: Arc<CuboidResult>) -> Result<()> {
        let cuboid_id = result.cuboid_id();

        offer_with_backoff(
            &self.sender,
            CompletionEvent::Result {
                split: self.split,
                result,
            },
            self.retry_interval,
            self.wait_ceiling,
        )
        .await
        .map_err(|e| {
            anyhow!(
                "failed to notify cuboid {} of split {}, error: {}",
                cuboid_id,
                self.split,
                e
            )
        })
    }
}

/// Collects the results of one builder, and notifies the watcher if there is one.
///
/// Every result stays here until the end of the build, the collector is what the cleanup
/// walks to close tables.
#[derive(Default)]
pub struct ResultCollector {
    results: DashMap<CuboidId, Arc<CuboidResult>>,
    notifier: Option<ResultNotifier>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(notifier: ResultNotifier) -> Self {
        Self {
            results: DashMap::new(),
            notifier: Some(notifier),
        }
    }

    /// Keep `result` without notifying.
    pub fn collect(&self, result: Arc<CuboidResult>) {
        if let Some(old) = self.results.insert(result.cuboid_id(), result) {
            warn!(
                "cuboid {} is collected twice, close the old table",
                old.cuboid_id()
            );
            old.table().close_quietly();
        }
    }

    pub async fn collect_and_notify(&self, result: Arc<CuboidResult>) -> Result<()> {
        self.collect(result.clone());

        match &self.notifier {
            Some(notifier) => notifier.notify(result).await,
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// All results, ordered by cuboid id.
    pub fn sorted_results(&self) -> Vec<Arc<CuboidResult>> {
        let mut results = self
            .results
            .iter()
            .map(|x| x.value().clone())
            .collect::<Vec<_>>();
        results.sort_by_key(|r| r.cuboid_id());

        results
    }

    /// Close every table not closed yet. Errors are logged. Returns the number closed.
    pub fn close_all(&self) -> usize {
        let mut count = 0;

        for result in self.sorted_results() {
            if !result.table().is_closed() {
                result.table().close_quietly();
                count += 1;
            }
        }

        if count > 0 {
            info!("closed {} grid tables", count);
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_with_backoff() -> Result<()> {
        let (sender, receiver) = async_channel::bounded::<u32>(1);

        offer_with_backoff(&sender, 1, Duration::from_millis(5), Duration::from_millis(20)).await?;

        // Full, nobody receives.
        let res =
            offer_with_backoff(&sender, 2, Duration::from_millis(5), Duration::from_millis(20)).await;
        assert!(res.is_err());

        // Full, then drained by a receiver.
        let drainer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = receiver.recv().await?;
            let second = receiver.recv().await?;
            Ok::<_, anyhow::Error>((first, second))
        });

        offer_with_backoff(&sender, 3, Duration::from_millis(5), Duration::from_secs(10)).await?;
        assert_eq!(drainer.await??, (1, 3));

        // Receiver dropped.
        assert!(
            offer_with_backoff(&sender, 4, Duration::from_millis(5), Duration::from_secs(10))
                .await
                .is_err()
        );

        Ok(())
    }
}
