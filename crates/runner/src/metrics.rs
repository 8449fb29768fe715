//! Pipeline progress metrics.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
pub(crate) struct Metrics;

impl Metrics {
    pub(crate) const CHAIN_HEIGHT: &'static str = "trawler_chain_height";
    pub(crate) const LAST_PROCESSED_BLOCK: &'static str = "trawler_last_processed_block";
    pub(crate) const BLOCKS_PROCESSED_TOTAL: &'static str = "trawler_blocks_processed_total";
    pub(crate) const ITEMS_PROCESSED_TOTAL: &'static str = "trawler_items_processed_total";
    pub(crate) const FETCH_DURATION_SECONDS: &'static str = "trawler_fetch_duration_seconds";
    pub(crate) const MAPPING_DURATION_SECONDS: &'static str = "trawler_mapping_duration_seconds";

    pub(crate) fn init() {
        Self::describe();
        Self::zero();
    }

    fn describe() {
        metrics::describe_gauge!(
            Self::CHAIN_HEIGHT,
            metrics::Unit::Count,
            "Highest finalized chain height observed by the pipeline",
        );

        metrics::describe_gauge!(
            Self::LAST_PROCESSED_BLOCK,
            metrics::Unit::Count,
            "Height of the last block committed to the store",
        );

        metrics::describe_counter!(
            Self::BLOCKS_PROCESSED_TOTAL,
            metrics::Unit::Count,
            "Total number of blocks committed to the store",
        );

        metrics::describe_counter!(
            Self::ITEMS_PROCESSED_TOTAL,
            metrics::Unit::Count,
            "Total number of decoded entities committed to the store",
        );

        metrics::describe_histogram!(
            Self::FETCH_DURATION_SECONDS,
            metrics::Unit::Seconds,
            "Time spent fetching a batch from the data source",
        );

        metrics::describe_histogram!(
            Self::MAPPING_DURATION_SECONDS,
            metrics::Unit::Seconds,
            "Time spent transforming and committing a batch",
        );
    }

    fn zero() {
        metrics::gauge!(Self::CHAIN_HEIGHT,).set(0.0);

        metrics::gauge!(Self::LAST_PROCESSED_BLOCK,).set(0.0);

        metrics::counter!(Self::BLOCKS_PROCESSED_TOTAL,).increment(0);

        metrics::counter!(Self::ITEMS_PROCESSED_TOTAL,).increment(0);

        metrics::histogram!(Self::FETCH_DURATION_SECONDS,).record(0.0);

        metrics::histogram!(Self::MAPPING_DURATION_SECONDS,).record(0.0);
    }
}

#[derive(Debug)]
struct Progress {
    chain_height: i64,
    last_block: i64,
    blocks: u64,
    started: Instant,
}

/// Shared progress tracker behind the per-commit status line.
#[derive(Debug)]
pub(crate) struct RunnerMetrics {
    inner: Mutex<Progress>,
}

impl RunnerMetrics {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Progress {
                chain_height: 0,
                last_block: -1,
                blocks: 0,
                started: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_chain_height(&self, height: i64) {
        metrics::gauge!(Metrics::CHAIN_HEIGHT).set(height as f64);
        self.lock().chain_height = height;
    }

    pub(crate) fn set_last_processed(&self, height: i64) {
        metrics::gauge!(Metrics::LAST_PROCESSED_BLOCK).set(height as f64);
        self.lock().last_block = height;
    }

    pub(crate) fn register_batch(
        &self,
        blocks: usize,
        items: usize,
        fetch: Duration,
        mapping: Duration,
    ) {
        metrics::counter!(Metrics::BLOCKS_PROCESSED_TOTAL).increment(blocks as u64);
        metrics::counter!(Metrics::ITEMS_PROCESSED_TOTAL).increment(items as u64);
        metrics::histogram!(Metrics::FETCH_DURATION_SECONDS).record(fetch.as_secs_f64());
        metrics::histogram!(Metrics::MAPPING_DURATION_SECONDS).record(mapping.as_secs_f64());
        self.lock().blocks += blocks as u64;
    }

    /// One human-readable progress line, logged after every commit.
    pub(crate) fn status_line(&self) -> String {
        let progress = self.lock();
        let elapsed = progress.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { progress.blocks as f64 / elapsed } else { 0.0 };
        if progress.chain_height > progress.last_block {
            format!("{} / {}, {rate:.0} blocks/sec", progress.last_block, progress.chain_height)
        } else {
            format!("{}, {rate:.0} blocks/sec", progress.last_block)
        }
    }
}
