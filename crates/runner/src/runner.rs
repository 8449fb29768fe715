//! The three-phase pipeline loop.
//!
//! A run walks through up to three phases, each picking up exactly where
//! the previous one stopped: archive ingestion while the archive is ahead
//! of the committed position, finalized ingestion from the live chain, and
//! finally hot ingestion once the store's finalized coverage has caught up
//! with the chain's finality boundary. Stores without hot-block support
//! simply never leave the second phase.

use crate::{RunnerError, metrics::RunnerMetrics, prometheus};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use trawler_ingest::{
    ArchiveDataSource, ArchiveIngest, ArchiveIngestOptions, DataBatch, HotBatch, HotDataSource,
    HotIngest, HotIngestOptions, StopPredicate,
};
use trawler_store::{
    Database, DatabaseState, FinalTxInfo, HotTxHandler, HotTxInfo, StoreError, TxHandler,
};
use trawler_types::{BatchRequest, BatchResponse, ClosedRange, HashAndHeight, apply_range_bound};

/// User-supplied mapping callback: transforms a batch of blocks into store
/// mutations. Invoked inside a store transaction; for hot processing the
/// batch holds a single block.
pub type BatchHandler<S, I> = Arc<
    dyn for<'a> Fn(&'a mut S, &'a BatchResponse<I>) -> BoxFuture<'a, Result<(), StoreError>>
        + Send
        + Sync,
>;

/// Drives a work plan from data sources into a store.
pub struct Runner<R, I, Db> {
    archive: Option<Arc<dyn ArchiveDataSource<Request = R, Item = I>>>,
    hot: Option<Arc<dyn HotDataSource<Request = R, Item = I>>>,
    requests: Vec<BatchRequest<R>>,
    database: Db,
    archive_poll_interval: Duration,
    hot_poll_interval: Duration,
    prometheus_port: Option<u16>,
}

impl<R, I, Db> std::fmt::Debug for Runner<R, I, Db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("archive", &self.archive.as_ref().map(|_| "<source>"))
            .field("hot", &self.hot.as_ref().map(|_| "<source>"))
            .field("requests", &self.requests.len())
            .field("archive_poll_interval", &self.archive_poll_interval)
            .field("hot_poll_interval", &self.hot_poll_interval)
            .field("prometheus_port", &self.prometheus_port)
            .finish_non_exhaustive()
    }
}

impl<R, I, Db> Runner<R, I, Db>
where
    R: Clone + Send + Sync + 'static,
    I: Send + Sync + 'static,
    Db: Database,
{
    /// Creates a runner over `database` and a work plan. At least one data
    /// source must be attached before [`run`](Self::run).
    pub fn new(database: Db, requests: Vec<BatchRequest<R>>) -> Self {
        Self {
            archive: None,
            hot: None,
            requests,
            database,
            archive_poll_interval: Duration::from_secs(2),
            hot_poll_interval: Duration::from_secs(1),
            prometheus_port: prometheus::port_from_env(),
        }
    }

    /// Attaches an archive data source.
    pub fn with_archive(mut self, src: Arc<dyn ArchiveDataSource<Request = R, Item = I>>) -> Self {
        self.archive = Some(src);
        self
    }

    /// Attaches a live chain data source.
    pub fn with_hot(mut self, src: Arc<dyn HotDataSource<Request = R, Item = I>>) -> Self {
        self.hot = Some(src);
        self
    }

    /// Overrides the archive height poll interval.
    pub fn with_archive_poll_interval(mut self, interval: Duration) -> Self {
        self.archive_poll_interval = interval;
        self
    }

    /// Overrides the live chain poll interval.
    pub fn with_hot_poll_interval(mut self, interval: Duration) -> Self {
        self.hot_poll_interval = interval;
        self
    }

    /// Overrides the Prometheus exporter port, normally taken from
    /// `TRAWLER_PROMETHEUS_PORT`.
    pub fn with_prometheus_port(mut self, port: Option<u16>) -> Self {
        self.prometheus_port = port;
        self
    }

    /// Runs the pipeline until the work plan is exhausted. Never returns
    /// for an open-ended plan unless an error occurs.
    pub async fn run(self, handler: BatchHandler<Db::Store, I>) -> Result<(), RunnerError> {
        if self.archive.is_none() && self.hot.is_none() {
            return Err(RunnerError::NoDataSource);
        }
        if let Some(port) = self.prometheus_port {
            prometheus::init_prometheus_server(port)?;
        }
        crate::metrics::Metrics::init();

        let mut state = self.database.connect().await?;
        // The work plan restarts right above the finalized head, not above
        // the hot suffix: a finalized commit rolls the persisted suffix
        // back, so its heights must be fetched and applied again.
        let next_height = state.height + 1;

        let plan = apply_range_bound(&self.requests, next_height);
        let Some(first) = plan.first() else {
            info!(target: "runner", "nothing to do");
            return Ok(());
        };
        match plan.last().and_then(|req| req.range.to) {
            Some(to) => {
                info!(target: "runner", from = first.range.from, to, "processing range");
            }
            None => info!(target: "runner", from = first.range.from, "processing range"),
        }
        if next_height > 0 {
            info!(
                target: "runner",
                head = %state.head(),
                top = state.top.len(),
                "resuming from persisted state"
            );
        }

        let metrics = RunnerMetrics::new();

        if let Some(archive) = &self.archive {
            let use_archive = match &self.hot {
                None => true,
                // The archive is only worth consulting once it has blocks
                // beyond everything already ingested, suffix included.
                Some(_) => {
                    let ingested = state.height + state.top.len() as i64;
                    archive.get_finalized_height().await? > ingested
                }
            };
            if use_archive {
                debug!(target: "runner", "entering archive phase");
                // Hand off to the live chain once its finality boundary
                // overtakes the archive.
                let stop = self.hot.as_ref().map(|hot| {
                    let hot = hot.clone();
                    let stop: StopPredicate = Arc::new(move |height| {
                        let hot = hot.clone();
                        Box::pin(async move {
                            let finalized = hot.get_finalized_head().await?;
                            Ok(finalized.height > height)
                        })
                    });
                    stop
                });
                let options = ArchiveIngestOptions {
                    poll_interval: self.archive_poll_interval,
                    stop_on_height: stop,
                    ..Default::default()
                };
                let requests = apply_range_bound(&self.requests, next_height);
                let ingest = ArchiveIngest::spawn(archive.clone(), requests, options);
                state = self.process_finalized_blocks(state, ingest, &handler, &metrics).await?;
            }
        }

        let Some(hot) = self.hot.clone() else { return Ok(()) };
        let next_height = state.height + 1;
        let requests = apply_range_bound(&self.requests, next_height);
        if requests.is_empty() {
            return Ok(());
        }

        let supports_hot = self.database.supports_hot_blocks();
        debug!(target: "runner", supports_hot, "entering chain-finalized phase");
        {
            // With a hot-capable store the finalized sweep ends as soon as
            // it has to wait for finality; otherwise it follows the
            // finality boundary forever.
            let stop = supports_hot.then(|| {
                let stop: StopPredicate = Arc::new(|_| Box::pin(async { Ok(true) }));
                stop
            });
            let options = ArchiveIngestOptions {
                poll_interval: self.hot_poll_interval,
                stop_on_height: stop,
                ..Default::default()
            };
            let src: Arc<dyn ArchiveDataSource<Request = R, Item = I>> = hot.clone();
            let ingest = ArchiveIngest::spawn(src, requests, options);
            state = self.process_finalized_blocks(state, ingest, &handler, &metrics).await?;
        }

        if !supports_hot {
            return Ok(());
        }
        debug!(target: "runner", "entering hot phase");
        self.process_hot_blocks(state, hot, &handler, &metrics).await
    }

    async fn process_finalized_blocks(
        &self,
        mut state: DatabaseState,
        mut ingest: ArchiveIngest<I>,
        handler: &BatchHandler<Db::Store, I>,
        metrics: &RunnerMetrics,
    ) -> Result<DatabaseState, RunnerError> {
        // The first commit must reach past the persisted hot suffix, or the
        // store would be asked to regress. Batches below that bar are
        // concatenated.
        let minimum_commit_height = state.height + state.top.len() as i64;
        let mut pending: Option<DataBatch<I>> = None;

        while let Some(next) = ingest.next_batch().await {
            let mut batch = next?;
            if let Some(held) = pending.take() {
                batch = merge_batches(held, batch);
            }
            if batch.range.to < minimum_commit_height {
                pending = Some(batch);
            } else {
                self.handle_finalized_batch(&mut state, batch, handler, metrics).await?;
            }
        }
        if let Some(held) = pending {
            self.handle_finalized_batch(&mut state, held, handler, metrics).await?;
        }
        Ok(state)
    }

    async fn handle_finalized_batch(
        &self,
        state: &mut DatabaseState,
        batch: DataBatch<I>,
        handler: &BatchHandler<Db::Store, I>,
        metrics: &RunnerMetrics,
    ) -> Result<(), RunnerError> {
        metrics.set_chain_height(batch.chain_height);
        let fetch = batch.fetch_end.duration_since(batch.fetch_start);

        let Some(last) = batch.blocks.last() else {
            warn!(
                target: "runner",
                from = batch.range.from,
                to = batch.range.to,
                "skipping a batch with no blocks"
            );
            return Ok(());
        };
        if last.header.height < batch.range.to {
            warn!(
                target: "runner",
                range_to = batch.range.to,
                last = %last.header.block_ref(),
                "batch does not contain the last block of its range"
            );
        }
        let next_head = last.header.block_ref();

        let info = FinalTxInfo {
            prev_head: state.head(),
            next_head: next_head.clone(),
            is_on_top: batch.range.to == batch.chain_height,
        };
        let block_count = batch.blocks.len();
        let chain_height = batch.chain_height;
        let response =
            Arc::new(BatchResponse { range: batch.range, blocks: batch.blocks, chain_height });
        let item_count = response.blocks.iter().map(|b| b.items.len()).sum::<usize>();

        let mapping_start = Instant::now();
        let handler = handler.clone();
        let cb: TxHandler<'_, Db::Store> = Box::new(move |store| {
            let handler = handler.clone();
            let response = response.clone();
            Box::pin(async move { handler(store, response.as_ref()).await })
        });
        self.database.transact(info, cb).await?;

        state.height = next_head.height;
        state.hash = next_head.hash;
        state.top.clear();
        state.nonce += 1;

        metrics.register_batch(block_count, item_count, fetch, mapping_start.elapsed());
        metrics.set_last_processed(state.height);
        info!(target: "runner", "{}", metrics.status_line());
        Ok(())
    }

    async fn process_hot_blocks(
        &self,
        state: DatabaseState,
        src: Arc<dyn HotDataSource<Request = R, Item = I>>,
        handler: &BatchHandler<Db::Store, I>,
        metrics: &RunnerMetrics,
    ) -> Result<(), RunnerError> {
        let requests = apply_range_bound(&self.requests, state.height + 1);
        let mut ingest = HotIngest::new(
            src,
            state.head(),
            state.top,
            requests,
            HotIngestOptions { poll_interval: self.hot_poll_interval },
        )?;

        while let Some(batch) = ingest.next_batch().await? {
            let HotBatch { data, finalized_head, base_head } = batch;
            metrics.set_chain_height(data.chain_height);
            let fetch = data.fetch_end.duration_since(data.fetch_start);
            let base_height = base_head.height;
            let chain_height = data.chain_height;
            let block_count = data.blocks.len();
            let item_count = data.item_count();

            let new_blocks: Vec<HashAndHeight> =
                data.blocks.iter().map(|b| b.header.block_ref()).collect();
            let top_height = new_blocks.last().map_or(base_height, |b| b.height);

            // One single-block response per new block; the store invokes
            // the callback once per block, in ascending order.
            let responses: Arc<Vec<BatchResponse<I>>> = Arc::new(
                data.blocks
                    .into_iter()
                    .map(|block| {
                        let height = block.header.height;
                        BatchResponse {
                            range: ClosedRange::new(height, height),
                            blocks: vec![block],
                            chain_height,
                        }
                    })
                    .collect(),
            );

            let info = HotTxInfo { finalized_head, base_head, new_blocks };

            let mapping_start = Instant::now();
            let handler = handler.clone();
            let cb: HotTxHandler<'_, Db::Store> = Box::new(move |store, block_ref| {
                let handler = handler.clone();
                let responses = responses.clone();
                let block_ref = block_ref.clone();
                Box::pin(async move {
                    let response = usize::try_from(block_ref.height - base_height - 1)
                        .ok()
                        .and_then(|idx| responses.get(idx));
                    let found =
                        response.and_then(|r| r.blocks.first()).map(|b| b.header.block_ref());
                    match (response, found) {
                        (Some(response), Some(found)) if found == block_ref => {
                            handler(store, response).await
                        }
                        (_, found) => Err(StoreError::CursorMismatch {
                            cursor: block_ref,
                            block: found.unwrap_or_else(HashAndHeight::genesis_parent),
                        }),
                    }
                })
            });
            self.database.transact_hot(info, cb).await?;

            metrics.register_batch(block_count, item_count, fetch, mapping_start.elapsed());
            metrics.set_last_processed(top_height);
            info!(target: "runner", "{}", metrics.status_line());
        }
        Ok(())
    }
}

fn merge_batches<I>(mut left: DataBatch<I>, right: DataBatch<I>) -> DataBatch<I> {
    left.range.to = right.range.to;
    left.blocks.extend(right.blocks);
    left.chain_height = left.chain_height.max(right.chain_height);
    left.fetch_end = right.fetch_end;
    left
}
