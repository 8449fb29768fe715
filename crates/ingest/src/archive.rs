//! Paginated ingestion of finalized block history.
//!
//! A spawned producer task owns the queue of remaining batch requests and
//! pushes validated batches into a bounded channel. The channel provides
//! both the read-ahead buffering (the producer keeps fetching while the
//! consumer processes earlier batches) and the backpressure that stops it
//! from running away.

use crate::{ArchiveDataSource, DataBatch, IngestError};
use futures::future::BoxFuture;
use std::{collections::VecDeque, sync::Arc, time::Duration, time::Instant};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};
use trawler_types::{BatchRequest, BatchResponse};

/// Asynchronous predicate consulted while waiting for the upstream
/// finalized height to advance. Returning `true` ends the ingestion stream
/// early; used to hand off to hot ingestion once a live chain overtakes the
/// archive.
pub type StopPredicate =
    Arc<dyn Fn(i64) -> BoxFuture<'static, Result<bool, IngestError>> + Send + Sync>;

/// Options for [`ArchiveIngest`].
#[derive(Clone)]
pub struct ArchiveIngestOptions {
    /// Interval between finalized-height polls while caught up.
    pub poll_interval: Duration,
    /// How many fetched batches may sit unconsumed before the producer
    /// blocks.
    pub max_buffered_batches: usize,
    /// Optional early-stop predicate, see [`StopPredicate`].
    pub stop_on_height: Option<StopPredicate>,
}

impl Default for ArchiveIngestOptions {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(2), max_buffered_batches: 2, stop_on_height: None }
    }
}

impl std::fmt::Debug for ArchiveIngestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveIngestOptions")
            .field("poll_interval", &self.poll_interval)
            .field("max_buffered_batches", &self.max_buffered_batches)
            .field("stop_on_height", &self.stop_on_height.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// An ordered, backpressured stream of contiguous finalized block batches.
///
/// Finite if the last request of the work plan is bounded, infinite
/// otherwise; a single traversal, not restartable. Dropping it stops the
/// producer task.
#[derive(Debug)]
pub struct ArchiveIngest<I> {
    batches: mpsc::Receiver<Result<DataBatch<I>, IngestError>>,
    producer: JoinHandle<()>,
}

impl<I: Send + 'static> ArchiveIngest<I> {
    /// Spawns the fetch producer over `requests` and returns the consuming
    /// end.
    pub fn spawn<S>(
        src: Arc<S>,
        requests: Vec<BatchRequest<S::Request>>,
        options: ArchiveIngestOptions,
    ) -> Self
    where
        S: ArchiveDataSource<Item = I> + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::channel(options.max_buffered_batches.max(1));
        let producer = tokio::spawn(fetch_loop(src, VecDeque::from(requests), options, tx));
        Self { batches: rx, producer }
    }

    /// The next batch in strict issue order, `None` once the work plan is
    /// exhausted or the stop predicate fired. A fetch or validation failure
    /// is delivered here in FIFO position and ends the stream.
    pub async fn next_batch(&mut self) -> Option<Result<DataBatch<I>, IngestError>> {
        self.batches.recv().await
    }
}

impl<I> Drop for ArchiveIngest<I> {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

async fn fetch_loop<S>(
    src: Arc<S>,
    mut requests: VecDeque<BatchRequest<S::Request>>,
    options: ArchiveIngestOptions,
    tx: mpsc::Sender<Result<DataBatch<S::Item>, IngestError>>,
) where
    S: ArchiveDataSource + ?Sized,
{
    let mut chain_height = match src.get_finalized_height().await {
        Ok(height) => height,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        }
    };

    while let Some(req) = requests.front() {
        match wait_for_height(&*src, &mut chain_height, req.range.from, &options).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }

        let fetch_start = Instant::now();
        let response = match src.get_finalized_batch(req).await {
            Ok(response) => response,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        let fetch_end = Instant::now();

        if let Err(err) = validate_response(req, &response) {
            let _ = tx.send(Err(err)).await;
            return;
        }

        chain_height = chain_height.max(response.chain_height);

        if response.range.to < req.range.end() {
            // Non-terminal prefix: shrink the head-of-queue request to the
            // remaining sub-range.
            if let Some(head) = requests.front_mut() {
                head.range.from = response.range.to + 1;
            }
        } else {
            requests.pop_front();
        }

        trace!(
            target: "archive_ingest",
            from = response.range.from,
            to = response.range.to,
            blocks = response.blocks.len(),
            chain_height,
            "fetched finalized batch"
        );

        let batch = DataBatch {
            range: response.range,
            blocks: response.blocks,
            chain_height,
            fetch_start,
            fetch_end,
        };
        if tx.send(Ok(batch)).await.is_err() {
            // Consumer gone.
            return;
        }
    }
}

/// Blocks until the cached chain height reaches `minimum`, re-polling the
/// source at the configured interval. Returns `false` if the stop predicate
/// fired first.
async fn wait_for_height<S>(
    src: &S,
    chain_height: &mut i64,
    minimum: i64,
    options: &ArchiveIngestOptions,
) -> Result<bool, IngestError>
where
    S: ArchiveDataSource + ?Sized,
{
    while *chain_height < minimum {
        if let Some(stop) = &options.stop_on_height {
            if stop(*chain_height).await? {
                debug!(
                    target: "archive_ingest",
                    chain_height = *chain_height,
                    "stop predicate fired while waiting for height"
                );
                return Ok(false);
            }
        }
        tokio::time::sleep(options.poll_interval).await;
        *chain_height = (*chain_height).max(src.get_finalized_height().await?);
        debug!(target: "archive_ingest", chain_height = *chain_height, minimum, "polled finalized height");
    }
    Ok(true)
}

fn validate_response<R, I>(
    req: &BatchRequest<R>,
    response: &BatchResponse<I>,
) -> Result<(), IngestError> {
    let range = response.range;

    if range.from != req.range.from
        || range.from > range.to
        || range.to > req.range.end()
        || range.to > response.chain_height
    {
        return Err(IngestError::ResponseOutOfBounds {
            requested_from: req.range.from,
            got: range,
            chain_height: response.chain_height,
        });
    }

    if let Some(first) = response.blocks.first() {
        if first.header.height < range.from {
            return Err(IngestError::BlockOutOfRange { height: first.header.height, range });
        }
    }
    if let Some(last) = response.blocks.last() {
        if last.header.height > range.to {
            return Err(IngestError::BlockOutOfRange { height: last.header.height, range });
        }
    }

    for pair in response.blocks.windows(2) {
        let (a, b) = (&pair[0].header, &pair[1].header);
        if b.height != a.height + 1 {
            return Err(trawler_types::ContinuityError { expected: a.height + 1, got: b.height }.into());
        }
        if b.parent_hash != a.hash {
            return Err(IngestError::ParentHashMismatch {
                at: b.block_ref(),
                parent_hash: b.parent_hash.clone(),
                prev: a.block_ref(),
            });
        }
    }

    Ok(())
}
