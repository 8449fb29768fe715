//! Live chain-head tracking and reorg reconciliation.
//!
//! [`HotIngest`] keeps an in-memory view of the unfinalized suffix of the
//! chain: the finalized head plus a short contiguous run of block
//! references above it (`top`). Each poll walks backward from the new best
//! head until it meets the known suffix, producing the minimal diff — the
//! blocks to append plus, implicitly via `base_head`, the suffix to roll
//! back.

use crate::{DataBatch, HotBatch, HotDataSource, IngestError};
use std::{sync::Arc, time::Duration, time::Instant};
use tracing::{debug, warn};
use trawler_types::{BatchRequest, Block, ClosedRange, HashAndHeight, assert_chain_continuity};

/// Options for [`HotIngest`].
#[derive(Debug, Clone)]
pub struct HotIngestOptions {
    /// Pacing interval between chain polls; the sleep is shortened by the
    /// time the previous poll took.
    pub poll_interval: Duration,
}

impl Default for HotIngestOptions {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(1) }
    }
}

/// An infinite, single-traversal sequence of [`HotBatch`]es over the
/// unfinalized suffix of a live chain.
pub struct HotIngest<S: HotDataSource + ?Sized> {
    src: Arc<S>,
    requests: Vec<BatchRequest<S::Request>>,
    /// Exclusive lower bound of the live suffix.
    finalized_head: HashAndHeight,
    /// Contiguous chain of block references right above `finalized_head`.
    top: Vec<HashAndHeight>,
    poll_interval: Duration,
    last_poll: Option<Instant>,
}

impl<S: HotDataSource + ?Sized> std::fmt::Debug for HotIngest<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotIngest")
            .field("finalized_head", &self.finalized_head)
            .field("top", &self.top)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl<S: HotDataSource + ?Sized> HotIngest<S> {
    /// Creates a new [`HotIngest`] resuming from a persisted position:
    /// `finalized_head` is the last committed finalized block and `top` the
    /// persisted unfinalized suffix above it.
    pub fn new(
        src: Arc<S>,
        finalized_head: HashAndHeight,
        top: Vec<HashAndHeight>,
        requests: Vec<BatchRequest<S::Request>>,
        options: HotIngestOptions,
    ) -> Result<Self, IngestError> {
        assert_chain_continuity(&finalized_head, &top)?;
        Ok(Self {
            src,
            requests,
            finalized_head,
            top,
            poll_interval: options.poll_interval,
            last_poll: None,
        })
    }

    /// Polls the chain until a non-empty batch of new blocks is available.
    ///
    /// Returns `Ok(None)` once no remaining request wants any height beyond
    /// the finalized head.
    pub async fn next_batch(&mut self) -> Result<Option<HotBatch<S::Item>>, IngestError> {
        while self.waits_for_blocks() {
            if let Some(started) = self.last_poll {
                let elapsed = started.elapsed();
                if elapsed < self.poll_interval {
                    tokio::time::sleep(self.poll_interval - elapsed).await;
                }
            }

            let fetch_start = Instant::now();
            self.last_poll = Some(fetch_start);
            let new_blocks = self.poll_new_blocks().await?;
            let fetch_end = Instant::now();

            let (base_head, first_height) = match new_blocks.first() {
                Some(block) => (block.header.parent_ref(), block.header.height),
                None => continue,
            };
            let last_height = new_blocks.last().map(|b| b.header.height).unwrap_or(first_height);

            return Ok(Some(HotBatch {
                data: DataBatch {
                    range: ClosedRange::new(first_height, last_height),
                    blocks: new_blocks,
                    chain_height: last_height,
                    fetch_start,
                    fetch_end,
                },
                finalized_head: self.finalized_head.clone(),
                base_head,
            }));
        }
        Ok(None)
    }

    /// Whether any request still wants a height above the finalized head.
    fn waits_for_blocks(&self) -> bool {
        let next = self.finalized_head.height + 1;
        self.requests.iter().any(|req| next <= req.range.end())
    }

    /// The current end of the known chain.
    fn tip(&self) -> &HashAndHeight {
        self.top.last().unwrap_or(&self.finalized_head)
    }

    fn request_at_height(&self, height: i64) -> Option<&S::Request> {
        self.requests.iter().find(|req| req.range.contains(height)).map(|req| &req.request)
    }

    async fn fetch_block(
        &self,
        at: &HashAndHeight,
    ) -> Result<(Block<S::Item>, HashAndHeight), IngestError> {
        let request = self.request_at_height(at.height);
        let block = self.src.get_block(&at.hash, request).await?;
        let parent = block.header.parent_ref();
        Ok((block, parent))
    }

    async fn poll_new_blocks(&mut self) -> Result<Vec<Block<S::Item>>, IngestError> {
        let mut finalized = self.src.get_finalized_head().await?;
        let mut best = self.src.get_best_head().await?;

        if self.finalized_head.height > finalized.height {
            // Load-balanced providers occasionally answer from a lagging
            // node; keep our own view of finality.
            warn!(
                target: "hot_ingest",
                upstream = %finalized,
                known = %self.finalized_head,
                "upstream finalized head regressed"
            );
            finalized = self.finalized_head.clone();
        }
        if finalized.height == self.finalized_head.height
            && finalized.hash != self.finalized_head.hash
        {
            // Finalized history must never fork, not even at the boundary
            // itself.
            return Err(IngestError::FinalizedHeadMismatch {
                height: finalized.height,
                upstream: finalized.hash,
                known: self.finalized_head.hash.clone(),
            });
        }
        if finalized.height > best.height {
            return Err(IngestError::FinalityAboveBest { finalized, best });
        }

        if self.tip().height > best.height {
            let best_pos = best.height - self.finalized_head.height;
            if best_pos <= 0 {
                if best.hash == self.finalized_head.hash {
                    return Ok(Vec::new());
                }
                return Err(IngestError::ForkBelowFinalized {
                    finalized: self.finalized_head.clone(),
                });
            }
            let idx = (best_pos - 1) as usize;
            if self.top[idx].hash == best.hash {
                // The upstream lost progress; not a fork, nothing to do.
                return Ok(Vec::new());
            }
            // A proper fork below our tip. No height judgement here:
            // chains differ in how they define the best block. Drop the
            // conflicting suffix and let the walk find the ancestor.
            self.top.truncate(idx);
        }

        let mut new_blocks: Vec<Block<S::Item>> = Vec::new();

        // Walk down from the best head to the height of our tip.
        while self.tip().height < best.height {
            let (block, parent) = self.fetch_block(&best).await?;
            new_blocks.push(block);
            best = parent;
        }

        // Keep walking (and popping our suffix) until the hashes meet.
        while self.tip().hash != best.hash {
            if self.top.is_empty() {
                return Err(IngestError::ForkBelowFinalized {
                    finalized: self.finalized_head.clone(),
                });
            }
            let (block, parent) = self.fetch_block(&best).await?;
            new_blocks.push(block);
            best = parent;
            self.top.pop();
        }

        // Collected newest-first; append in ascending order.
        new_blocks.reverse();
        for block in &new_blocks {
            let tip = self.tip().clone();
            let header = &block.header;
            if header.height != tip.height + 1 || header.parent_hash != tip.hash {
                return Err(IngestError::ParentHashMismatch {
                    at: header.block_ref(),
                    parent_hash: header.parent_hash.clone(),
                    prev: tip,
                });
            }
            self.top.push(header.block_ref());
        }

        // Reconcile the finality boundary.
        let advance = finalized.height - self.finalized_head.height;
        if advance > 0 {
            let idx = (advance - 1) as usize;
            match self.top.get(idx) {
                Some(entry) if entry.hash == finalized.hash => {
                    self.finalized_head = entry.clone();
                    self.top.drain(..=idx);
                }
                Some(entry) => {
                    return Err(IngestError::FinalizedHeadMismatch {
                        height: finalized.height,
                        upstream: finalized.hash,
                        known: entry.hash.clone(),
                    });
                }
                None => {
                    return Err(IngestError::FinalizedHeadMismatch {
                        height: finalized.height,
                        upstream: finalized.hash,
                        known: self.tip().hash.clone(),
                    });
                }
            }
            debug!(
                target: "hot_ingest",
                finalized = %self.finalized_head,
                top_len = self.top.len(),
                "advanced finalized head"
            );
        }

        Ok(new_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArchiveDataSource;
    use async_trait::async_trait;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };
    use trawler_types::{BatchResponse, BlockHeader, BlockRange};

    fn head(height: i64, hash: &str) -> HashAndHeight {
        HashAndHeight::new(height, hash)
    }

    struct ScriptedChain {
        heads: Mutex<VecDeque<(HashAndHeight, HashAndHeight)>>,
        current_best: Mutex<HashAndHeight>,
        blocks: HashMap<String, Block<u32>>,
    }

    impl ScriptedChain {
        fn new(
            heads: Vec<(HashAndHeight, HashAndHeight)>,
            blocks: Vec<Block<u32>>,
        ) -> Arc<Self> {
            let best = heads[0].1.clone();
            Arc::new(Self {
                heads: Mutex::new(heads.into()),
                current_best: Mutex::new(best),
                blocks: blocks.into_iter().map(|b| (b.header.hash.clone(), b)).collect(),
            })
        }
    }

    #[async_trait]
    impl ArchiveDataSource for ScriptedChain {
        type Request = ();
        type Item = u32;

        async fn get_finalized_batch(
            &self,
            _request: &BatchRequest<()>,
        ) -> Result<BatchResponse<u32>, IngestError> {
            unimplemented!("hot ingest never requests finalized batches")
        }

        async fn get_finalized_height(&self) -> Result<i64, IngestError> {
            Ok(self.current_best.lock().unwrap().height)
        }
    }

    #[async_trait]
    impl HotDataSource for ScriptedChain {
        async fn get_block(
            &self,
            hash: &str,
            _request: Option<&()>,
        ) -> Result<Block<u32>, IngestError> {
            self.blocks
                .get(hash)
                .cloned()
                .ok_or_else(|| IngestError::BlockNotFound { hash: hash.to_string() })
        }

        async fn get_block_hash(&self, height: i64) -> Result<String, IngestError> {
            self.blocks
                .values()
                .find(|b| b.header.height == height)
                .map(|b| b.header.hash.clone())
                .ok_or_else(|| IngestError::BlockNotFound { hash: format!("@{height}") })
        }

        async fn get_best_head(&self) -> Result<HashAndHeight, IngestError> {
            Ok(self.current_best.lock().unwrap().clone())
        }

        async fn get_finalized_head(&self) -> Result<HashAndHeight, IngestError> {
            let mut heads = self.heads.lock().unwrap();
            let (finalized, best) =
                if heads.len() > 1 { heads.pop_front().unwrap() } else { heads[0].clone() };
            *self.current_best.lock().unwrap() = best;
            Ok(finalized)
        }
    }

    fn block(height: i64, hash: &str, parent: &str) -> Block<u32> {
        Block::new(BlockHeader::new(height, hash, parent), vec![height as u32])
    }

    fn open_plan() -> Vec<BatchRequest<()>> {
        vec![BatchRequest { range: BlockRange::open(0), request: () }]
    }

    fn options() -> HotIngestOptions {
        HotIngestOptions { poll_interval: Duration::from_millis(2) }
    }

    #[tokio::test]
    async fn appends_new_blocks_above_known_top() {
        let chain = ScriptedChain::new(
            vec![(head(10, "h10"), head(14, "h14"))],
            vec![block(13, "h13", "h12"), block(14, "h14", "h13")],
        );
        let mut ingest = HotIngest::new(
            chain,
            head(10, "h10"),
            vec![head(11, "h11"), head(12, "h12")],
            open_plan(),
            options(),
        )
        .unwrap();

        let batch = ingest.next_batch().await.unwrap().unwrap();
        let heights: Vec<i64> = batch.data.blocks.iter().map(|b| b.header.height).collect();
        assert_eq!(heights, vec![13, 14]);
        assert_eq!(batch.base_head, head(12, "h12"));
        assert_eq!(batch.finalized_head, head(10, "h10"));
        assert_eq!(ingest.tip(), &head(14, "h14"));
    }

    #[tokio::test]
    async fn detects_fork_and_replaces_suffix() {
        // Persisted: finalized 10, top [11#h11, 12#h12]. The chain now
        // reports finalized 11#h11 and best 12#hX.
        let chain = ScriptedChain::new(
            vec![(head(11, "h11"), head(12, "hX"))],
            vec![block(12, "hX", "h11")],
        );
        let mut ingest = HotIngest::new(
            chain,
            head(10, "h10"),
            vec![head(11, "h11"), head(12, "h12")],
            open_plan(),
            options(),
        )
        .unwrap();

        let batch = ingest.next_batch().await.unwrap().unwrap();
        let heights: Vec<i64> = batch.data.blocks.iter().map(|b| b.header.height).collect();
        assert_eq!(heights, vec![12]);
        assert_eq!(batch.data.blocks[0].header.hash, "hX");
        assert_eq!(batch.base_head, head(11, "h11"));
        assert_eq!(batch.finalized_head, head(11, "h11"));

        assert_eq!(ingest.finalized_head, head(11, "h11"));
        assert_eq!(ingest.top, vec![head(12, "hX")]);
    }

    #[tokio::test]
    async fn tolerates_upstream_progress_loss() {
        // First poll regresses both heads (lagging provider); second poll
        // catches up. The regression must be a no-op, not a rollback.
        let chain = ScriptedChain::new(
            vec![
                (head(9, "h9"), head(11, "h11")),
                (head(10, "h10"), head(13, "h13")),
            ],
            vec![block(13, "h13", "h12")],
        );
        let mut ingest = HotIngest::new(
            chain,
            head(10, "h10"),
            vec![head(11, "h11"), head(12, "h12")],
            open_plan(),
            options(),
        )
        .unwrap();

        let batch = ingest.next_batch().await.unwrap().unwrap();
        let heights: Vec<i64> = batch.data.blocks.iter().map(|b| b.header.height).collect();
        assert_eq!(heights, vec![13], "regressed poll must not emit or roll back anything");
        assert_eq!(batch.base_head, head(12, "h12"));
    }

    #[tokio::test]
    async fn fork_below_finalized_is_fatal() {
        let chain = ScriptedChain::new(
            vec![(head(10, "h10"), head(10, "hZ"))],
            vec![block(10, "hZ", "h9")],
        );
        let mut ingest =
            HotIngest::new(chain, head(10, "h10"), Vec::new(), open_plan(), options()).unwrap();

        let err = ingest.next_batch().await.unwrap_err();
        assert!(matches!(err, IngestError::ForkBelowFinalized { .. }));
    }

    #[tokio::test]
    async fn finalized_fork_at_known_boundary_is_fatal() {
        // Upstream reports a different hash at the height we already hold
        // as finalized.
        let chain = ScriptedChain::new(
            vec![(head(10, "hY"), head(12, "h12"))],
            vec![block(13, "h13", "h12")],
        );
        let mut ingest = HotIngest::new(
            chain,
            head(10, "h10"),
            vec![head(11, "h11"), head(12, "h12")],
            open_plan(),
            options(),
        )
        .unwrap();

        let err = ingest.next_batch().await.unwrap_err();
        assert!(matches!(err, IngestError::FinalizedHeadMismatch { height: 10, .. }));
    }

    #[tokio::test]
    async fn ends_once_no_request_wants_unfinalized_heights() {
        let chain = ScriptedChain::new(vec![(head(12, "h12"), head(12, "h12"))], Vec::new());
        let requests = vec![BatchRequest { range: BlockRange::new(0, 12), request: () }];
        let mut ingest =
            HotIngest::new(chain, head(12, "h12"), Vec::new(), requests, options()).unwrap();

        assert!(ingest.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pruned_ancestor_is_fatal() {
        // Best head advertises a block the node no longer serves.
        let chain =
            ScriptedChain::new(vec![(head(10, "h10"), head(12, "h12"))], Vec::new());
        let mut ingest = HotIngest::new(
            chain,
            head(10, "h10"),
            vec![head(11, "h11")],
            open_plan(),
            options(),
        )
        .unwrap();

        let err = ingest.next_batch().await.unwrap_err();
        assert!(matches!(err, IngestError::BlockNotFound { .. }));
    }
}
