//! Batches emitted by the ingestion loops.

use std::time::Instant;
use trawler_types::{Block, ClosedRange, HashAndHeight};

/// A validated batch of contiguous blocks, annotated with fetch timings for
/// throughput accounting.
#[derive(Debug, Clone)]
pub struct DataBatch<I> {
    /// The range of heights this batch covers.
    pub range: ClosedRange,
    /// Blocks in ascending height order, no gaps.
    pub blocks: Vec<Block<I>>,
    /// The highest finalized chain height observed so far.
    pub chain_height: i64,
    /// When the fetch producing this batch started.
    pub fetch_start: Instant,
    /// When the fetch producing this batch completed.
    pub fetch_end: Instant,
}

impl<I> DataBatch<I> {
    /// Total number of decoded entities across all blocks.
    pub fn item_count(&self) -> usize {
        self.blocks.iter().map(|b| b.items.len()).sum()
    }
}

/// A batch of new blocks from the unfinalized suffix of a live chain.
#[derive(Debug, Clone)]
pub struct HotBatch<I> {
    /// The new ascending blocks plus fetch timings.
    pub data: DataBatch<I>,
    /// The finalized head after this poll, possibly advanced.
    pub finalized_head: HashAndHeight,
    /// The block the new suffix builds on: the parent of the first new
    /// block. Everything previously persisted above it must be rolled back.
    pub base_head: HashAndHeight,
}
