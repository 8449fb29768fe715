//! Batch request and response shapes.

use crate::{Block, BlockRange, ClosedRange};
use serde::{Deserialize, Serialize};

/// One unit of the work plan: a scan range plus the opaque query parameters
/// (field selection, filters) a data source needs to serve it.
///
/// An ordered sequence of requests partitions the full scan into disjoint,
/// ascending, contiguous sub-ranges; only the last entry may be open-ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest<R> {
    /// The range of heights this request covers.
    pub range: BlockRange,
    /// Opaque query parameters, passed through to the data source.
    pub request: R,
}

/// A batch of blocks served by a data source.
///
/// The response may cover only a prefix of the requested range; the
/// remainder is fetched by a follow-up request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse<I> {
    /// The range of heights actually scanned.
    pub range: ClosedRange,
    /// Blocks in ascending height order, no gaps.
    pub blocks: Vec<Block<I>>,
    /// The data source's view of the finalized chain height.
    pub chain_height: i64,
}

/// Clips a work plan to heights `>= from`: exhausted requests are dropped
/// and the first surviving request is narrowed to start at `from`.
pub fn apply_range_bound<R: Clone>(requests: &[BatchRequest<R>], from: i64) -> Vec<BatchRequest<R>> {
    let mut left = Vec::new();
    for req in requests {
        if req.range.end() < from {
            continue;
        }
        let mut req = req.clone();
        req.range.from = req.range.from.max(from);
        left.push(req);
    }
    left
}
