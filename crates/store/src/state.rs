//! Persisted pipeline state and transaction descriptors.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use trawler_types::{HashAndHeight, assert_chain_continuity};

/// The durable checkpoint of a pipeline run.
///
/// Read once at startup and mutated exclusively through the two store
/// transaction operations; a process restart resumes entirely from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseState {
    /// Version token for optimistic concurrency; bumped by every commit.
    pub nonce: u64,
    /// Last committed finalized height, `-1` if none.
    pub height: i64,
    /// Hash of the last committed finalized block.
    pub hash: String,
    /// The persisted unfinalized suffix, contiguous and chained from
    /// `height + 1` upward.
    pub top: Vec<HashAndHeight>,
}

impl DatabaseState {
    /// The finalized head as a block reference.
    pub fn head(&self) -> HashAndHeight {
        HashAndHeight { height: self.height, hash: self.hash.clone() }
    }

    /// Checks that `top` forms a contiguous chain right above the
    /// finalized head.
    pub fn assert_invariants(&self) -> Result<(), StoreError> {
        assert_chain_continuity(&self.head(), &self.top)?;
        Ok(())
    }
}

/// Descriptor of a finalized-range commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalTxInfo {
    /// The head the store must currently be at.
    pub prev_head: HashAndHeight,
    /// The head the store advances to.
    pub next_head: HashAndHeight,
    /// Whether the committed range reaches the chain tip.
    pub is_on_top: bool,
}

/// Descriptor of a hot-block commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotTxInfo {
    /// The finalized head after this commit; persisted hot entries at or
    /// below it become final.
    pub finalized_head: HashAndHeight,
    /// The block the new suffix builds on; persisted hot entries above it
    /// are rolled back.
    pub base_head: HashAndHeight,
    /// References of the new blocks, ascending and chained from
    /// `base_head`.
    pub new_blocks: Vec<HashAndHeight>,
}
