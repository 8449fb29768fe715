//! Ingestion error taxonomy.

use thiserror::Error;
use trawler_types::{ClosedRange, ContinuityError, HashAndHeight};

/// Errors produced while fetching or validating chain data.
///
/// Consistency variants indicate a misbehaving or inconsistent data source
/// and are always fatal; they are never patched over.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Network or upstream failure reported by the data source. The core
    /// does not retry these; an outer supervisor restarts the run, which is
    /// safe because no partial state has been persisted.
    #[error("transient data source failure: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The chain no longer serves a block that hot reconciliation needs,
    /// typically because the node pruned it.
    #[error("block {hash} was not found on the chain")]
    BlockNotFound {
        /// Hash of the missing block.
        hash: String,
    },

    /// A batch response violated the bounds of the request that produced
    /// it.
    #[error(
        "invalid batch response for request starting at {requested_from}: \
         got [{}, {}] with chain height {chain_height}", got.from, got.to
    )]
    ResponseOutOfBounds {
        /// The `from` height of the request.
        requested_from: i64,
        /// The range claimed by the response.
        got: ClosedRange,
        /// The chain height claimed by the response.
        chain_height: i64,
    },

    /// A block fell outside the range its response claimed to cover.
    #[error("block at height {height} is outside of the scanned range [{}, {}]", range.from, range.to)]
    BlockOutOfRange {
        /// Height of the offending block.
        height: i64,
        /// The range claimed by the response.
        range: ClosedRange,
    },

    /// Two chain-adjacent blocks do not link by parent hash.
    #[error("chain continuity violated at {at}: parent hash {parent_hash} does not match {prev}")]
    ParentHashMismatch {
        /// The block whose parent pointer is wrong.
        at: HashAndHeight,
        /// The parent hash it carries.
        parent_hash: String,
        /// The block it should descend from.
        prev: HashAndHeight,
    },

    /// A height gap where a contiguous chain was required.
    #[error(transparent)]
    Continuity(#[from] ContinuityError),

    /// The chain reported a finalized head above its best head.
    #[error("finalized head {finalized} is above the best head {best}")]
    FinalityAboveBest {
        /// Reported finalized head.
        finalized: HashAndHeight,
        /// Reported best head.
        best: HashAndHeight,
    },

    /// An ancestor walk descended to the finalized boundary without finding
    /// a common block. Finalized history must never fork.
    #[error("chain forked at or below the finalized head {finalized}")]
    ForkBelowFinalized {
        /// The finalized head the walk ran into.
        finalized: HashAndHeight,
    },

    /// The advancing finalized head does not belong to the known chain.
    #[error("finalized head mismatch at height {height}: upstream reports {upstream}, known chain has {known}")]
    FinalizedHeadMismatch {
        /// Height of the new finalized head.
        height: i64,
        /// Hash reported by the chain.
        upstream: String,
        /// Hash recorded in the known suffix.
        known: String,
    },
}

impl IngestError {
    /// Wraps an arbitrary upstream failure as a transient fetch error.
    pub fn transient<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transient(Box::new(err))
    }
}
