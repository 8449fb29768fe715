//! Store error taxonomy.

use thiserror::Error;
use trawler_types::{ContinuityError, HashAndHeight};

/// Errors produced by store transactions.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The status row was updated by a foreign process, or the persisted
    /// head no longer matches what the pipeline expects. Fatal: continuing
    /// would risk double-booking block ranges.
    #[error(
        "status row was updated by another process; \
         make sure no other indexer runs against this database"
    )]
    Conflict,

    /// Transient conflict reported by the underlying atomic-execution
    /// substrate under concurrent isolation. Retried a bounded number of
    /// times, then surfaced as fatal.
    #[error("database serialization conflict: {0}")]
    Serialization(String),

    /// A commit that does not advance the chain.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current persisted head.
        from: HashAndHeight,
        /// Requested next head.
        to: HashAndHeight,
    },

    /// The finalized head supplied with a hot commit sits above the new
    /// chain head.
    #[error("finalized head {finalized} is above the new chain head {head}")]
    FinalizedAboveHead {
        /// The supplied finalized head.
        finalized: HashAndHeight,
        /// The chain head after the commit.
        head: HashAndHeight,
    },

    /// Persisted chain state lost its continuity.
    #[error(transparent)]
    Continuity(#[from] ContinuityError),

    /// The store's block cursor diverged from the batch handed alongside
    /// it.
    #[error("store block cursor {cursor} does not match the batch block {block}")]
    CursorMismatch {
        /// The block reference the store is applying.
        cursor: HashAndHeight,
        /// The block found at that position in the batch.
        block: HashAndHeight,
    },

    /// This database was configured without hot-block support.
    #[error("hot blocks are not supported by this database")]
    HotBlocksUnsupported,

    /// The user-supplied batch handler failed.
    #[error("batch handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wraps an arbitrary failure from a batch handler.
    pub fn handler<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler(Box::new(err))
    }
}
