//! Persistent storage abstraction for the trawler pipeline.
//!
//! The pipeline drives a store through two atomic operations: committing a
//! finalized block range and committing hot (unfinalized) blocks with
//! precise, per-block undo. The [`Database`] trait is the seam; the
//! [`MemDatabase`] reference implementation carries the full protocol over
//! in-memory tables and backs the integration tests. Engine-specific
//! backends (SQL, KV) implement the same trait elsewhere.

mod error;
pub use error::StoreError;

mod state;
pub use state::{DatabaseState, FinalTxInfo, HotTxInfo};

mod database;
pub use database::{Database, HotTxHandler, TxHandler};

mod mem;
pub use mem::{MemDatabase, MemStore};
