//! Block ingestion for the trawler pipeline.
//!
//! Two ingestion strategies over the same data source abstraction:
//! [`ArchiveIngest`] paginates finalized history as an ordered,
//! backpressured sequence of block batches, while [`HotIngest`] follows a
//! live, possibly forking chain tip and reconciles reorgs against the last
//! known state.

mod source;
pub use source::{ArchiveDataSource, HotDataSource};

mod error;
pub use error::IngestError;

mod batch;
pub use batch::{DataBatch, HotBatch};

mod archive;
pub use archive::{ArchiveIngest, ArchiveIngestOptions, StopPredicate};

mod hot;
pub use hot::{HotIngest, HotIngestOptions};
