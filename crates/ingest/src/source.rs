//! Data source capability traits.
//!
//! The pipeline core never speaks a wire protocol itself; it consumes
//! implementations of these traits. Query parameters carried by a
//! [`BatchRequest`] are opaque to the core, which only inspects ranges to
//! split work.

use crate::IngestError;
use async_trait::async_trait;
use trawler_types::{BatchRequest, BatchResponse, Block, HashAndHeight};

/// A source of finalized block history, e.g. an archival gateway.
#[async_trait]
pub trait ArchiveDataSource: Send + Sync {
    /// Opaque query parameters (field selection, filters).
    type Request: Clone + Send + Sync + 'static;
    /// Opaque decoded entity type carried by blocks.
    type Item: Send + 'static;

    /// Fetches a batch of finalized blocks for `request`.
    ///
    /// The response may cover only a prefix of the requested range.
    async fn get_finalized_batch(
        &self,
        request: &BatchRequest<Self::Request>,
    ) -> Result<BatchResponse<Self::Item>, IngestError>;

    /// The current finalized chain height as seen by this source.
    async fn get_finalized_height(&self) -> Result<i64, IngestError>;
}

/// A live chain node: everything an archive offers, plus access to the
/// unfinalized suffix of the chain.
#[async_trait]
pub trait HotDataSource: ArchiveDataSource {
    /// Fetches a single block by hash.
    ///
    /// Fails with [`IngestError::BlockNotFound`] if the node pruned it.
    async fn get_block(
        &self,
        hash: &str,
        request: Option<&Self::Request>,
    ) -> Result<Block<Self::Item>, IngestError>;

    /// Resolves the canonical block hash at `height`.
    async fn get_block_hash(&self, height: i64) -> Result<String, IngestError>;

    /// The current best (unfinalized) head of the chain.
    async fn get_best_head(&self) -> Result<HashAndHeight, IngestError>;

    /// The current finalized head of the chain.
    async fn get_finalized_head(&self) -> Result<HashAndHeight, IngestError>;
}
