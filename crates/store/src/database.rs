//! The database capability trait.

use crate::{DatabaseState, FinalTxInfo, HotTxInfo, StoreError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use trawler_types::HashAndHeight;

/// Callback writing entity data for a committed finalized range.
///
/// `FnMut` because a transaction may be re-run after a serialization
/// conflict.
pub type TxHandler<'a, S> =
    Box<dyn for<'s> FnMut(&'s mut S) -> BoxFuture<'s, Result<(), StoreError>> + Send + 'a>;

/// Callback writing entity data for a single hot block; invoked once per
/// new block, in ascending order.
pub type HotTxHandler<'a, S> = Box<
    dyn for<'s> FnMut(&'s mut S, &'s HashAndHeight) -> BoxFuture<'s, Result<(), StoreError>>
        + Send
        + 'a,
>;

/// A persistent store the pipeline can drive.
///
/// Hot-block support is a capability: stores that only ever hold finalized
/// data keep the default `supports_hot_blocks` / `transact_hot`, and the
/// runner will never hand them an unfinalized block.
#[async_trait]
pub trait Database: Send + Sync {
    /// The mutation handle passed to batch handlers.
    type Store: Send;

    /// Whether this store accepts unfinalized blocks.
    fn supports_hot_blocks(&self) -> bool {
        false
    }

    /// Reads the persisted state. Called once at startup.
    async fn connect(&self) -> Result<DatabaseState, StoreError>;

    /// Atomically commits a finalized block range.
    ///
    /// Rolls back any persisted hot suffix, lets `cb` write entity data
    /// for the range, then advances the persisted head to
    /// `info.next_head`. Fails with [`StoreError::Conflict`] if the
    /// persisted state does not match `info.prev_head` or the version
    /// token moved underneath the transaction.
    async fn transact(
        &self,
        info: FinalTxInfo,
        cb: TxHandler<'_, Self::Store>,
    ) -> Result<(), StoreError>;

    /// Atomically commits a batch of hot blocks.
    ///
    /// Rolls back persisted hot entries above `info.base_head` (undoing
    /// exactly the entity mutations recorded for each rolled-back height),
    /// applies the new blocks one `cb` invocation at a time while
    /// recording their mutations, then finalizes everything at or below
    /// `info.finalized_head`.
    async fn transact_hot(
        &self,
        info: HotTxInfo,
        cb: HotTxHandler<'_, Self::Store>,
    ) -> Result<(), StoreError> {
        let _ = (info, cb);
        Err(StoreError::HotBlocksUnsupported)
    }
}

#[async_trait]
impl<T: Database + ?Sized> Database for std::sync::Arc<T> {
    type Store = T::Store;

    fn supports_hot_blocks(&self) -> bool {
        (**self).supports_hot_blocks()
    }

    async fn connect(&self) -> Result<DatabaseState, StoreError> {
        (**self).connect().await
    }

    async fn transact(
        &self,
        info: FinalTxInfo,
        cb: TxHandler<'_, Self::Store>,
    ) -> Result<(), StoreError> {
        (**self).transact(info, cb).await
    }

    async fn transact_hot(
        &self,
        info: HotTxInfo,
        cb: HotTxHandler<'_, Self::Store>,
    ) -> Result<(), StoreError> {
        (**self).transact_hot(info, cb).await
    }
}
