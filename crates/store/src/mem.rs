//! In-memory reference store.
//!
//! Carries the complete commit protocol, including per-height undo logs
//! for hot blocks, over plain maps guarded by a single mutex. Backs the
//! pipeline integration tests and serves as the executable description of
//! what engine-specific backends must do.

use crate::{
    Database, DatabaseState, FinalTxInfo, HotTxHandler, HotTxInfo, StoreError, TxHandler,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU32, Ordering},
};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use trawler_types::{GENESIS_PARENT_HASH, HashAndHeight, assert_chain_continuity};

/// How many times a transaction is re-run after a serialization conflict
/// before the conflict is surfaced.
const RETRY_LIMIT: u32 = 3;

/// A single recorded entity mutation, with enough of the previous state to
/// undo it.
#[derive(Debug, Clone)]
enum Change {
    Upsert { key: String, prev: Option<Value> },
    Remove { key: String, prev: Value },
}

/// The full persisted state: status row, hot-block markers, undo log and
/// entity data. Cloned wholesale at the start of a transaction so that a
/// failed callback leaves the committed state untouched.
#[derive(Debug, Clone)]
struct Tables {
    nonce: u64,
    height: i64,
    hash: String,
    hot_blocks: Vec<HashAndHeight>,
    change_log: BTreeMap<i64, Vec<Change>>,
    entities: BTreeMap<String, Value>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            nonce: 0,
            height: -1,
            hash: GENESIS_PARENT_HASH.to_string(),
            hot_blocks: Vec::new(),
            change_log: BTreeMap::new(),
            entities: BTreeMap::new(),
        }
    }
}

impl Tables {
    fn state(&self) -> DatabaseState {
        DatabaseState {
            nonce: self.nonce,
            height: self.height,
            hash: self.hash.clone(),
            top: self.hot_blocks.clone(),
        }
    }

    /// Undoes every mutation recorded for `height`, most recent first.
    fn revert_height(&mut self, height: i64) {
        let Some(changes) = self.change_log.remove(&height) else { return };
        for change in changes.into_iter().rev() {
            match change {
                Change::Upsert { key, prev: Some(value) } => {
                    self.entities.insert(key, value);
                }
                Change::Upsert { key, prev: None } => {
                    self.entities.remove(&key);
                }
                Change::Remove { key, prev } => {
                    self.entities.insert(key, prev);
                }
            }
        }
    }
}

/// Mutation handle passed to batch handlers.
///
/// While a hot block is being applied, every mutation is recorded against
/// that block's height so a later fork can undo it.
#[derive(Debug)]
pub struct MemStore {
    tables: Tables,
    tracked: Option<i64>,
}

impl MemStore {
    /// Inserts or replaces an entity.
    pub fn upsert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let prev = self.tables.entities.insert(key.clone(), value);
        if let Some(height) = self.tracked {
            self.tables.change_log.entry(height).or_default().push(Change::Upsert { key, prev });
        }
    }

    /// Removes an entity. A no-op if the key is absent.
    pub fn remove(&mut self, key: &str) {
        let Some(prev) = self.tables.entities.remove(key) else { return };
        if let Some(height) = self.tracked {
            self.tables
                .change_log
                .entry(height)
                .or_default()
                .push(Change::Remove { key: key.to_owned(), prev });
        }
    }

    /// Reads an entity.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.tables.entities.get(key)
    }
}

/// In-memory [`Database`] implementation.
pub struct MemDatabase {
    tables: Mutex<Tables>,
    supports_hot: bool,
    induced_conflicts: AtomicU32,
}

impl std::fmt::Debug for MemDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDatabase").field("supports_hot", &self.supports_hot).finish()
    }
}

impl MemDatabase {
    /// Creates a store with hot-block support.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            supports_hot: true,
            induced_conflicts: AtomicU32::new(0),
        }
    }

    /// Creates a store that only accepts finalized commits.
    pub fn final_only() -> Self {
        Self { supports_hot: false, ..Self::new() }
    }

    /// Makes the next `count` transaction attempts fail with a
    /// serialization conflict. Test hook for the retry path.
    pub fn induce_serialization_conflicts(&self, count: u32) {
        self.induced_conflicts.store(count, Ordering::Relaxed);
    }

    /// Snapshot of the persisted state.
    pub async fn state(&self) -> DatabaseState {
        self.tables.lock().await.state()
    }

    /// Reads a committed entity.
    pub async fn entity(&self, key: &str) -> Option<Value> {
        self.tables.lock().await.entities.get(key).cloned()
    }

    fn take_induced_conflict(&self) -> Result<(), StoreError> {
        if self
            .induced_conflicts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Serialization("induced write skew".to_owned()));
        }
        Ok(())
    }

    async fn transact_once(
        &self,
        info: &FinalTxInfo,
        cb: &mut TxHandler<'_, MemStore>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        self.take_induced_conflict()?;
        let nonce = tables.nonce;

        if tables.height != info.prev_head.height || tables.hash != info.prev_head.hash {
            return Err(StoreError::Conflict);
        }
        if info.next_head.height <= info.prev_head.height {
            return Err(StoreError::InvalidTransition {
                from: info.prev_head.clone(),
                to: info.next_head.clone(),
            });
        }

        let mut scratch = tables.clone();
        // A finalized commit supersedes any persisted hot suffix.
        let hot = std::mem::take(&mut scratch.hot_blocks);
        for block in hot.iter().rev() {
            scratch.revert_height(block.height);
        }
        scratch.change_log.clear();

        let mut store = MemStore { tables: scratch, tracked: None };
        cb(&mut store).await?;

        let mut scratch = store.tables;
        scratch.height = info.next_head.height;
        scratch.hash = info.next_head.hash.clone();
        scratch.nonce = nonce + 1;
        *tables = scratch;
        trace!(target: "mem_store", head = %info.next_head, "committed finalized range");
        Ok(())
    }

    async fn hot_update_once(
        &self,
        info: &HotTxInfo,
        cb: &mut HotTxHandler<'_, MemStore>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        self.take_induced_conflict()?;
        let nonce = tables.nonce;

        assert_chain_continuity(&info.base_head, &info.new_blocks)?;

        let mut chain = Vec::with_capacity(tables.hot_blocks.len() + 1);
        chain.push(HashAndHeight { height: tables.height, hash: tables.hash.clone() });
        chain.extend(tables.hot_blocks.iter().cloned());

        let new_head = info.new_blocks.last().unwrap_or(&info.base_head);
        if info.finalized_head.height > new_head.height {
            return Err(StoreError::FinalizedAboveHead {
                finalized: info.finalized_head.clone(),
                head: new_head.clone(),
            });
        }
        // Finality never regresses below the committed head.
        if info.finalized_head.height < chain[0].height {
            return Err(StoreError::Conflict);
        }
        let Some(base_pos) = chain.iter().position(|b| *b == info.base_head) else {
            return Err(StoreError::Conflict);
        };
        if info.new_blocks.is_empty() && base_pos + 1 != chain.len() {
            return Err(StoreError::Conflict);
        }

        let rollback_pos = base_pos + 1;
        let mut scratch = tables.clone();
        for block in chain[rollback_pos..].iter().rev() {
            debug!(target: "mem_store", block = %block, "rolling back hot block");
            scratch.revert_height(block.height);
        }
        scratch.hot_blocks.truncate(base_pos);

        let mut store = MemStore { tables: scratch, tracked: None };
        for block in &info.new_blocks {
            if block.height > info.finalized_head.height {
                store.tables.hot_blocks.push(block.clone());
                store.tracked = Some(block.height);
            } else {
                store.tracked = None;
            }
            cb(&mut store, block).await?;
        }
        let mut scratch = store.tables;

        let mut new_chain: Vec<&HashAndHeight> = chain[..rollback_pos].iter().collect();
        new_chain.extend(info.new_blocks.iter());
        let fpos = (info.finalized_head.height - new_chain[0].height) as usize;
        match new_chain.get(fpos) {
            Some(b) if b.hash == info.finalized_head.hash => {}
            _ => return Err(StoreError::Conflict),
        }
        if fpos > 0 {
            scratch.height = info.finalized_head.height;
            scratch.hash = info.finalized_head.hash.clone();
            scratch.hot_blocks.retain(|b| b.height > info.finalized_head.height);
            scratch.change_log = scratch.change_log.split_off(&(info.finalized_head.height + 1));
        }
        scratch.nonce = nonce + 1;
        *tables = scratch;
        trace!(
            target: "mem_store",
            finalized = %info.finalized_head,
            top = tables.hot_blocks.len(),
            "committed hot blocks"
        );
        Ok(())
    }
}

impl Default for MemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for MemDatabase {
    type Store = MemStore;

    fn supports_hot_blocks(&self) -> bool {
        self.supports_hot
    }

    async fn connect(&self) -> Result<DatabaseState, StoreError> {
        let state = self.tables.lock().await.state();
        state.assert_invariants()?;
        debug!(target: "mem_store", head = %state.head(), top = state.top.len(), "connected");
        Ok(state)
    }

    async fn transact(
        &self,
        info: FinalTxInfo,
        mut cb: TxHandler<'_, MemStore>,
    ) -> Result<(), StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.transact_once(&info, &mut cb).await {
                Err(StoreError::Serialization(msg)) if attempt < RETRY_LIMIT => {
                    attempt += 1;
                    warn!(
                        target: "mem_store",
                        %msg,
                        attempt,
                        "serialization conflict, retrying transaction"
                    );
                }
                result => return result,
            }
        }
    }

    async fn transact_hot(
        &self,
        info: HotTxInfo,
        mut cb: HotTxHandler<'_, MemStore>,
    ) -> Result<(), StoreError> {
        if !self.supports_hot {
            return Err(StoreError::HotBlocksUnsupported);
        }
        let mut attempt = 0u32;
        loop {
            match self.hot_update_once(&info, &mut cb).await {
                Err(StoreError::Serialization(msg)) if attempt < RETRY_LIMIT => {
                    attempt += 1;
                    warn!(
                        target: "mem_store",
                        %msg,
                        attempt,
                        "serialization conflict, retrying hot update"
                    );
                }
                result => return result,
            }
        }
    }
}
