//! End-to-end pipeline runs against a simulated chain and the in-memory
//! store.

use async_trait::async_trait;
use serde_json::json;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};
use trawler_ingest::{ArchiveDataSource, HotDataSource, IngestError};
use trawler_runner::{BatchHandler, Runner};
use trawler_store::{Database, HotTxHandler, HotTxInfo, MemDatabase, MemStore};
use trawler_types::{
    BatchRequest, BatchResponse, Block, BlockHeader, BlockRange, ClosedRange, HashAndHeight,
};

fn hash(height: i64) -> String {
    format!("h{height}")
}

fn head(height: i64, hash: &str) -> HashAndHeight {
    HashAndHeight::new(height, hash)
}

fn block(height: i64, hash: &str, parent: &str) -> Block<u32> {
    Block::new(BlockHeader::new(height, hash, parent), vec![height as u32])
}

fn canonical_chain(len: i64) -> Vec<Block<u32>> {
    (0..len)
        .map(|h| {
            let parent = if h == 0 { "0x".to_string() } else { hash(h - 1) };
            block(h, &hash(h), &parent)
        })
        .collect()
}

/// One scripted answer of the simulated chain, applied on the next
/// finalized-head poll. The last step repeats forever.
#[derive(Clone)]
struct ScriptStep {
    finalized: i64,
    best: HashAndHeight,
    /// A fork block that becomes canonical at its height with this step.
    promote: Option<Block<u32>>,
}

/// A chain simulator serving both as archive and live data source.
struct SimChain {
    canonical: Mutex<Vec<Block<u32>>>,
    extra: Mutex<HashMap<String, Block<u32>>>,
    finalized: AtomicI64,
    script: Mutex<VecDeque<ScriptStep>>,
    current_best: Mutex<HashAndHeight>,
    batch_limit: i64,
}

impl SimChain {
    fn new(blocks: Vec<Block<u32>>, finalized: i64) -> Self {
        let best = blocks
            .last()
            .map(|b| b.header.block_ref())
            .unwrap_or_else(HashAndHeight::genesis_parent);
        Self {
            canonical: Mutex::new(blocks),
            extra: Mutex::new(HashMap::new()),
            finalized: AtomicI64::new(finalized),
            script: Mutex::new(VecDeque::new()),
            current_best: Mutex::new(best),
            batch_limit: i64::MAX,
        }
    }

    fn with_batch_limit(mut self, limit: i64) -> Self {
        self.batch_limit = limit;
        self
    }

    fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        *self.script.lock().unwrap() = steps.into();
        self
    }

    fn add_fork_block(&self, block: Block<u32>) {
        self.extra.lock().unwrap().insert(block.header.hash.clone(), block);
    }

    fn step(&self) {
        let step = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 { script.pop_front() } else { script.front().cloned() }
        };
        let Some(step) = step else { return };
        if let Some(block) = step.promote {
            let mut canonical = self.canonical.lock().unwrap();
            let idx = block.header.height as usize;
            if idx < canonical.len() {
                canonical[idx] = block;
            } else {
                canonical.push(block);
            }
        }
        self.finalized.store(step.finalized, Ordering::SeqCst);
        *self.current_best.lock().unwrap() = step.best;
    }
}

#[async_trait]
impl ArchiveDataSource for SimChain {
    type Request = ();
    type Item = u32;

    async fn get_finalized_batch(
        &self,
        request: &BatchRequest<()>,
    ) -> Result<BatchResponse<u32>, IngestError> {
        let finalized = self.finalized.load(Ordering::SeqCst);
        let from = request.range.from;
        let to = request
            .range
            .end()
            .min(finalized)
            .min(from.saturating_add(self.batch_limit - 1));
        let canonical = self.canonical.lock().unwrap();
        let blocks = canonical[from as usize..=to as usize].to_vec();
        Ok(BatchResponse { range: ClosedRange::new(from, to), blocks, chain_height: finalized })
    }

    async fn get_finalized_height(&self) -> Result<i64, IngestError> {
        Ok(self.finalized.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl HotDataSource for SimChain {
    async fn get_block(
        &self,
        hash: &str,
        _request: Option<&()>,
    ) -> Result<Block<u32>, IngestError> {
        if let Some(block) = self.extra.lock().unwrap().get(hash) {
            return Ok(block.clone());
        }
        self.canonical
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.header.hash == hash)
            .cloned()
            .ok_or_else(|| IngestError::BlockNotFound { hash: hash.to_owned() })
    }

    async fn get_block_hash(&self, height: i64) -> Result<String, IngestError> {
        let canonical = self.canonical.lock().unwrap();
        canonical
            .get(height as usize)
            .map(|b| b.header.hash.clone())
            .ok_or_else(|| IngestError::BlockNotFound { hash: format!("@{height}") })
    }

    async fn get_best_head(&self) -> Result<HashAndHeight, IngestError> {
        Ok(self.current_best.lock().unwrap().clone())
    }

    async fn get_finalized_head(&self) -> Result<HashAndHeight, IngestError> {
        self.step();
        let finalized = self.finalized.load(Ordering::SeqCst);
        if finalized < 0 {
            return Ok(HashAndHeight::genesis_parent());
        }
        let canonical = self.canonical.lock().unwrap();
        Ok(canonical[finalized as usize].header.block_ref())
    }
}

/// Marks every delivered block with a `seen:<hash>` entity.
fn seen_handler() -> BatchHandler<MemStore, u32> {
    Arc::new(|store, batch| {
        Box::pin(async move {
            for block in &batch.blocks {
                store.upsert(format!("seen:{}", block.header.hash), json!(block.header.height));
            }
            Ok(())
        })
    })
}

#[tokio::test]
async fn archive_run_commits_all_batches() {
    let src = Arc::new(SimChain::new(canonical_chain(21), 20).with_batch_limit(8));
    let db = Arc::new(MemDatabase::new());
    let plan = vec![BatchRequest { range: BlockRange::new(0, 20), request: () }];

    Runner::new(db.clone(), plan)
        .with_archive(src)
        .with_prometheus_port(None)
        .run(seen_handler())
        .await
        .unwrap();

    let state = db.state().await;
    assert_eq!(state.height, 20);
    assert_eq!(state.hash, "h20");
    assert!(state.top.is_empty());
    // Pagination produced [0, 7], [8, 15], [16, 20].
    assert_eq!(state.nonce, 3);
    for h in 0..=20 {
        assert_eq!(db.entity(&format!("seen:h{h}")).await, Some(json!(h)));
    }
}

#[tokio::test]
async fn restart_with_exhausted_plan_is_a_noop() {
    let src = Arc::new(SimChain::new(canonical_chain(11), 10));
    let db = Arc::new(MemDatabase::new());
    let plan = vec![BatchRequest { range: BlockRange::new(0, 10), request: () }];

    Runner::new(db.clone(), plan.clone())
        .with_archive(src.clone())
        .with_prometheus_port(None)
        .run(seen_handler())
        .await
        .unwrap();
    let nonce = db.state().await.nonce;
    assert_eq!(db.state().await.height, 10);

    Runner::new(db.clone(), plan)
        .with_archive(src)
        .with_prometheus_port(None)
        .run(seen_handler())
        .await
        .unwrap();
    assert_eq!(db.state().await.nonce, nonce, "a restart with nothing to do must not commit");
}

#[tokio::test]
async fn resume_with_persisted_hot_suffix_refeeds_it_as_finalized() {
    // Blocks 0 and 1 were committed as hot blocks; by the time the
    // pipeline restarts, the archive has finalized past them. The first
    // finalized commit rolls the hot entities back, so the runner must
    // fetch those heights again rather than resume above the suffix.
    let db = Arc::new(MemDatabase::new());
    let seed = HotTxInfo {
        finalized_head: HashAndHeight::genesis_parent(),
        base_head: HashAndHeight::genesis_parent(),
        new_blocks: vec![head(0, "h0"), head(1, "h1")],
    };
    let cb: HotTxHandler<'_, MemStore> = Box::new(|store, block| {
        let block = block.clone();
        Box::pin(async move {
            store.upsert(format!("seen:{}", block.hash), json!(block.height));
            Ok(())
        })
    });
    db.transact_hot(seed, cb).await.unwrap();
    assert_eq!(db.state().await.top, vec![head(0, "h0"), head(1, "h1")]);

    let src = Arc::new(SimChain::new(canonical_chain(6), 5));
    let plan = vec![BatchRequest { range: BlockRange::new(0, 5), request: () }];
    Runner::new(db.clone(), plan)
        .with_archive(src)
        .with_prometheus_port(None)
        .run(seen_handler())
        .await
        .unwrap();

    let state = db.state().await;
    assert_eq!(state.height, 5);
    assert_eq!(state.hash, "h5");
    assert!(state.top.is_empty());
    // The seeding hot commit plus one finalized commit spanning [0, 5].
    assert_eq!(state.nonce, 2);
    for h in 0..=5 {
        assert_eq!(db.entity(&format!("seen:h{h}")).await, Some(json!(h)));
    }
}

#[tokio::test]
async fn archive_hands_off_to_chain_finalized_processing() {
    let blocks = canonical_chain(13);
    // The archive lags one block behind the chain's finality boundary.
    let archive = Arc::new(SimChain::new(blocks.clone(), 9));
    let chain = Arc::new(SimChain::new(blocks, 10));
    let db = Arc::new(MemDatabase::final_only());
    let plan = vec![BatchRequest { range: BlockRange::new(0, 10), request: () }];

    Runner::new(db.clone(), plan)
        .with_archive(archive)
        .with_hot(chain)
        .with_archive_poll_interval(Duration::from_millis(5))
        .with_hot_poll_interval(Duration::from_millis(5))
        .with_prometheus_port(None)
        .run(seen_handler())
        .await
        .unwrap();

    let state = db.state().await;
    assert_eq!(state.height, 10);
    assert_eq!(state.hash, "h10");
    // One archive commit [0, 9], one chain-finalized commit [10, 10].
    assert_eq!(state.nonce, 2);
    for h in 0..=10 {
        assert_eq!(db.entity(&format!("seen:h{h}")).await, Some(json!(h)));
    }
}

#[tokio::test]
async fn hot_phase_replays_a_fork_through_the_store() {
    let blocks = canonical_chain(13);
    let fork = block(12, "x12", "h11");

    let archive = Arc::new(SimChain::new(blocks.clone(), 9));
    let chain = Arc::new(SimChain::new(blocks, 10).with_script(vec![
        // Consumed by the archive handoff predicate.
        ScriptStep { finalized: 10, best: head(12, "h12"), promote: None },
        // First hot poll: two new blocks above the committed head.
        ScriptStep { finalized: 10, best: head(12, "h12"), promote: None },
        // Second hot poll: the chain switched to a fork at height 12.
        ScriptStep { finalized: 10, best: head(12, "x12"), promote: None },
        // Third hot poll: the fork got finalized; nothing left to want.
        ScriptStep { finalized: 12, best: head(12, "x12"), promote: Some(fork.clone()) },
    ]));
    chain.add_fork_block(fork);

    let db = Arc::new(MemDatabase::new());
    let plan = vec![BatchRequest { range: BlockRange::new(0, 12), request: () }];

    Runner::new(db.clone(), plan)
        .with_archive(archive)
        .with_hot(chain)
        .with_archive_poll_interval(Duration::from_millis(5))
        .with_hot_poll_interval(Duration::from_millis(5))
        .with_prometheus_port(None)
        .run(seen_handler())
        .await
        .unwrap();

    let state = db.state().await;
    assert_eq!(state.height, 10);
    assert_eq!(state.hash, "h10");
    assert_eq!(state.top, vec![head(11, "h11"), head(12, "x12")]);
    // Commits: archive [0, 9], chain-finalized [10, 10], hot {11, 12},
    // hot fork {x12}.
    assert_eq!(state.nonce, 4);

    // The replaced block's entity was rolled back, the fork's applied.
    assert_eq!(db.entity("seen:h12").await, None);
    assert_eq!(db.entity("seen:x12").await, Some(json!(12)));
    assert_eq!(db.entity("seen:h11").await, Some(json!(11)));
    assert_eq!(db.entity("seen:h9").await, Some(json!(9)));
}
