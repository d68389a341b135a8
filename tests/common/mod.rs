#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin_sync::config::SyncConfig;
use bitcoin_sync::database::{BlockStore, Persistence, SaveOutcome, SqliteStore, StoreError};
use bitcoin_sync::models::{Block, FetchedBlock};
use bitcoin_sync::retry::{Backoff, RetryPolicy};
use bitcoin_sync::rpc::{ChainSource, RpcError};
use bitcoin_sync::sync::SyncCoordinator;
use serde_json::{json, Value};

pub fn block_hash(height: u64) -> String {
    format!("{:064x}", height + 1)
}

fn height_of(hash: &str) -> Option<u64> {
    u64::from_str_radix(hash, 16).ok()?.checked_sub(1)
}

/// `getblock <hash> 2` for a block with one coinbase and one spend.
pub fn block_json(height: u64) -> Value {
    let previous = if height == 0 {
        Value::Null
    } else {
        json!(block_hash(height - 1))
    };
    json!({
        "hash": block_hash(height),
        "confirmations": 1,
        "height": height,
        "version": 536870912,
        "versionHex": "20000000",
        "merkleroot": format!("{:064x}", 0xbeef + height),
        "time": 1_600_000_000 + height as i64 * 600,
        "mediantime": 1_600_000_000 + height as i64 * 600 - 300,
        "nonce": 7,
        "bits": "1d00ffff",
        "difficulty": 1.0,
        "chainwork": format!("{:064x}", (height + 1) * 0x100010001),
        "nTx": 2,
        "previousblockhash": previous,
        "strippedsize": 300,
        "size": 400,
        "weight": 1300,
        "tx": [
            {
                "txid": format!("{:060x}aaaa", height),
                "version": 1,
                "locktime": 0,
                "size": 150,
                "weight": 600,
                "vin": [{ "coinbase": "04ffff001d0104", "sequence": 4294967295u32 }],
                "vout": [{ "value": 50.0, "n": 0, "scriptPubKey": { "hex": "76a914" } }]
            },
            {
                "txid": format!("{:060x}bbbb", height),
                "version": 2,
                "locktime": 0,
                "size": 200,
                "weight": 700,
                "fee": 0.001,
                "vin": [{
                    "txid": format!("{:064x}", 0xdead),
                    "vout": 0,
                    "scriptSig": { "asm": "", "hex": "4830" },
                    "sequence": 4294967294u32
                }],
                "vout": [
                    { "value": 1.5, "n": 0, "scriptPubKey": { "hex": "0014aa" } },
                    { "value": 0.25, "n": 1, "scriptPubKey": { "hex": "0014bb" } }
                ]
            }
        ]
    })
}

pub fn fetched(height: u64) -> FetchedBlock {
    let raw = block_json(height);
    let block: Block = serde_json::from_value(raw.clone()).expect("test block decodes");
    FetchedBlock { block, raw }
}

#[derive(Default)]
struct ChainState {
    height: u64,
    unreachable: bool,
    failures: HashMap<u64, u32>,
    requested: Vec<u64>,
    fetch_delay: Option<Duration>,
}

/// In-process stand-in for a node. Clones share state, so a test can keep a
/// handle after moving one into the coordinator.
#[derive(Clone, Default)]
pub struct FakeChain {
    state: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    pub fn with_height(height: u64) -> Self {
        let chain = Self::default();
        chain.set_height(height);
        chain
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Make the next `times` hash lookups for `height` fail.
    pub fn fail_height(&self, height: u64, times: u32) {
        self.state.lock().unwrap().failures.insert(height, times);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = Some(delay);
    }

    /// Heights passed to `get_block_hash`, in call order.
    pub fn requested(&self) -> Vec<u64> {
        self.state.lock().unwrap().requested.clone()
    }

    pub fn clear_requested(&self) {
        self.state.lock().unwrap().requested.clear();
    }

    fn unavailable(method: &str) -> RpcError {
        RpcError::Status {
            method: method.to_string(),
            status: 503,
            body: "node unavailable".to_string(),
        }
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn get_block_count(&self) -> Result<u64, RpcError> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(Self::unavailable("getblockcount"));
        }
        Ok(state.height)
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.requested.push(height);
            if state.unreachable {
                return Err(Self::unavailable("getblockhash"));
            }
            if let Some(left) = state.failures.get_mut(&height).filter(|left| **left > 0) {
                *left -= 1;
                return Err(Self::unavailable("getblockhash"));
            }
            if height > state.height {
                return Err(RpcError::Node {
                    method: "getblockhash".to_string(),
                    code: -8,
                    message: "Block height out of range".to_string(),
                });
            }
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(block_hash(height))
    }

    async fn get_block(&self, hash: &str) -> Result<FetchedBlock, RpcError> {
        if self.state.lock().unwrap().unreachable {
            return Err(Self::unavailable("getblock"));
        }
        let height = height_of(hash).ok_or_else(|| RpcError::Node {
            method: "getblock".to_string(),
            code: -5,
            message: "Block not found".to_string(),
        })?;
        Ok(fetched(height))
    }

    async fn get_best_block_hash(&self) -> Result<String, RpcError> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(Self::unavailable("getbestblockhash"));
        }
        Ok(block_hash(state.height))
    }
}

#[derive(Default)]
struct MemoryState {
    blocks: BTreeMap<u64, String>,
    save_failures: HashMap<u64, u32>,
    rejected: HashSet<u64>,
    height_rows_read: usize,
}

/// Block store kept in memory, with programmable save failures.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn fail_saves(&self, height: u64, times: u32) {
        self.state.lock().unwrap().save_failures.insert(height, times);
    }

    pub fn reject(&self, height: u64) {
        self.state.lock().unwrap().rejected.insert(height);
    }

    pub fn heights(&self) -> Vec<u64> {
        self.state.lock().unwrap().blocks.keys().copied().collect()
    }

    /// Total rows handed out by `stored_heights` so far.
    pub fn height_rows_read(&self) -> usize {
        self.state.lock().unwrap().height_rows_read
    }

    /// Store a block directly, bypassing the coordinator.
    pub fn insert(&self, height: u64) {
        self.state.lock().unwrap().blocks.insert(height, block_hash(height));
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn setup_database(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn max_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.state.lock().unwrap().blocks.keys().next_back().copied())
    }

    async fn stored_heights(&self, from: u64, to: u64) -> Result<Vec<u64>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let heights: Vec<u64> = state.blocks.range(from..=to).map(|(h, _)| *h).collect();
        state.height_rows_read += heights.len();
        Ok(heights)
    }

    async fn count_heights(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        Ok(self.state.lock().unwrap().blocks.range(from..=to).count() as u64)
    }

    async fn block_count(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().unwrap().blocks.len() as u64)
    }

    async fn save_block(&self, block: &Block) -> Result<SaveOutcome, StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(left) = state.save_failures.get_mut(&block.height).filter(|left| **left > 0) {
            *left -= 1;
            return Err(StoreError::Worker("connection reset".to_string()));
        }
        if state.rejected.contains(&block.height) {
            return Ok(SaveOutcome::Rejected("CHECK constraint failed".to_string()));
        }
        if state.blocks.values().any(|hash| *hash == block.hash) {
            return Ok(SaveOutcome::Duplicate);
        }
        state.blocks.insert(block.height, block.hash.clone());
        Ok(SaveOutcome::Committed)
    }
}

/// Sync settings with short, predictable delays.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            backoff: Backoff::Linear,
        },
        poll_interval: Duration::from_secs(300),
        cooldown: Duration::from_secs(600),
        stop_on_fail: false,
        backfill: true,
        start_height: 0,
    }
}

pub async fn sqlite_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().expect("open in-memory sqlite");
    store.setup_database().await.expect("schema");
    store
}

pub fn coordinator<S: BlockStore>(chain: &FakeChain, store: S, config: SyncConfig) -> SyncCoordinator<FakeChain, S> {
    SyncCoordinator::new(chain.clone(), Persistence::new(store, None), config)
}

/// Collects formatted log lines written on the current thread while the
/// returned guard is alive.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        let buf = self.buf.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}
