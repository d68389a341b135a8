use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode};
use tracing::debug;

use super::{BlockStore, SaveOutcome, StoreError};
use crate::models::{is_bip30_duplicate, Block};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS block (
        hash TEXT PRIMARY KEY,
        confirmations INTEGER NOT NULL,
        height INTEGER NOT NULL,
        version INTEGER NOT NULL,
        version_hex TEXT NOT NULL,
        merkle_root TEXT NOT NULL,
        time INTEGER NOT NULL,
        median_time INTEGER NOT NULL,
        nonce INTEGER NOT NULL,
        bits TEXT NOT NULL,
        difficulty REAL NOT NULL,
        chainwork TEXT NOT NULL,
        tx_count INTEGER NOT NULL,
        previous_hash TEXT,
        next_hash TEXT,
        stripped_size INTEGER NOT NULL,
        size INTEGER NOT NULL,
        weight INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS block_height_idx ON block (height);

    CREATE TABLE IF NOT EXISTS transactions (
        txid TEXT PRIMARY KEY,
        block_hash TEXT NOT NULL REFERENCES block (hash),
        version INTEGER NOT NULL,
        locktime INTEGER NOT NULL,
        size INTEGER NOT NULL,
        weight INTEGER NOT NULL,
        amount REAL NOT NULL,
        fee REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS transactions_block_hash_idx ON transactions (block_hash);

    CREATE TABLE IF NOT EXISTS tx_input (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        txid TEXT NOT NULL REFERENCES transactions (txid) ON DELETE CASCADE,
        input_index INTEGER NOT NULL,
        prev_txid TEXT,
        prev_vout INTEGER,
        script_sig TEXT,
        sequence INTEGER NOT NULL,
        UNIQUE (txid, input_index)
    );

    CREATE TABLE IF NOT EXISTS tx_output (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        txid TEXT NOT NULL REFERENCES transactions (txid) ON DELETE CASCADE,
        output_index INTEGER NOT NULL,
        value REAL NOT NULL CHECK (value >= 0),
        script_pubkey TEXT NOT NULL,
        UNIQUE (txid, output_index)
    );
";

const INSERT_BLOCK: &str = "
    INSERT INTO block (
        hash, confirmations, height, version, version_hex, merkle_root,
        time, median_time, nonce, bits, difficulty, chainwork, tx_count,
        previous_hash, next_hash, stripped_size, size, weight
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
    ON CONFLICT (hash) DO NOTHING";

const INSERT_TRANSACTION: &str = "
    INSERT INTO transactions (txid, block_hash, version, locktime, size, weight, amount, fee)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT (txid) DO NOTHING";

const INSERT_INPUT: &str = "
    INSERT INTO tx_input (txid, input_index, prev_txid, prev_vout, script_sig, sequence)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_OUTPUT: &str = "
    INSERT INTO tx_output (txid, output_index, value, script_pubkey)
    VALUES (?1, ?2, ?3, ?4)";

/// SQLite backend. One connection, used from blocking worker threads.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Worker(format!("cannot create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn configure(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Worker("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn save(conn: &mut Connection, block: &Block) -> Result<SaveOutcome, StoreError> {
    let tx = conn.transaction()?;
    let outcome = match insert_rows(&tx, block) {
        Ok(outcome) => outcome,
        Err(e) if is_constraint_violation(&e) => SaveOutcome::Rejected(e.to_string()),
        Err(e) => return Err(e.into()),
    };

    if outcome == SaveOutcome::Committed {
        tx.commit()?;
    } else {
        tx.rollback()?;
    }
    Ok(outcome)
}

fn insert_rows(tx: &rusqlite::Transaction<'_>, block: &Block) -> rusqlite::Result<SaveOutcome> {
    let inserted = tx.execute(
        INSERT_BLOCK,
        params![
            block.hash,
            block.confirmations,
            block.height as i64,
            block.version,
            block.version_hex,
            block.merkle_root,
            block.time,
            block.median_time(),
            block.nonce as i64,
            block.bits,
            block.difficulty,
            block.chainwork,
            block.tx_count as i64,
            block.previous_hash,
            block.next_hash,
            block.stripped_size as i64,
            block.size as i64,
            block.weight as i64,
        ],
    )?;
    if inserted == 0 {
        return Ok(SaveOutcome::Duplicate);
    }

    let mut insert_tx = tx.prepare_cached(INSERT_TRANSACTION)?;
    let mut insert_input = tx.prepare_cached(INSERT_INPUT)?;
    let mut insert_output = tx.prepare_cached(INSERT_OUTPUT)?;

    for transaction in &block.transactions {
        let inserted = insert_tx.execute(params![
            transaction.txid,
            block.hash,
            transaction.version,
            transaction.locktime as i64,
            transaction.size as i64,
            transaction.weight as i64,
            transaction.amount(),
            transaction.fee(),
        ])?;
        if inserted == 0 {
            if is_bip30_duplicate(&transaction.txid) {
                debug!(txid = %transaction.txid, "skipping repeated BIP30 coinbase");
                continue;
            }
            return Ok(SaveOutcome::Rejected(format!(
                "transaction {} is already stored under another block",
                transaction.txid
            )));
        }

        for (index, input) in transaction.inputs.iter().enumerate() {
            insert_input.execute(params![
                transaction.txid,
                index as i64,
                input.txid,
                input.vout.map(i64::from),
                input.script_sig_hex(),
                input.sequence as i64,
            ])?;
        }

        for output in &transaction.outputs {
            insert_output.execute(params![
                transaction.txid,
                output.n as i64,
                output.value,
                output.script_pub_key.hex,
            ])?;
        }
    }

    Ok(SaveOutcome::Committed)
}

#[async_trait]
impl BlockStore for SqliteStore {
    async fn setup_database(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| Ok(conn.execute_batch(SCHEMA)?)).await
    }

    async fn max_height(&self) -> Result<Option<u64>, StoreError> {
        self.with_conn(|conn| {
            let max: Option<i64> = conn.query_row("SELECT MAX(height) FROM block", [], |row| row.get(0))?;
            Ok(max.map(|h| h as u64))
        })
        .await
    }

    async fn stored_heights(&self, from: u64, to: u64) -> Result<Vec<u64>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT height FROM block WHERE height BETWEEN ?1 AND ?2 ORDER BY height",
            )?;
            let heights = stmt
                .query_map(params![from as i64, to as i64], |row| row.get::<_, i64>(0))?
                .map(|h| h.map(|h| h as u64))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(heights)
        })
        .await
    }

    async fn count_heights(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT height) FROM block WHERE height BETWEEN ?1 AND ?2",
                params![from as i64, to as i64],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn block_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM block", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn save_block(&self, block: &Block) -> Result<SaveOutcome, StoreError> {
        let block = block.clone();
        self.with_conn(move |conn| save(conn, &block)).await
    }
}
