use std::fmt::Write as _;

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use bytes::Bytes;
use futures::SinkExt;
use tokio_postgres::{CopyInSink, NoTls, Transaction};
use tracing::debug;

use super::{csv_field, BlockStore, SaveOutcome, StoreError};
use crate::models::{is_bip30_duplicate, Block};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS block (
        hash VARCHAR(64) PRIMARY KEY,
        confirmations BIGINT NOT NULL,
        height BIGINT NOT NULL,
        version INT NOT NULL,
        version_hex VARCHAR(16) NOT NULL,
        merkle_root VARCHAR(64) NOT NULL,
        time BIGINT NOT NULL,
        median_time BIGINT NOT NULL,
        nonce BIGINT NOT NULL,
        bits VARCHAR(16) NOT NULL,
        difficulty DOUBLE PRECISION NOT NULL,
        chainwork VARCHAR(64) NOT NULL,
        tx_count BIGINT NOT NULL,
        previous_hash VARCHAR(64),
        next_hash VARCHAR(64),
        stripped_size BIGINT NOT NULL,
        size BIGINT NOT NULL,
        weight BIGINT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS block_height_idx ON block (height);

    CREATE TABLE IF NOT EXISTS transactions (
        txid VARCHAR(64) PRIMARY KEY,
        block_hash VARCHAR(64) NOT NULL REFERENCES block (hash),
        version INT NOT NULL,
        locktime BIGINT NOT NULL,
        size BIGINT NOT NULL,
        weight BIGINT NOT NULL,
        amount DOUBLE PRECISION NOT NULL,
        fee DOUBLE PRECISION NOT NULL
    );

    CREATE INDEX IF NOT EXISTS transactions_block_hash_idx ON transactions (block_hash);

    CREATE TABLE IF NOT EXISTS tx_input (
        id BIGSERIAL PRIMARY KEY,
        txid VARCHAR(64) NOT NULL REFERENCES transactions (txid) ON DELETE CASCADE,
        input_index INT NOT NULL,
        prev_txid VARCHAR(64),
        prev_vout BIGINT,
        script_sig TEXT,
        sequence BIGINT NOT NULL,
        UNIQUE (txid, input_index)
    );

    CREATE TABLE IF NOT EXISTS tx_output (
        id BIGSERIAL PRIMARY KEY,
        txid VARCHAR(64) NOT NULL REFERENCES transactions (txid) ON DELETE CASCADE,
        output_index INT NOT NULL,
        value DOUBLE PRECISION NOT NULL CHECK (value >= 0),
        script_pubkey TEXT NOT NULL,
        UNIQUE (txid, output_index)
    );
";

const INSERT_BLOCK: &str = "
    INSERT INTO block (
        hash, confirmations, height, version, version_hex, merkle_root,
        time, median_time, nonce, bits, difficulty, chainwork, tx_count,
        previous_hash, next_hash, stripped_size, size, weight
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
    ON CONFLICT (hash) DO NOTHING";

const INSERT_TRANSACTION: &str = "
    INSERT INTO transactions (txid, block_hash, version, locktime, size, weight, amount, fee)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (txid) DO NOTHING";

const COPY_INPUTS: &str =
    "COPY tx_input (txid, input_index, prev_txid, prev_vout, script_sig, sequence) FROM STDIN WITH (FORMAT csv)";

const COPY_OUTPUTS: &str =
    "COPY tx_output (txid, output_index, value, script_pubkey) FROM STDIN WITH (FORMAT csv)";

/// PostgreSQL backend on a `bb8` pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let config = database_url.parse::<tokio_postgres::Config>()?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder().build(manager).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// SQLSTATE class 23: integrity constraint violation.
fn is_constraint_violation(e: &tokio_postgres::Error) -> bool {
    e.code().is_some_and(|code| code.code().starts_with("23"))
}

fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{}: {}", db.message(), detail),
            None => db.message().to_string(),
        },
        None => e.to_string(),
    }
}

async fn copy_rows(
    transaction: &Transaction<'_>,
    statement: &str,
    rows: String,
) -> Result<u64, tokio_postgres::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut sink: std::pin::Pin<Box<CopyInSink<Bytes>>> = Box::pin(transaction.copy_in(statement).await?);
    sink.as_mut().send(Bytes::from(rows)).await?;
    sink.as_mut().finish().await
}

async fn write_block(transaction: &Transaction<'_>, block: &Block) -> Result<SaveOutcome, tokio_postgres::Error> {
    let inserted = transaction
        .execute(
            INSERT_BLOCK,
            &[
                &block.hash,
                &block.confirmations,
                &(block.height as i64),
                &block.version,
                &block.version_hex,
                &block.merkle_root,
                &block.time,
                &block.median_time(),
                &(block.nonce as i64),
                &block.bits,
                &block.difficulty,
                &block.chainwork,
                &(block.tx_count as i64),
                &block.previous_hash,
                &block.next_hash,
                &(block.stripped_size as i64),
                &(block.size as i64),
                &(block.weight as i64),
            ],
        )
        .await?;
    if inserted == 0 {
        return Ok(SaveOutcome::Duplicate);
    }

    let insert_tx = transaction.prepare(INSERT_TRANSACTION).await?;
    let mut input_rows = String::new();
    let mut output_rows = String::new();

    for tx in &block.transactions {
        let inserted = transaction
            .execute(
                &insert_tx,
                &[
                    &tx.txid,
                    &block.hash,
                    &tx.version,
                    &(tx.locktime as i64),
                    &(tx.size as i64),
                    &(tx.weight as i64),
                    &tx.amount(),
                    &tx.fee(),
                ],
            )
            .await?;
        if inserted == 0 {
            if is_bip30_duplicate(&tx.txid) {
                debug!(txid = %tx.txid, "skipping repeated BIP30 coinbase");
                continue;
            }
            return Ok(SaveOutcome::Rejected(format!(
                "transaction {} is already stored under another block",
                tx.txid
            )));
        }

        for (index, input) in tx.inputs.iter().enumerate() {
            let _ = writeln!(
                input_rows,
                "{},{},{},{},{},{}",
                csv_field(Some(&tx.txid)),
                index,
                csv_field(input.txid.as_deref()),
                input.vout.map(|v| v.to_string()).unwrap_or_default(),
                csv_field(input.script_sig_hex()),
                input.sequence,
            );
        }

        for output in &tx.outputs {
            let _ = writeln!(
                output_rows,
                "{},{},{},{}",
                csv_field(Some(&tx.txid)),
                output.n,
                output.value,
                csv_field(Some(&output.script_pub_key.hex)),
            );
        }
    }

    copy_rows(transaction, COPY_INPUTS, input_rows).await?;
    copy_rows(transaction, COPY_OUTPUTS, output_rows).await?;

    Ok(SaveOutcome::Committed)
}

#[async_trait]
impl BlockStore for PgStore {
    async fn setup_database(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        Ok(())
    }

    async fn max_height(&self) -> Result<Option<u64>, StoreError> {
        let conn = self.pool.get().await?;
        let row = conn.query_one("SELECT MAX(height) FROM block", &[]).await?;
        let max: Option<i64> = row.get(0);
        Ok(max.map(|h| h as u64))
    }

    async fn stored_heights(&self, from: u64, to: u64) -> Result<Vec<u64>, StoreError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT DISTINCT height FROM block WHERE height BETWEEN $1 AND $2 ORDER BY height",
                &[&(from as i64), &(to as i64)],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, i64>(0) as u64).collect())
    }

    async fn count_heights(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(DISTINCT height) FROM block WHERE height BETWEEN $1 AND $2",
                &[&(from as i64), &(to as i64)],
            )
            .await?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn block_count(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get().await?;
        let row = conn.query_one("SELECT COUNT(*) FROM block", &[]).await?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn save_block(&self, block: &Block) -> Result<SaveOutcome, StoreError> {
        let mut conn = self.pool.get().await?;
        let transaction = conn.transaction().await?;

        let outcome = match write_block(&transaction, block).await {
            Ok(outcome) => outcome,
            Err(e) if is_constraint_violation(&e) => SaveOutcome::Rejected(describe(&e)),
            Err(e) => return Err(e.into()),
        };

        if outcome == SaveOutcome::Committed {
            transaction.commit().await?;
        } else {
            transaction.rollback().await?;
        }
        Ok(outcome)
    }
}
