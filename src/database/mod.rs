//! Relational storage for blocks, transactions, inputs and outputs.
//!
//! Two backends implement [`BlockStore`]: PostgreSQL through a `bb8` pool and
//! SQLite through `rusqlite`. [`Persistence`] wraps a backend together with
//! the raw snapshot directory and is what the sync coordinator talks to.

pub mod postgres;
pub mod sqlite;

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::models::{Block, FetchedBlock};
use crate::snapshot::SnapshotStore;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database worker failed: {0}")]
    Worker(String),
}

/// Result of [`BlockStore::save_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Block and all of its rows were written.
    Committed,
    /// A block with this hash was already stored; nothing was written.
    Duplicate,
    /// A constraint rejected the block; nothing was written.
    Rejected(String),
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Create tables and indexes if they do not exist yet.
    async fn setup_database(&self) -> Result<(), StoreError>;

    /// Highest stored height, `None` for an empty store.
    async fn max_height(&self) -> Result<Option<u64>, StoreError>;

    /// Stored heights within `from..=to`, ascending.
    async fn stored_heights(&self, from: u64, to: u64) -> Result<Vec<u64>, StoreError>;

    /// Number of distinct stored heights within `from..=to`.
    async fn count_heights(&self, from: u64, to: u64) -> Result<u64, StoreError>;

    async fn block_count(&self) -> Result<u64, StoreError>;

    /// Write the block and every transaction, input and output in one
    /// database transaction. Errors are reserved for failures where retrying
    /// may help (lost connection, pool timeout); constraint violations come
    /// back as [`SaveOutcome::Rejected`].
    async fn save_block(&self, block: &Block) -> Result<SaveOutcome, StoreError>;
}

/// Where `DATABASE_URL` points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    Postgres(String),
    Sqlite(PathBuf),
    SqliteMemory,
}

impl DatabaseUrl {
    pub fn parse(url: &str) -> Self {
        let url = url.trim();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return DatabaseUrl::Postgres(url.to_string());
        }
        let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")).unwrap_or(url);
        if path == ":memory:" {
            DatabaseUrl::SqliteMemory
        } else {
            DatabaseUrl::Sqlite(PathBuf::from(path))
        }
    }
}

pub struct Persistence<S> {
    store: S,
    snapshots: Option<SnapshotStore>,
}

impl<S: BlockStore> Persistence<S> {
    pub fn new(store: S, snapshots: Option<SnapshotStore>) -> Self {
        Self { store, snapshots }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn snapshots(&self) -> Option<&SnapshotStore> {
        self.snapshots.as_ref()
    }

    pub async fn max_height(&self) -> Result<Option<u64>, StoreError> {
        self.store.max_height().await
    }

    /// Heights in `from..=to` with no stored block. A full range is detected
    /// with a count, so the common no-gap case reads no height rows.
    pub async fn missing_heights(&self, from: u64, to: u64) -> Result<Vec<u64>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        if self.store.count_heights(from, to).await? == (to - from).saturating_add(1) {
            return Ok(Vec::new());
        }
        let stored = self.store.stored_heights(from, to).await?;
        let mut stored = stored.into_iter().peekable();
        let mut missing = Vec::new();
        for height in from..=to {
            while stored.next_if(|&h| h < height).is_some() {}
            if stored.next_if_eq(&height).is_none() {
                missing.push(height);
            }
        }
        Ok(missing)
    }

    /// Persist a fetched block, then write its raw snapshot. The snapshot is
    /// best-effort: a failure there is logged and the committed rows stay.
    pub async fn save_block(&self, fetched: &FetchedBlock) -> Result<SaveOutcome, StoreError> {
        let block = &fetched.block;
        let outcome = self.store.save_block(block).await?;

        match &outcome {
            SaveOutcome::Committed => {
                info!(height = block.height, hash = %block.hash, txs = block.transactions.len(), "block committed");
                if let Some(snapshots) = &self.snapshots {
                    match snapshots.write(block.height, &fetched.raw) {
                        Ok(path) => debug!(height = block.height, path = %path.display(), "snapshot written"),
                        Err(e) => warn!(height = block.height, error = %e, "snapshot write failed, relational rows kept"),
                    }
                }
            }
            SaveOutcome::Duplicate => {
                info!(height = block.height, hash = %block.hash, "block already stored, skipping insert");
            }
            SaveOutcome::Rejected(reason) => {
                warn!(height = block.height, hash = %block.hash, reason = %reason, "block rejected by store");
            }
        }

        Ok(outcome)
    }
}

/// Quote a text field for `COPY ... CSV`; `None` becomes an unquoted empty
/// field, which loads as NULL.
pub(crate) fn csv_field(value: Option<&str>) -> String {
    match value {
        Some(v) => format!("\"{}\"", v.replace('"', "\"\"")),
        None => String::new(),
    }
}
