//! Height-ordered block sync.
//!
//! A pass reads the chain height and the stored frontier, optionally revisits
//! gaps below the frontier, then walks every missing height in increasing
//! order. Each height goes through
//! `Pending -> Fetching -> Persisting -> Committed`; a failed attempt loops
//! back to `Fetching` until the retry policy gives up, at which point the
//! height is `Skipped` or the pass is aborted.
//!
//! A shutdown signal is checked before each height, so a long catch-up pass
//! stops at the next height boundary. Every committed block is already
//! durable at that point and the next pass resumes from the frontier.

use std::collections::BTreeSet;
use std::fmt;

use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::database::{BlockStore, Persistence, SaveOutcome, StoreError};
use crate::rpc::{ChainSource, RpcError};

const PROGRESS_EVERY: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("cannot read chain height: {0}")]
    ChainHeight(#[source] RpcError),

    #[error("cannot read stored frontier: {0}")]
    Frontier(#[source] StoreError),

    #[error("best block sync gave up after {attempts} attempts: {last_error}")]
    BestBlock { attempts: u32, last_error: String },
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("node returned block at height {actual} for height {expected}")]
    HeightMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightState {
    Pending,
    Fetching,
    Persisting,
    Committed,
    Failed { attempt: u32 },
    Skipped,
}

impl fmt::Display for HeightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeightState::Pending => write!(f, "pending"),
            HeightState::Fetching => write!(f, "fetching"),
            HeightState::Persisting => write!(f, "persisting"),
            HeightState::Committed => write!(f, "committed"),
            HeightState::Failed { attempt } => write!(f, "failed({attempt})"),
            HeightState::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeightOutcome {
    Committed,
    /// The block was already stored, e.g. written by an earlier run.
    AlreadyStored,
    /// The store refused the block; no retries are made.
    Rejected(String),
    /// Every attempt failed.
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeightReport {
    pub height: u64,
    pub attempts: u32,
    pub outcome: HeightOutcome,
}

impl HeightReport {
    /// Final state in terms of the per-height state machine.
    pub fn state(&self) -> HeightState {
        match self.outcome {
            HeightOutcome::Committed | HeightOutcome::AlreadyStored => HeightState::Committed,
            HeightOutcome::Rejected(_) | HeightOutcome::Skipped(_) => HeightState::Skipped,
        }
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// Nothing to do.
    UpToDate,
    /// Every height in range reached a final state.
    Completed,
    /// Stopped at this height because it exhausted its retries.
    Aborted { height: u64 },
    /// Shutdown was requested; this height was not started.
    Interrupted { height: u64 },
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub chain_height: u64,
    pub start_frontier: Option<u64>,
    pub status: PassStatus,
    pub heights: Vec<HeightReport>,
}

impl PassReport {
    fn heights_where(&self, pred: impl Fn(&HeightOutcome) -> bool) -> Vec<u64> {
        self.heights
            .iter()
            .filter(|r| pred(&r.outcome))
            .map(|r| r.height)
            .collect()
    }

    pub fn committed(&self) -> Vec<u64> {
        self.heights_where(|o| matches!(o, HeightOutcome::Committed))
    }

    pub fn skipped(&self) -> Vec<u64> {
        self.heights_where(|o| matches!(o, HeightOutcome::Skipped(_) | HeightOutcome::Rejected(_)))
    }

    pub fn get(&self, height: u64) -> Option<&HeightReport> {
        self.heights.iter().find(|r| r.height == height)
    }
}

pub struct SyncCoordinator<C, S> {
    chain: C,
    persistence: Persistence<S>,
    config: SyncConfig,
    shutdown: Option<watch::Receiver<bool>>,
    /// Heights the store refused during this process. Backfill leaves them
    /// alone until restart.
    rejected: BTreeSet<u64>,
}

impl<C: ChainSource, S: BlockStore> SyncCoordinator<C, S> {
    pub fn new(chain: C, persistence: Persistence<S>, config: SyncConfig) -> Self {
        Self {
            chain,
            persistence,
            config,
            shutdown: None,
            rejected: BTreeSet::new(),
        }
    }

    /// Stop passes at the next height once `shutdown` carries `true`.
    pub fn set_shutdown(&mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Heights rejected by the store since this coordinator was created.
    pub fn rejected_heights(&self) -> &BTreeSet<u64> {
        &self.rejected
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn persistence(&self) -> &Persistence<S> {
        &self.persistence
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one sync pass. Taking `&mut self` keeps passes on one coordinator
    /// from overlapping.
    pub async fn run_pass(&mut self) -> Result<PassReport, SyncError> {
        let chain_height = self
            .chain
            .get_block_count()
            .await
            .map_err(SyncError::ChainHeight)?;
        let frontier = self
            .persistence
            .max_height()
            .await
            .map_err(SyncError::Frontier)?;

        let mut report = PassReport {
            chain_height,
            start_frontier: frontier,
            status: PassStatus::Completed,
            heights: Vec::new(),
        };

        if self.config.backfill {
            if let Some(top) = frontier {
                let mut gaps = self
                    .persistence
                    .missing_heights(self.config.start_height, top.min(chain_height))
                    .await
                    .map_err(SyncError::Frontier)?;
                let before = gaps.len();
                gaps.retain(|h| !self.rejected.contains(h));
                if gaps.len() < before {
                    debug!(count = before - gaps.len(), "leaving rejected heights out of backfill");
                }
                if !gaps.is_empty() {
                    info!(count = gaps.len(), first = gaps[0], "backfilling heights below frontier");
                }
                for height in gaps {
                    if self.record(&mut report, height).await {
                        return Ok(report);
                    }
                }
            }
        }

        let next = frontier.map_or(self.config.start_height, |h| h + 1);
        if next > chain_height {
            if report.heights.is_empty() {
                info!(chain_height, frontier = ?frontier, "all blocks are up to date");
                report.status = PassStatus::UpToDate;
            }
            return Ok(report);
        }

        info!(from = next, to = chain_height, "syncing blocks");
        for height in next..=chain_height {
            if self.record(&mut report, height).await {
                return Ok(report);
            }
            if height % PROGRESS_EVERY == 0 {
                info!(height, chain_height, "progress");
            }
        }

        info!(
            committed = report.committed().len(),
            skipped = report.skipped().len(),
            chain_height,
            "sync pass finished"
        );
        Ok(report)
    }

    /// Fetch and persist the node's current best block, independent of the
    /// frontier. Takes `&mut self` for the same reason as `run_pass`; the
    /// retry closure only needs a shared borrow.
    pub async fn sync_best_block(&mut self) -> Result<HeightReport, SyncError> {
        let this: &Self = self;
        let result = this
            .config
            .retry
            .run(move |_| async move {
                let hash = this.chain.get_best_block_hash().await?;
                let fetched = this.chain.get_block(&hash).await?;
                let outcome = this.persistence.save_block(&fetched).await?;
                Ok::<_, AttemptError>((fetched.block.height, outcome))
            })
            .await;

        match result {
            Ok(((height, outcome), attempts)) => Ok(HeightReport {
                height,
                attempts,
                outcome: outcome.into(),
            }),
            Err(exhausted) => Err(SyncError::BestBlock {
                attempts: exhausted.attempts,
                last_error: exhausted.last_error.to_string(),
            }),
        }
    }

    /// Sync one height and append its report. Returns true when the pass
    /// must stop here.
    async fn record(&mut self, report: &mut PassReport, height: u64) -> bool {
        if self.shutdown_requested() {
            info!(height, "shutdown requested, stopping pass");
            report.status = PassStatus::Interrupted { height };
            return true;
        }

        let result = self.sync_height(height).await;
        let exhausted = matches!(result.outcome, HeightOutcome::Skipped(_));
        if let HeightOutcome::Rejected(_) = result.outcome {
            self.rejected.insert(height);
        }
        report.heights.push(result);

        if exhausted && self.config.stop_on_fail {
            warn!(height, "stopping pass: stop on failure is set");
            report.status = PassStatus::Aborted { height };
            return true;
        }
        false
    }

    async fn sync_height(&self, height: u64) -> HeightReport {
        let span = info_span!("height", height);
        async move {
            debug!(state = %HeightState::Pending);
            let result = self
                .config
                .retry
                .run(move |attempt| self.fetch_and_persist(height, attempt))
                .await;

            match result {
                Ok((outcome, attempts)) => {
                    let outcome = HeightOutcome::from(outcome);
                    if let HeightOutcome::Rejected(reason) = &outcome {
                        warn!(state = %HeightState::Skipped, reason = %reason, "block rejected by store, skipping height");
                    } else {
                        debug!(state = %HeightState::Committed, attempts);
                    }
                    HeightReport {
                        height,
                        attempts,
                        outcome,
                    }
                }
                Err(exhausted) => {
                    warn!(
                        state = %HeightState::Skipped,
                        attempts = exhausted.attempts,
                        error = %exhausted.last_error,
                        "max retries reached, skipping height"
                    );
                    HeightReport {
                        height,
                        attempts: exhausted.attempts,
                        outcome: HeightOutcome::Skipped(exhausted.last_error.to_string()),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_and_persist(&self, height: u64, attempt: u32) -> Result<SaveOutcome, AttemptError> {
        if attempt > 1 {
            debug!(state = %HeightState::Failed { attempt: attempt - 1 }, "retrying");
        }
        debug!(state = %HeightState::Fetching, attempt);
        let hash = self.chain.get_block_hash(height).await?;
        let fetched = self.chain.get_block(&hash).await?;
        if fetched.block.height != height {
            return Err(AttemptError::HeightMismatch {
                expected: height,
                actual: fetched.block.height,
            });
        }

        debug!(state = %HeightState::Persisting, hash = %hash);
        Ok(self.persistence.save_block(&fetched).await?)
    }
}

impl From<SaveOutcome> for HeightOutcome {
    fn from(outcome: SaveOutcome) -> Self {
        match outcome {
            SaveOutcome::Committed => HeightOutcome::Committed,
            SaveOutcome::Duplicate => HeightOutcome::AlreadyStored,
            SaveOutcome::Rejected(reason) => HeightOutcome::Rejected(reason),
        }
    }
}
