use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::database::BlockStore;
use crate::rpc::ChainSource;
use crate::sync::{PassReport, PassStatus, SyncCoordinator, SyncError};

/// Runs sync passes back to back until told to stop.
///
/// After a pass that committed blocks the next one starts right away. An
/// up-to-date or aborted pass waits `poll_interval`; a failed pass waits
/// `cooldown`.
pub struct Scheduler<C, S> {
    coordinator: SyncCoordinator<C, S>,
    poll_interval: Duration,
    cooldown: Duration,
}

impl<C: ChainSource, S: BlockStore> Scheduler<C, S> {
    pub fn new(coordinator: SyncCoordinator<C, S>) -> Self {
        let poll_interval = coordinator.config().poll_interval;
        let cooldown = coordinator.config().cooldown;
        Self {
            coordinator,
            poll_interval,
            cooldown,
        }
    }

    pub fn coordinator(&self) -> &SyncCoordinator<C, S> {
        &self.coordinator
    }

    pub fn into_coordinator(self) -> SyncCoordinator<C, S> {
        self.coordinator
    }

    /// How long to wait before the next pass.
    pub fn wait_after(&self, result: &Result<PassReport, SyncError>) -> Duration {
        match result {
            Ok(report) => match report.status {
                PassStatus::Completed if !report.committed().is_empty() => Duration::ZERO,
                _ => self.poll_interval,
            },
            Err(_) => self.cooldown,
        }
    }

    /// Run a single pass and return the wait before the next one.
    pub async fn run_once(&mut self) -> Duration {
        let result = self.coordinator.run_pass().await;
        match &result {
            Ok(report) => info!(
                status = ?report.status,
                chain_height = report.chain_height,
                committed = report.committed().len(),
                skipped = report.skipped().len(),
                "pass done"
            ),
            Err(e) => error!(error = %e, cooldown = ?self.cooldown, "sync pass failed"),
        }
        self.wait_after(&result)
    }

    /// Loop until `shutdown` carries `true` or its sender is dropped. A pass
    /// in progress stops before its next height. Returns the number of
    /// passes run.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        self.coordinator.set_shutdown(shutdown.clone());
        let mut passes = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = self.run_once().await;
            passes += 1;
            if *shutdown.borrow() {
                break;
            }
            if wait.is_zero() {
                continue;
            }

            info!(wait = ?wait, "waiting before next pass");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(passes, "scheduler stopped");
        passes
    }
}
