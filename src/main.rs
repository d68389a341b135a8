use std::path::PathBuf;

use anyhow::{Context, Result};
use bitcoin_sync::config::Config;
use bitcoin_sync::database::{BlockStore, DatabaseUrl, Persistence, PgStore, SqliteStore};
use bitcoin_sync::rpc::BitcoinRpc;
use bitcoin_sync::scheduler::Scheduler;
use bitcoin_sync::snapshot::SnapshotStore;
use bitcoin_sync::sync::{PassStatus, SyncCoordinator};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "bitcoin-sync", version)]
#[command(about = "Sync Bitcoin blocks from a node into a relational database", long_about = None)]
struct Cli {
    /// Overrides DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    /// Overrides SNAPSHOT_DIR
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Do not write raw block snapshots
    #[arg(long, default_value = "false")]
    no_snapshots: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Keep syncing until interrupted (default)
    Run,
    /// Run a single sync pass and exit
    Once,
    /// Store the node's current best block and exit
    Tip,
    /// Create the database schema and exit
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(url) = cli.database_url {
        config.store.database_url = url;
    }
    if let Some(dir) = cli.snapshot_dir {
        config.store.snapshot_dir = dir;
    }
    let snapshots = (!cli.no_snapshots).then(|| SnapshotStore::new(config.store.snapshot_dir.clone()));
    let command = cli.command.unwrap_or(Commands::Run);

    match DatabaseUrl::parse(&config.store.database_url) {
        DatabaseUrl::Postgres(url) => {
            info!("connecting to postgres");
            let store = PgStore::connect(&url)
                .await
                .context("failed to connect to postgres")?;
            execute(command, config, store, snapshots).await
        }
        DatabaseUrl::Sqlite(path) => {
            info!(path = %path.display(), "opening sqlite database");
            let store = SqliteStore::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            execute(command, config, store, snapshots).await
        }
        DatabaseUrl::SqliteMemory => {
            warn!("using an in-memory database, nothing survives this process");
            let store = SqliteStore::open_in_memory().context("failed to open in-memory sqlite")?;
            execute(command, config, store, snapshots).await
        }
    }
}

async fn execute<S: BlockStore>(
    command: Commands,
    config: Config,
    store: S,
    snapshots: Option<SnapshotStore>,
) -> Result<()> {
    store
        .setup_database()
        .await
        .context("failed to set up database schema")?;
    info!("database schema ready");

    if let Commands::Init = command {
        return Ok(());
    }

    let rpc = BitcoinRpc::new(&config.rpc).context("failed to build RPC client")?;
    info!(endpoint = rpc.endpoint(), "using node");
    let mut coordinator = SyncCoordinator::new(rpc, Persistence::new(store, snapshots), config.sync);

    match command {
        Commands::Init => Ok(()),
        Commands::Once => {
            let report = coordinator.run_pass().await.context("sync pass failed")?;
            info!(
                status = ?report.status,
                committed = report.committed().len(),
                skipped = ?report.skipped(),
                "sync pass done"
            );
            if let PassStatus::Aborted { height } = report.status {
                anyhow::bail!("sync pass aborted at height {height}");
            }
            Ok(())
        }
        Commands::Tip => {
            let report = coordinator
                .sync_best_block()
                .await
                .context("failed to sync best block")?;
            info!(height = report.height, outcome = ?report.outcome, "best block synced");
            Ok(())
        }
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("shutdown requested, stopping after the current block");
                        let _ = shutdown_tx.send(true);
                    }
                    Err(e) => {
                        error!(error = %e, "cannot listen for ctrl-c");
                        // Keep the sender alive so the scheduler is not stopped.
                        std::future::pending::<()>().await;
                    }
                }
            });

            let passes = Scheduler::new(coordinator).run(shutdown_rx).await;
            info!(passes, "exiting");
            Ok(())
        }
    }
}
