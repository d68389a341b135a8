//! Pulls blocks from a Bitcoin Core node over JSON-RPC and stores them in a
//! relational database, one height at a time.

pub mod config;
pub mod database;
pub mod models;
pub mod retry;
pub mod rpc;
pub mod scheduler;
pub mod snapshot;
pub mod sync;

pub use config::Config;
pub use database::{BlockStore, Persistence, SaveOutcome};
pub use rpc::{BitcoinRpc, ChainSource};
pub use scheduler::Scheduler;
pub use sync::{PassReport, SyncCoordinator};
