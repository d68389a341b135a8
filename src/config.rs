use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc: RpcConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub username: String,
    pub password: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub snapshot_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub stop_on_fail: bool,
    pub backfill: bool,
    pub start_height: u64,
}

impl RpcConfig {
    pub fn endpoint(&self) -> String {
        let path = self.path.trim();
        if path.is_empty() || path.starts_with('/') {
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
        } else {
            format!("{}://{}:{}/{}", self.scheme, self.host, self.port, path)
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(300),
            cooldown: Duration::from_secs(600),
            stop_on_fail: false,
            backfill: true,
            start_height: 0,
        }
    }
}

impl Config {
    /// Load from the process environment, after merging a `.env` file if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let scheme = env.string("RPC_SCHEME", "http");
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::Invalid {
                key: "RPC_SCHEME",
                value: scheme,
                reason: "expected http or https".to_string(),
            });
        }

        let rpc = RpcConfig {
            username: env.string("RPC_USERNAME", ""),
            password: env.string("RPC_PASSWORD", ""),
            scheme,
            host: env.string("RPC_HOST", "127.0.0.1"),
            port: env.parse("RPC_PORT", 8332)?,
            path: env.string("RPC_PATH", ""),
            timeout: Duration::from_secs(env.parse("RPC_TIMEOUT_SECS", 10)?),
        };

        let store = StoreConfig {
            database_url: env.string("DATABASE_URL", "sqlite://blockchain.db"),
            snapshot_dir: PathBuf::from(env.string("SNAPSHOT_DIR", "blocks")),
        };

        let max_attempts: u32 = env.parse("SYNC_RETRY_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "SYNC_RETRY_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let sync = SyncConfig {
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_secs(env.parse("SYNC_BACKOFF_BASE_SECS", 10)?),
                backoff: env.parse("SYNC_BACKOFF", Backoff::Linear)?,
            },
            poll_interval: Duration::from_secs(env.parse("SYNC_POLL_INTERVAL_SECS", 300)?),
            cooldown: Duration::from_secs(env.parse("SYNC_COOLDOWN_SECS", 600)?),
            stop_on_fail: env.flag("SYNC_STOP_ON_FAIL", false)?,
            backfill: env.flag("SYNC_BACKFILL", true)?,
            start_height: env.parse("SYNC_START_HEIGHT", 0)?,
        };

        Ok(Self { rpc, store, sync })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }
}
