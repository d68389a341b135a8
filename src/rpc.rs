//! JSON-RPC client for a Bitcoin Core compatible node.
//!
//! The client does not retry. Every failure is reported as an [`RpcError`]
//! and the sync coordinator decides what to do with it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::RpcConfig;
use crate::models::{Block, FetchedBlock};

/// `getblock` verbosity that embeds decoded transactions.
const VERBOSITY_FULL: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{method}: transport error: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method}: HTTP {status}: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },

    #[error("{method}: node error {code}: {message}")]
    Node {
        method: String,
        code: i64,
        message: String,
    },

    #[error("{method}: response has no result")]
    MissingResult { method: String },

    #[error("{method}: unexpected result: {reason}")]
    Malformed { method: String, reason: String },
}

/// Read access to the chain, as needed by the sync coordinator.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn get_block_count(&self) -> Result<u64, RpcError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError>;

    async fn get_block(&self, hash: &str) -> Result<FetchedBlock, RpcError>;

    async fn get_best_block_hash(&self) -> Result<String, RpcError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<NodeError>,
}

#[derive(Deserialize)]
struct NodeError {
    code: i64,
    message: String,
}

pub struct BitcoinRpc {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
    next_id: AtomicU64,
}

impl BitcoinRpc {
    pub fn new(config: &RpcConfig) -> Result<Self, RpcError> {
        Self::with_endpoint(
            config.endpoint(),
            &config.username,
            &config.password,
            config.timeout,
        )
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RpcError::Client)?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            username: username.to_string(),
            password: password.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue one call and decode its `result`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[Value],
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "1.0",
            id,
            method,
            params,
        };

        debug!(method, id, "rpc call");

        let transport = |source| RpcError::Transport {
            method: method.to_string(),
            source,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;

        // bitcoind reports RPC errors with a 500 and a JSON body, so look
        // for an error object before judging the status code.
        let parsed = serde_json::from_str::<RpcResponse>(&body).ok();
        if let Some(NodeError { code, message }) = parsed.as_ref().and_then(|r| r.error.as_ref()) {
            return Err(RpcError::Node {
                method: method.to_string(),
                code: *code,
                message: message.clone(),
            });
        }

        if !status.is_success() {
            return Err(RpcError::Status {
                method: method.to_string(),
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }

        let result = match parsed {
            Some(RpcResponse {
                result: Some(result),
                ..
            }) => result,
            Some(_) => {
                return Err(RpcError::MissingResult {
                    method: method.to_string(),
                })
            }
            None => {
                return Err(RpcError::Malformed {
                    method: method.to_string(),
                    reason: "body is not a JSON-RPC response".to_string(),
                })
            }
        };

        serde_json::from_value(result).map_err(|e| RpcError::Malformed {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ChainSource for BitcoinRpc {
    async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", &[]).await
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", &[json!(height)]).await
    }

    async fn get_block(&self, hash: &str) -> Result<FetchedBlock, RpcError> {
        let raw: Value = self
            .call("getblock", &[json!(hash), json!(VERBOSITY_FULL)])
            .await?;

        let malformed = |reason: String| RpcError::Malformed {
            method: "getblock".to_string(),
            reason,
        };

        let block: Block = serde_json::from_value(raw.clone()).map_err(|e| malformed(e.to_string()))?;
        block.check_shape().map_err(|e| malformed(e.to_string()))?;
        if block.hash != hash {
            return Err(malformed(format!(
                "asked for block {hash}, node returned {}",
                block.hash
            )));
        }

        Ok(FetchedBlock { block, raw })
    }

    async fn get_best_block_hash(&self) -> Result<String, RpcError> {
        self.call("getbestblockhash", &[]).await
    }
}
