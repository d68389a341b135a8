use serde::Deserialize;

/// Coinbase txids that the chain repeats in a later block (BIP30).
pub const BIP30_DUPLICATE_TXIDS: [&str; 2] = [
    "d5d27987d2a3dfc724e359870c6644b40e497bdc0589a033220fe15429d88599",
    "e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468",
];

pub fn is_bip30_duplicate(txid: &str) -> bool {
    BIP30_DUPLICATE_TXIDS.contains(&txid)
}

/// A block as returned by `getblock <hash> 2`.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub hash: String,
    #[serde(default)]
    pub confirmations: i64,
    pub height: u64,
    pub version: i32,
    #[serde(rename = "versionHex")]
    pub version_hex: String,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub time: i64,
    #[serde(rename = "mediantime")]
    pub median_time: Option<i64>,
    pub nonce: u32,
    pub bits: String,
    pub difficulty: f64,
    pub chainwork: String,
    #[serde(rename = "nTx")]
    pub tx_count: u64,
    #[serde(rename = "previousblockhash")]
    pub previous_hash: Option<String>,
    #[serde(rename = "nextblockhash")]
    pub next_hash: Option<String>,
    #[serde(rename = "strippedsize")]
    pub stripped_size: u64,
    pub size: u64,
    pub weight: u64,
    #[serde(rename = "tx", default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub version: i32,
    pub locktime: u32,
    pub size: u64,
    pub weight: u64,
    pub amount: Option<f64>,
    pub fee: Option<f64>,
    #[serde(rename = "vin", default)]
    pub inputs: Vec<Input>,
    #[serde(rename = "vout", default)]
    pub outputs: Vec<Output>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Input {
    pub txid: Option<String>,
    pub vout: Option<u32>,
    #[serde(rename = "scriptSig")]
    pub script_sig: Option<Script>,
    pub coinbase: Option<String>,
    pub sequence: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Output {
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: Script,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    pub hex: String,
}

/// A decoded block together with the node's raw JSON, which is what gets
/// written to the snapshot directory.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub block: Block,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedBlock {
    #[error("block hash {0:?} is not 32 hex-encoded bytes")]
    BadHash(String),

    #[error("nTx is {declared} but {actual} transactions were returned")]
    TxCountMismatch { declared: u64, actual: usize },

    #[error("output {txid}:{n} has negative value {value}")]
    NegativeValue { txid: String, n: u32, value: f64 },
}

impl Block {
    pub fn median_time(&self) -> i64 {
        self.median_time.unwrap_or(self.time)
    }

    /// Reject responses that are structurally incomplete. This is not
    /// consensus validation: the node's data is trusted otherwise.
    pub fn check_shape(&self) -> Result<(), MalformedBlock> {
        match hex::decode(&self.hash) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => return Err(MalformedBlock::BadHash(self.hash.clone())),
        }

        if !self.transactions.is_empty() && self.transactions.len() as u64 != self.tx_count {
            return Err(MalformedBlock::TxCountMismatch {
                declared: self.tx_count,
                actual: self.transactions.len(),
            });
        }

        for tx in &self.transactions {
            if let Some(output) = tx.outputs.iter().find(|o| o.value < 0.0) {
                return Err(MalformedBlock::NegativeValue {
                    txid: tx.txid.clone(),
                    n: output.n,
                    value: output.value,
                });
            }
        }

        Ok(())
    }
}

impl Transaction {
    /// Explicit `amount` when the node reports one, otherwise the sum of outputs.
    pub fn amount(&self) -> f64 {
        self.amount
            .unwrap_or_else(|| self.outputs.iter().map(|o| o.value).sum())
    }

    pub fn fee(&self) -> f64 {
        self.fee.unwrap_or(0.0)
    }
}

impl Input {
    pub fn script_sig_hex(&self) -> Option<&str> {
        self.script_sig
            .as_ref()
            .map(|s| s.hex.as_str())
            .or(self.coinbase.as_deref())
    }
}
