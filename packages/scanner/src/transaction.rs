//! Transaction Model
//!
//! Mined transactions as the scanner observes them, plus the two
//! representations of their JSON parameters.

use chrono::{DateTime, Datelike};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Status string a transaction must carry (case-insensitively) to be scanned
pub const MINED_STATUS: &str = "MINED";

/// A single log entry emitted by a contract during a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Address of the emitting contract
    #[serde(alias = "Address")]
    pub address: String,
    /// Event name, which is also the message type of the payload
    #[serde(alias = "Name")]
    pub name: String,
    /// Base64 chunks of the indexed fields
    #[serde(alias = "Indexed", default, deserialize_with = "null_as_default")]
    pub indexed: Vec<String>,
    /// Base64 chunk of the non-indexed fields
    #[serde(alias = "NonIndexed", default, deserialize_with = "null_as_default")]
    pub non_indexed: String,
}

impl Log {
    /// Base64 payload chunks in wire order: every indexed chunk, then the
    /// non-indexed one
    pub fn chunks(&self) -> impl Iterator<Item = &str> {
        self.indexed
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.non_indexed.as_str()))
    }
}

/// A mined transaction with its logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Transaction id
    pub id: String,
    /// Sender address
    pub from: String,
    /// Target contract address
    pub to: String,
    /// Invoked contract method
    pub method_name: String,
    /// Raw JSON parameters as returned by the node
    #[serde(default)]
    pub params_raw: String,
    /// Execution status (e.g. "MINED", "FAILED")
    pub status: String,
    /// Height of the including block
    pub block_number: u64,
    /// Block time, RFC 3339
    pub time: String,
    /// Logs emitted during execution
    #[serde(default)]
    pub logs: Vec<Log>,
}

/// Transaction result in the node's own JSON layout
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeTransactionResult {
    pub transaction_id: String,
    pub status: String,
    pub block_number: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub logs: Vec<Log>,
    pub transaction: NodeTransaction,
    /// Block time attached by the block fetcher
    #[serde(alias = "time")]
    pub time: String,
}

/// The signed transaction body inside a [`NodeTransactionResult`]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeTransaction {
    pub from: String,
    pub to: String,
    pub method_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: String,
}

impl From<NodeTransactionResult> for Transaction {
    fn from(result: NodeTransactionResult) -> Self {
        Self {
            id: result.transaction_id,
            from: result.transaction.from,
            to: result.transaction.to,
            method_name: result.transaction.method_name,
            params_raw: result.transaction.params,
            status: result.status,
            block_number: result.block_number,
            time: result.time,
            logs: result.logs,
        }
    }
}

impl Transaction {
    /// Whether the node reports the transaction as mined
    pub fn is_mined(&self) -> bool {
        self.status.eq_ignore_ascii_case(MINED_STATUS)
    }

    /// Parse the raw parameters, keeping them opaque when they are not JSON
    pub fn params(&self) -> TxParams {
        TxParams::parse(&self.params_raw)
    }

    /// Block time with the genesis sentinel replaced by `chain_init_time`
    ///
    /// Genesis-block transactions carry an epoch default instead of a real
    /// timestamp.
    pub fn normalized_time(&self, chain_init_time: &str) -> String {
        if is_epoch_sentinel(&self.time) {
            chain_init_time.to_string()
        } else {
            self.time.clone()
        }
    }
}

/// Whether a block time is the epoch default rather than a real timestamp
pub fn is_epoch_sentinel(time: &str) -> bool {
    if time.starts_with("1970") || time.starts_with("0001") {
        return true;
    }
    match DateTime::parse_from_rfc3339(time) {
        Ok(parsed) => parsed.year() <= 1 || parsed.timestamp() == 0,
        Err(_) => false,
    }
}

/// Transaction parameters, parsed when they are JSON
#[derive(Debug, Clone, PartialEq)]
pub enum TxParams {
    /// Parameters parsed as JSON
    Structured(Value),
    /// Parameters that failed to parse, kept verbatim
    Opaque(String),
}

impl TxParams {
    /// Parse raw parameters; parse failures fall back to [`TxParams::Opaque`]
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(value) => TxParams::Structured(value),
            Err(_) => TxParams::Opaque(raw.to_string()),
        }
    }

    /// Field of a structured object, `None` for anything else
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            TxParams::Structured(Value::Object(map)) => map.get(name),
            _ => None,
        }
    }

    /// String field of a structured object
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// The parameters themselves when they are a bare identifier
    ///
    /// Accepts both a JSON string and the opaque raw text.
    pub fn bare_identifier(&self) -> Option<&str> {
        match self {
            TxParams::Structured(Value::String(s)) => Some(s),
            TxParams::Opaque(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
