//! Read-only access to contract view methods on the node.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Zero contract view returning a contract's info
pub const GET_CONTRACT_INFO: &str = "GetContractInfo";

/// Zero contract view returning a contract's registration
pub const GET_SMART_CONTRACT_REGISTRATION: &str = "GetSmartContractRegistrationByAddress";

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Call to {contract}.{method} failed: {reason}")]
    Call {
        contract: String,
        method: String,
        reason: String,
    },

    #[error("Node unreachable: {0}")]
    Transport(String),
}

/// Invokes read-only contract methods
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Call `method` on `contract` with JSON `args`, returning the JSON result
    async fn call(&self, contract: &str, method: &str, args: Value) -> Result<Value, ChainError>;
}
