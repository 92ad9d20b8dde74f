//! Canonical string forms of chain addresses and hashes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReprError {
    #[error("Invalid address representation '{rep}': {reason}")]
    InvalidAddress { rep: String, reason: String },
}

/// Base58 with a double SHA-256 checksum, as shown by the chain's explorers
pub fn address_rep(bytes: &[u8]) -> String {
    bs58::encode(bytes).with_check().into_string()
}

/// Lowercase hex without prefix
pub fn hash_rep(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Raw bytes of an address representation, verifying the checksum
pub fn address_bytes(rep: &str) -> Result<Vec<u8>, ReprError> {
    bs58::decode(rep)
        .with_check(None)
        .into_vec()
        .map_err(|e| ReprError::InvalidAddress {
            rep: rep.to_string(),
            reason: e.to_string(),
        })
}
