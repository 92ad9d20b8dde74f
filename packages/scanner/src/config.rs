//! Scanner Configuration
//!
//! Contract addresses, controller defaults and the contract schema table,
//! loaded once from JSON and shared immutably between components.

use std::fs;
use std::path::Path;

use chrono::DateTime;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::repr::{address_bytes, ReprError};
use crate::schema::{ContractSchema, SchemaRegistry, SchemaTable};

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required config value: {0}")]
    Missing(&'static str),

    #[error("Invalid {field}: {source}")]
    InvalidAddress {
        field: &'static str,
        #[source]
        source: ReprError,
    },

    #[error("Invalid chain init time '{0}': expected RFC 3339")]
    InvalidChainInitTime(String),

    #[error("No schema configured for the {role} contract at {address}")]
    MissingSchema { role: &'static str, address: String },

    #[error("Unresolved type '{type_name}' for {message}.{field} in contract {contract}")]
    UnresolvedType {
        contract: String,
        message: String,
        field: String,
        type_name: String,
    },
}

/// Governance controller contract settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Address of the controller contract hosting proposals
    pub contract_address: String,
    /// Default organization used for proposals raised by the zero contract
    pub organization_address: String,
}

/// Immutable scanner configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// Address of the zero (genesis) contract
    pub zero_contract: String,
    pub controller: ControllerConfig,
    /// Substituted for the genesis block's sentinel timestamp
    pub chain_init_time: String,
    /// Contract address → schema table
    #[serde(default, rename = "contracts")]
    pub schemas: SchemaTable,
}

impl ScanConfig {
    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ScanConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&json)?;
        info!(
            "Loaded scan config from {} ({} contract schemas)",
            path.display(),
            config.schemas.len()
        );
        Ok(config)
    }

    /// Check addresses, chain init time and schema completeness
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zero_contract.is_empty() {
            return Err(ConfigError::Missing("zeroContract"));
        }
        if self.controller.contract_address.is_empty() {
            return Err(ConfigError::Missing("controller.contractAddress"));
        }
        if self.controller.organization_address.is_empty() {
            return Err(ConfigError::Missing("controller.organizationAddress"));
        }
        for (field, address) in [
            ("zeroContract", &self.zero_contract),
            ("controller.contractAddress", &self.controller.contract_address),
            ("controller.organizationAddress", &self.controller.organization_address),
        ] {
            address_bytes(address).map_err(|source| ConfigError::InvalidAddress { field, source })?;
        }
        if DateTime::parse_from_rfc3339(&self.chain_init_time).is_err() {
            return Err(ConfigError::InvalidChainInitTime(self.chain_init_time.clone()));
        }
        if self.zero_schema().is_none() {
            return Err(ConfigError::MissingSchema {
                role: "zero",
                address: self.zero_contract.clone(),
            });
        }
        if self.controller_schema().is_none() {
            return Err(ConfigError::MissingSchema {
                role: "controller",
                address: self.controller.contract_address.clone(),
            });
        }
        for contract in self.schemas.contracts() {
            if let Some((message, field, type_name)) = contract.unresolved_types().into_iter().next() {
                return Err(ConfigError::UnresolvedType {
                    contract: contract.name.clone(),
                    message,
                    field,
                    type_name,
                });
            }
        }
        Ok(())
    }

    /// Whether `address` is the zero contract
    pub fn is_zero_contract(&self, address: &str) -> bool {
        address == self.zero_contract
    }

    /// Whether `address` is the controller contract
    pub fn is_controller(&self, address: &str) -> bool {
        address == self.controller.contract_address
    }

    pub fn zero_schema(&self) -> Option<&ContractSchema> {
        self.schemas.resolve(&self.zero_contract)
    }

    pub fn controller_schema(&self) -> Option<&ContractSchema> {
        self.schemas.resolve(&self.controller.contract_address)
    }
}

impl SchemaRegistry for ScanConfig {
    fn resolve(&self, address: &str) -> Option<&ContractSchema> {
        self.schemas.resolve(address)
    }
}

/// Configuration used across the crate's unit tests
#[cfg(test)]
pub(crate) fn test_config() -> ScanConfig {
    ScanConfig::from_json(include_str!("../tests/fixtures/config.json"))
        .expect("fixture config must be valid")
}
