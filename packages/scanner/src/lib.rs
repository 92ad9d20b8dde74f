//! Viewer Scan Library
//!
//! This crate provides the core of a chain scanner: classifying mined
//! transactions, decoding contract event logs, tracking governance proposals
//! for contract deployments and updates, and recording contract changes.

pub mod chain;
pub mod config;
pub mod decoder;
pub mod filter;
pub mod logging;
pub mod proposal;
pub mod registry;
pub mod repr;
pub mod scanner;
pub mod schema;
pub mod store;
pub mod transaction;

// Re-export commonly used types
pub use chain::{ChainError, ChainReader};
pub use config::{ConfigError, ScanConfig};
pub use decoder::{DecodeError, DecodedEvent, EventLogDecoder};
pub use filter::{Classification, TransactionFilter};
pub use proposal::{ProposalError, ProposalLifecycleTracker, ProposalRecord};
pub use registry::{ContractChangeRecord, ContractEvent, ContractRegistryTracker, RegistryError};
pub use scanner::{ScanError, ScanOutcome, Scanner};
pub use store::{ContractNameResolver, MemoryProposalStore, ProposalStore, RedisProposalStore, StoreError};
pub use transaction::{Log, Transaction, TxParams};
