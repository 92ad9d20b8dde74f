//! Proposal Persistence
//!
//! Storage seams used by the proposal tracker, with an in-process backend
//! and a Redis backend storing one JSON document per proposal.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::proposal::{ProposalRecord, ReleasePatch};

/// Default key prefix for the Redis store
pub const DEFAULT_PREFIX: &str = "viewer_scan";

/// Errors that can occur while reading or writing proposals
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Proposal {0} already exists")]
    Duplicate(String),

    #[error("Proposal {0} not found")]
    NotFound(String),
}

/// Proposal records keyed by proposal id
#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn find_one(&self, proposal_id: &str) -> Result<Option<ProposalRecord>, StoreError>;

    /// Apply `patch` to an existing record and return the updated record
    async fn update(&self, proposal_id: &str, patch: &ReleasePatch) -> Result<ProposalRecord, StoreError>;

    /// Insert a new record; fails with [`StoreError::Duplicate`] if the id exists
    async fn insert(&self, record: &ProposalRecord) -> Result<(), StoreError>;
}

/// Lookup of the contract name attached to a proposal
#[async_trait]
pub trait ContractNameResolver: Send + Sync {
    async fn get_contract_name(&self, proposal_id: &str) -> Result<Option<String>, StoreError>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryProposalStore {
    proposals: RwLock<HashMap<String, ProposalRecord>>,
    contract_names: RwLock<HashMap<String, String>>,
}

impl MemoryProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the contract name a proposal id resolves to
    pub fn with_contract_name(mut self, proposal_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.contract_names.get_mut().insert(proposal_id.into(), name.into());
        self
    }

    pub async fn len(&self) -> usize {
        self.proposals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.proposals.read().await.is_empty()
    }

    /// All records ordered by proposal id
    pub async fn records(&self) -> Vec<ProposalRecord> {
        let mut records: Vec<_> = self.proposals.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.proposal_id.cmp(&b.proposal_id));
        records
    }
}

#[async_trait]
impl ProposalStore for MemoryProposalStore {
    async fn find_one(&self, proposal_id: &str) -> Result<Option<ProposalRecord>, StoreError> {
        Ok(self.proposals.read().await.get(proposal_id).cloned())
    }

    async fn update(&self, proposal_id: &str, patch: &ReleasePatch) -> Result<ProposalRecord, StoreError> {
        let mut proposals = self.proposals.write().await;
        let record = proposals
            .get_mut(proposal_id)
            .ok_or_else(|| StoreError::NotFound(proposal_id.to_string()))?;
        record.apply(patch);
        Ok(record.clone())
    }

    async fn insert(&self, record: &ProposalRecord) -> Result<(), StoreError> {
        let mut proposals = self.proposals.write().await;
        if proposals.contains_key(&record.proposal_id) {
            return Err(StoreError::Duplicate(record.proposal_id.clone()));
        }
        proposals.insert(record.proposal_id.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl ContractNameResolver for MemoryProposalStore {
    async fn get_contract_name(&self, proposal_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.contract_names.read().await.get(proposal_id).cloned())
    }
}

/// Redis-backed store
///
/// Proposals live under `{prefix}:proposal:{id}` as JSON, contract names
/// under `{prefix}:contract-name:{id}` as plain strings.
#[derive(Clone)]
pub struct RedisProposalStore {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisProposalStore {
    pub fn new(connection: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    pub fn with_default_prefix(connection: MultiplexedConnection) -> Self {
        Self::new(connection, DEFAULT_PREFIX)
    }

    /// Connect to `url` and build a store with the default prefix
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_default_prefix(connection))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn proposal_key(&self, proposal_id: &str) -> String {
        format!("{}:proposal:{}", self.prefix, proposal_id)
    }

    pub fn contract_name_key(&self, proposal_id: &str) -> String {
        format!("{}:contract-name:{}", self.prefix, proposal_id)
    }

    /// Record the contract name a proposal id resolves to
    pub async fn set_contract_name(&self, proposal_id: &str, name: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.set(self.contract_name_key(proposal_id), name).await?;
        Ok(())
    }
}

#[async_trait]
impl ProposalStore for RedisProposalStore {
    async fn find_one(&self, proposal_id: &str) -> Result<Option<ProposalRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(self.proposal_key(proposal_id)).await?;
        json.map(|j| serde_json::from_str(&j)).transpose().map_err(StoreError::from)
    }

    async fn update(&self, proposal_id: &str, patch: &ReleasePatch) -> Result<ProposalRecord, StoreError> {
        let mut record = self
            .find_one(proposal_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(proposal_id.to_string()))?;
        record.apply(patch);

        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&record)?;
        let _: () = conn.set(self.proposal_key(proposal_id), json).await?;
        debug!("Updated proposal {} in redis", proposal_id);
        Ok(record)
    }

    async fn insert(&self, record: &ProposalRecord) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(record)?;
        let created: bool = conn.set_nx(self.proposal_key(&record.proposal_id), json).await?;
        if !created {
            return Err(StoreError::Duplicate(record.proposal_id.clone()));
        }
        debug!("Inserted proposal {} in redis", record.proposal_id);
        Ok(())
    }
}

#[async_trait]
impl ContractNameResolver for RedisProposalStore {
    async fn get_contract_name(&self, proposal_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let name: Option<String> = conn.get(self.contract_name_key(proposal_id)).await?;
        Ok(name)
    }
}
