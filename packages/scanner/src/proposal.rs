//! Proposal Lifecycle Tracking
//!
//! Builds a proposal record when a governance proposal for a contract
//! deployment or update is created, and marks it released when a later
//! transaction releases it. The two transactions share only the proposal id.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::decoder::{DecodeError, DecodedEvent, EventLogDecoder};
use crate::filter::{TransactionFilter, CODE_CHECK_REQUIRED_EVENT, PROPOSAL_CREATED_EVENT};
use crate::store::{ContractNameResolver, ProposalStore, StoreError};
use crate::transaction::{Transaction, TxParams};

/// Lifetime of an implicit zero-contract proposal
pub const IMPLICIT_PROPOSAL_TTL_MINUTES: i64 = 10;

/// Errors that can occur while tracking proposals
#[derive(Error, Debug)]
pub enum ProposalError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transaction {tx} has no {event} log")]
    MissingLog { tx: String, event: &'static str },

    #[error("Transaction {tx} is missing parameter '{param}'")]
    MissingParam { tx: String, param: &'static str },

    #[error("No proposal {0} to release")]
    MissingProposal(String),

    #[error("Proposal {0} was already released")]
    DoubleRelease(String),

    #[error("Invalid transaction time '{0}'")]
    InvalidTime(String),
}

/// A governance proposal for a contract deployment or update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub proposal_id: String,
    /// Contract the proposal will call once released
    pub contract_address: String,
    pub contract_method: String,
    pub proposer: String,
    /// Base64 contract code carried by the proposal
    pub code: String,
    pub organization_address: String,
    pub expired_time: String,
    pub created_tx_id: String,
    pub created_block_height: u64,
    pub created_time: String,
    pub released: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_name: Option<String>,
}

/// Fields written when a proposal is released
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePatch {
    pub released_tx_id: String,
    pub released_block_height: u64,
    pub released_time: String,
}

impl ProposalRecord {
    /// Mark released; code and contract name are left as they are
    pub fn apply(&mut self, patch: &ReleasePatch) {
        self.released = true;
        self.released_tx_id = Some(patch.released_tx_id.clone());
        self.released_block_height = Some(patch.released_block_height);
        self.released_time = Some(patch.released_time.clone());
    }
}

/// Proposal id a release transaction refers to
///
/// Either the `proposalId` of structured parameters or the parameters
/// themselves when they are a bare identifier.
pub fn release_target(params: &TxParams) -> Option<&str> {
    params.str_field("proposalId").or_else(|| params.bare_identifier())
}

/// Creates and releases proposal records
pub struct ProposalLifecycleTracker {
    config: Arc<ScanConfig>,
    filter: TransactionFilter,
    decoder: EventLogDecoder,
    store: Arc<dyn ProposalStore>,
    names: Arc<dyn ContractNameResolver>,
}

impl ProposalLifecycleTracker {
    pub fn new(
        config: Arc<ScanConfig>,
        store: Arc<dyn ProposalStore>,
        names: Arc<dyn ContractNameResolver>,
    ) -> Self {
        Self {
            filter: TransactionFilter::new(config.clone()),
            decoder: EventLogDecoder::new(config.clone()),
            config,
            store,
            names,
        }
    }

    /// Build the record for a proposal-creating transaction without storing it
    ///
    /// Explicit proposals take their target method and code from the
    /// `CreateProposal` parameters. Implicit ones come from a zero contract
    /// call and use the configured default organization.
    ///
    /// # Arguments
    /// * `tx` - A transaction classified as `ProposalCreated`, carrying a
    ///   `ProposalCreated` log from the controller
    ///
    /// # Returns
    /// The unreleased record, or an error naming the missing log or parameter
    pub async fn build_proposal_on_create(&self, tx: &Transaction) -> Result<ProposalRecord, ProposalError> {
        let created = self.decode_tx_log(tx, PROPOSAL_CREATED_EVENT)?;
        let proposal_id = created.str_field("proposalId")?.to_string();
        let params = tx.params();
        let created_time = tx.normalized_time(&self.config.chain_init_time);

        let record = if self.filter.is_explicit_proposal(tx) {
            let contract_method = required_str(tx, &params, "contractMethodName")?;
            let payload = required_str(tx, &params, "params")?;
            let input = self
                .decoder
                .decode_method_input(&self.config.zero_contract, contract_method, payload)?;
            let expired_time = params
                .field("expiredTime")
                .and_then(timestamp_param)
                .ok_or_else(|| ProposalError::MissingParam {
                    tx: tx.id.clone(),
                    param: "expiredTime",
                })?;

            ProposalRecord {
                proposal_id,
                contract_address: required_str(tx, &params, "toAddress")?.to_string(),
                contract_method: contract_method.to_string(),
                proposer: tx.from.clone(),
                code: input.str_field("code")?.to_string(),
                organization_address: required_str(tx, &params, "organizationAddress")?.to_string(),
                expired_time,
                created_tx_id: tx.id.clone(),
                created_block_height: tx.block_number,
                created_time,
                released: false,
                released_tx_id: None,
                released_block_height: None,
                released_time: None,
                contract_name: None,
            }
        } else {
            let check = self.decode_tx_log(tx, CODE_CHECK_REQUIRED_EVENT)?;
            let mut record = ProposalRecord {
                proposal_id,
                contract_address: tx.to.clone(),
                contract_method: tx.method_name.clone(),
                proposer: tx.from.clone(),
                code: check.str_field("code")?.to_string(),
                organization_address: self.config.controller.organization_address.clone(),
                expired_time: implicit_expiry(&created_time)?,
                created_tx_id: tx.id.clone(),
                created_block_height: tx.block_number,
                created_time,
                released: false,
                released_tx_id: None,
                released_block_height: None,
                released_time: None,
                contract_name: None,
            };
            if self.filter.is_implicit_proposal(tx) {
                let preceding = params.str_field("proposalId").unwrap_or_default();
                record.contract_name = self.resolve_contract_name(preceding).await;
            }
            record
        };

        debug!(
            "Built proposal {} for {}.{}",
            record.proposal_id, record.contract_address, record.contract_method
        );
        Ok(record)
    }

    /// Build and insert the record for a proposal-creating transaction
    ///
    /// Fails with a store error if the proposal id was already recorded.
    pub async fn record_proposal(&self, tx: &Transaction) -> Result<ProposalRecord, ProposalError> {
        let record = self.build_proposal_on_create(tx).await?;
        self.store.insert(&record).await?;
        info!("Recorded proposal {} from tx {}", record.proposal_id, tx.id);
        Ok(record)
    }

    /// Mark the proposal a release transaction refers to as released
    ///
    /// # Arguments
    /// * `tx` - A `Release` or `Release*Contract` call whose parameters name
    ///   the proposal
    ///
    /// # Returns
    /// The stored record after the update. Unknown and already released
    /// proposals are errors and leave the store untouched.
    pub async fn release_proposal(&self, tx: &Transaction) -> Result<ProposalRecord, ProposalError> {
        let params = tx.params();
        let proposal_id = release_target(&params).ok_or_else(|| ProposalError::MissingParam {
            tx: tx.id.clone(),
            param: "proposalId",
        })?;

        let existing = self
            .store
            .find_one(proposal_id)
            .await?
            .ok_or_else(|| ProposalError::MissingProposal(proposal_id.to_string()))?;
        if existing.released {
            return Err(ProposalError::DoubleRelease(proposal_id.to_string()));
        }

        let patch = ReleasePatch {
            released_tx_id: tx.id.clone(),
            released_block_height: tx.block_number,
            released_time: tx.normalized_time(&self.config.chain_init_time),
        };
        let released = self.store.update(proposal_id, &patch).await?;
        info!(
            "Released proposal {} in tx {} at height {}",
            proposal_id, tx.id, tx.block_number
        );
        Ok(released)
    }

    fn decode_tx_log(&self, tx: &Transaction, event: &'static str) -> Result<DecodedEvent, ProposalError> {
        let log = tx
            .logs
            .iter()
            .find(|log| log.name == event)
            .ok_or_else(|| ProposalError::MissingLog {
                tx: tx.id.clone(),
                event,
            })?;
        Ok(self.decoder.decode_log(log)?)
    }

    async fn resolve_contract_name(&self, proposal_id: &str) -> Option<String> {
        match self.names.get_contract_name(proposal_id).await {
            Ok(name) => name,
            Err(e) => {
                warn!("Contract name lookup for proposal '{}' failed: {}", proposal_id, e);
                None
            }
        }
    }
}

fn required_str<'p>(tx: &Transaction, params: &'p TxParams, param: &'static str) -> Result<&'p str, ProposalError> {
    params.str_field(param).ok_or_else(|| ProposalError::MissingParam {
        tx: tx.id.clone(),
        param,
    })
}

/// Expiry of an implicit proposal created at `time`, in UTC
fn implicit_expiry(time: &str) -> Result<String, ProposalError> {
    let created = DateTime::parse_from_rfc3339(time).map_err(|_| ProposalError::InvalidTime(time.to_string()))?;
    let expiry = created.with_timezone(&Utc) + Duration::minutes(IMPLICIT_PROPOSAL_TTL_MINUTES);
    Ok(expiry.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Timestamp parameter as RFC 3339, from either its string or `{seconds, nanos}` form
fn timestamp_param(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(ts) => {
            let seconds = match ts.get("seconds")? {
                Value::Number(n) => n.as_i64()?,
                Value::String(s) => s.parse().ok()?,
                _ => return None,
            };
            let nanos = ts.get("nanos").and_then(Value::as_u64).unwrap_or(0);
            let time = DateTime::<Utc>::from_timestamp(seconds, u32::try_from(nanos).ok()?)?;
            Some(time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        _ => None,
    }
}
