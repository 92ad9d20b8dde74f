//! Contract Registry Tracking
//!
//! Turns a zero contract change event into a contract-change row enriched
//! with the contract's live registry state.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::chain::{ChainError, ChainReader, GET_CONTRACT_INFO, GET_SMART_CONTRACT_REGISTRATION};
use crate::config::ScanConfig;
use crate::decoder::{DecodeError, DecodedEvent, EventLogDecoder};
use crate::filter::{ContractEventName, TransactionFilter};
use crate::proposal::ProposalRecord;
use crate::transaction::Transaction;

/// Errors that can occur while building a contract-change record
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Registry read failed: {0}")]
    Chain(#[from] ChainError),

    #[error("Transaction {0} has no contract change log")]
    NoContractLog(String),

    #[error("Unknown contract event {0}")]
    UnknownEvent(String),

    #[error("{method} returned {kind}, expected an object")]
    UnexpectedResponse { method: &'static str, kind: &'static str },
}

/// A contract change as announced by the zero contract
#[derive(Debug, Clone, PartialEq)]
pub enum ContractEvent {
    Deployed {
        code_hash: String,
        author: String,
        version: i64,
    },
    Updated {
        code_hash: String,
        version: i64,
    },
    AuthorChanged {
        author: String,
    },
}

impl ContractEvent {
    /// Extract the branch fields of a decoded zero contract event
    pub fn from_decoded(event: &DecodedEvent) -> Result<Self, RegistryError> {
        let name = ContractEventName::from_name(&event.event_name)
            .ok_or_else(|| RegistryError::UnknownEvent(event.event_name.clone()))?;
        let parsed = match name {
            ContractEventName::ContractDeployed => ContractEvent::Deployed {
                code_hash: event.str_field("codeHash")?.to_string(),
                author: event.str_field("author")?.to_string(),
                version: version_of(event)?,
            },
            ContractEventName::CodeUpdated => ContractEvent::Updated {
                code_hash: event.str_field("newCodeHash")?.to_string(),
                version: version_of(event)?,
            },
            ContractEventName::AuthorChanged => ContractEvent::AuthorChanged {
                author: event.str_field("newAuthor")?.to_string(),
            },
        };
        Ok(parsed)
    }

    pub fn name(&self) -> ContractEventName {
        match self {
            ContractEvent::Deployed { .. } => ContractEventName::ContractDeployed,
            ContractEvent::Updated { .. } => ContractEventName::CodeUpdated,
            ContractEvent::AuthorChanged { .. } => ContractEventName::AuthorChanged,
        }
    }

    /// Only the fields this event kind contributes
    pub fn branch_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        match self {
            ContractEvent::Deployed {
                code_hash,
                author,
                version,
            } => {
                fields.insert("codeHash".to_string(), Value::from(code_hash.as_str()));
                fields.insert("author".to_string(), Value::from(author.as_str()));
                fields.insert("version".to_string(), Value::from(*version));
            }
            ContractEvent::Updated { code_hash, version } => {
                fields.insert("codeHash".to_string(), Value::from(code_hash.as_str()));
                fields.insert("version".to_string(), Value::from(*version));
            }
            ContractEvent::AuthorChanged { author } => {
                fields.insert("author".to_string(), Value::from(author.as_str()));
            }
        }
        fields
    }
}

fn version_of(event: &DecodedEvent) -> Result<i64, DecodeError> {
    event.int_field("version").ok_or_else(|| DecodeError::MissingField {
        event: event.event_name.clone(),
        field: "version".to_string(),
    })
}

/// Point-in-time fact row for one contract change
#[derive(Debug, Clone, PartialEq)]
pub struct ContractChangeRecord {
    /// Address of the changed contract
    pub address: String,
    pub event: ContractEvent,
    /// Contract info merged with the contract registration
    pub registry: Map<String, Value>,
    pub time: String,
    pub block_height: u64,
    pub tx_id: String,
    /// Base64 code, from the released proposal or the direct call's parameters
    pub code: Option<String>,
    pub contract_name: Option<String>,
}

impl ContractChangeRecord {
    pub fn event_name(&self) -> &'static str {
        self.event.name().name()
    }

    /// Code hash from the event, or from the registry for author changes
    pub fn code_hash(&self) -> Option<&str> {
        match &self.event {
            ContractEvent::Deployed { code_hash, .. } | ContractEvent::Updated { code_hash, .. } => {
                Some(code_hash.as_str())
            }
            ContractEvent::AuthorChanged { .. } => self.registry.get("codeHash").and_then(Value::as_str),
        }
    }

    /// Author from the event, or from the registry for code updates
    pub fn author(&self) -> Option<&str> {
        match &self.event {
            ContractEvent::Deployed { author, .. } | ContractEvent::AuthorChanged { author } => {
                Some(author.as_str())
            }
            ContractEvent::Updated { .. } => self.registry.get("author").and_then(Value::as_str),
        }
    }

    /// Take code and contract name from the proposal that caused this change
    pub fn with_proposal(mut self, proposal: &ProposalRecord) -> Self {
        self.code = Some(proposal.code.clone());
        self.contract_name = proposal.contract_name.clone();
        self
    }

    /// Flat row: registry fields, then address and event name, then the
    /// event's own fields, then transaction metadata and code
    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = self.registry.clone();
        row.insert("address".to_string(), Value::from(self.address.as_str()));
        row.insert("eventName".to_string(), Value::from(self.event_name()));
        row.extend(self.event.branch_fields());
        row.insert("time".to_string(), Value::from(self.time.as_str()));
        row.insert("blockHeight".to_string(), Value::from(self.block_height));
        row.insert("txId".to_string(), Value::from(self.tx_id.as_str()));
        if let Some(code) = &self.code {
            row.insert("code".to_string(), Value::from(code.as_str()));
        }
        if let Some(name) = &self.contract_name {
            row.insert("contractName".to_string(), Value::from(name.as_str()));
        }
        row
    }
}

impl Serialize for ContractChangeRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_row().serialize(serializer)
    }
}

/// Builds contract-change records from zero contract events
pub struct ContractRegistryTracker {
    config: Arc<ScanConfig>,
    filter: TransactionFilter,
    decoder: EventLogDecoder,
    chain: Arc<dyn ChainReader>,
}

impl ContractRegistryTracker {
    pub fn new(config: Arc<ScanConfig>, chain: Arc<dyn ChainReader>) -> Self {
        Self {
            filter: TransactionFilter::new(config.clone()),
            decoder: EventLogDecoder::new(config.clone()),
            config,
            chain,
        }
    }

    /// Decode the transaction's contract change log
    ///
    /// Returns the changed contract's address with the event.
    pub fn contract_event(&self, tx: &Transaction) -> Result<(String, ContractEvent), RegistryError> {
        let log = self
            .filter
            .contract_log(tx)
            .ok_or_else(|| RegistryError::NoContractLog(tx.id.clone()))?;
        let decoded = self.decoder.decode_log(log)?;
        let address = decoded.str_field("address")?.to_string();
        Ok((address, ContractEvent::from_decoded(&decoded)?))
    }

    /// Contract info and registration for `address`, read concurrently
    pub async fn registry_fields(&self, address: &str) -> Result<Map<String, Value>, RegistryError> {
        let zero = self.config.zero_contract.as_str();
        let (info, registration) = tokio::try_join!(
            self.chain.call(zero, GET_CONTRACT_INFO, Value::from(address)),
            self.chain.call(zero, GET_SMART_CONTRACT_REGISTRATION, Value::from(address)),
        )?;
        let mut merged = into_object(info, GET_CONTRACT_INFO)?;
        merged.extend(into_object(registration, GET_SMART_CONTRACT_REGISTRATION)?);
        Ok(merged)
    }

    /// Build the contract-change record of `tx`
    ///
    /// `released` is the proposal this transaction released, if any; it
    /// supplies the code and contract name. Otherwise the code comes from
    /// the transaction's own parameters.
    ///
    /// # Arguments
    /// * `tx` - A transaction carrying a zero contract change event
    /// * `released` - The proposal `tx` released, if any
    ///
    /// # Returns
    /// The record with the registry fields read back from the chain. Fails
    /// when the event is missing or either registry read fails.
    pub async fn build_contract_change(
        &self,
        tx: &Transaction,
        released: Option<&ProposalRecord>,
    ) -> Result<ContractChangeRecord, RegistryError> {
        let (address, event) = self.contract_event(tx)?;
        let registry = self.registry_fields(&address).await?;

        let mut record = ContractChangeRecord {
            address,
            event,
            registry,
            time: tx.normalized_time(&self.config.chain_init_time),
            block_height: tx.block_number,
            tx_id: tx.id.clone(),
            code: tx.params().str_field("code").map(str::to_string),
            contract_name: None,
        };
        if let Some(proposal) = released {
            record = record.with_proposal(proposal);
        }
        info!(
            "Contract {} {} at height {} (tx {})",
            record.address,
            record.event_name(),
            record.block_height,
            record.tx_id
        );
        Ok(record)
    }
}

fn into_object(value: Value, method: &'static str) -> Result<Map<String, Value>, RegistryError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(RegistryError::UnexpectedResponse {
            method,
            kind: match other {
                Value::Bool(_) => "a boolean",
                Value::Number(_) => "a number",
                Value::String(_) => "a string",
                _ => "an array",
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::decoder::test_wire::{b64, varint_field, wrapped};
    use crate::repr::{address_rep, hash_rep};
    use crate::transaction::Log;
    use mockall::mock;
    use serde_json::json;

    mock! {
        pub Chain {}
        #[async_trait::async_trait]
        impl ChainReader for Chain {
            async fn call(&self, contract: &str, method: &str, args: Value) -> Result<Value, ChainError>;
        }
    }

    fn registry_chain() -> MockChain {
        let mut chain = MockChain::new();
        chain.expect_call().times(2).returning(|_, method, _| match method {
            GET_CONTRACT_INFO => Ok(json!({
                "author": "registry-author",
                "codeHash": "registry-hash",
                "version": 1,
                "isSystemContract": false
            })),
            GET_SMART_CONTRACT_REGISTRATION => Ok(json!({"category": 0, "code": "cmVn", "version": 2})),
            other => Err(ChainError::Call {
                contract: "zero".to_string(),
                method: other.to_string(),
                reason: "unexpected".to_string(),
            }),
        });
        chain
    }

    fn tracker(chain: MockChain) -> (ContractRegistryTracker, Arc<ScanConfig>) {
        let config = Arc::new(test_config());
        (ContractRegistryTracker::new(config.clone(), Arc::new(chain)), config)
    }

    fn change_tx(config: &ScanConfig, name: &str, payload: Vec<u8>, params: &str) -> Transaction {
        Transaction {
            id: "change".to_string(),
            from: "author".to_string(),
            to: config.zero_contract.clone(),
            method_name: "DeploySmartContract".to_string(),
            params_raw: params.to_string(),
            status: "MINED".to_string(),
            block_number: 77,
            time: "2021-07-01T00:00:00Z".to_string(),
            logs: vec![Log {
                address: config.zero_contract.clone(),
                name: name.to_string(),
                indexed: vec![],
                non_indexed: b64(&payload),
            }],
        }
    }

    fn deployed_payload() -> Vec<u8> {
        [
            wrapped(1, &[1u8; 32]),
            wrapped(2, &[2u8; 32]),
            wrapped(3, &[3u8; 32]),
            varint_field(4, 5),
        ]
        .concat()
    }

    // ==================== ContractEvent tests ====================

    #[tokio::test]
    async fn test_deployed_branch_overrides_registry() {
        let (tracker, config) = tracker(registry_chain());
        let tx = change_tx(&config, "ContractDeployed", deployed_payload(), r#"{"category":0,"code":"AAEC"}"#);

        let record = tracker.build_contract_change(&tx, None).await.unwrap();
        let row = record.to_row();
        assert_eq!(row["address"], address_rep(&[3u8; 32]));
        assert_eq!(row["eventName"], "ContractDeployed");
        assert_eq!(row["codeHash"], hash_rep(&[2u8; 32]));
        assert_eq!(row["author"], address_rep(&[1u8; 32]));
        assert_eq!(row["version"], 5);
        assert_eq!(row["category"], 0);
        assert_eq!(row["isSystemContract"], false);
        assert_eq!(row["code"], "AAEC");
        assert_eq!(row["blockHeight"], 77);
        assert_eq!(row["txId"], "change");
        assert!(row.get("contractName").is_none());
    }

    #[tokio::test]
    async fn test_author_changed_only_sets_author() {
        let (tracker, config) = tracker(registry_chain());
        let payload = [wrapped(1, &[3u8; 32]), wrapped(2, &[1u8; 32]), wrapped(3, &[9u8; 32])].concat();
        let tx = change_tx(&config, "AuthorChanged", payload, "{}");

        let record = tracker.build_contract_change(&tx, None).await.unwrap();
        assert_eq!(
            record.event,
            ContractEvent::AuthorChanged {
                author: address_rep(&[9u8; 32])
            }
        );
        let row = record.to_row();
        assert_eq!(row["author"], address_rep(&[9u8; 32]));
        assert_eq!(row["codeHash"], "registry-hash");
        assert_eq!(row["version"], 2);
        assert_eq!(record.code_hash(), Some("registry-hash"));
        assert!(row.get("code").is_none());
    }

    #[tokio::test]
    async fn test_code_updated_uses_new_code_hash() {
        let (tracker, config) = tracker(registry_chain());
        let payload = [
            wrapped(1, &[3u8; 32]),
            wrapped(2, &[4u8; 32]),
            wrapped(3, &[5u8; 32]),
            varint_field(4, 2),
        ]
        .concat();
        let tx = change_tx(&config, "CodeUpdated", payload, "{}");

        let record = tracker.build_contract_change(&tx, None).await.unwrap();
        assert_eq!(record.code_hash(), Some(hash_rep(&[5u8; 32]).as_str()));
        assert_eq!(record.author(), Some("registry-author"));
        assert_eq!(record.to_row()["version"], 2);
    }

    #[tokio::test]
    async fn test_release_path_takes_code_from_proposal() {
        let (tracker, config) = tracker(registry_chain());
        let tx = change_tx(&config, "ContractDeployed", deployed_payload(), "\"pid\"");
        let proposal = ProposalRecord {
            proposal_id: "pid".to_string(),
            contract_address: config.zero_contract.clone(),
            contract_method: "DeploySmartContract".to_string(),
            proposer: "p".to_string(),
            code: "cHJvcG9zYWw=".to_string(),
            organization_address: "org".to_string(),
            expired_time: "2021-07-02T00:00:00Z".to_string(),
            created_tx_id: "c".to_string(),
            created_block_height: 1,
            created_time: "2021-06-30T00:00:00Z".to_string(),
            released: true,
            released_tx_id: Some("change".to_string()),
            released_block_height: Some(77),
            released_time: Some("2021-07-01T00:00:00Z".to_string()),
            contract_name: Some("AElf.Contracts.Vote".to_string()),
        };

        let record = tracker.build_contract_change(&tx, Some(&proposal)).await.unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["code"], "cHJvcG9zYWw=");
        assert_eq!(json["contractName"], "AElf.Contracts.Vote");
    }

    #[tokio::test]
    async fn test_genesis_time_replaced() {
        let (tracker, config) = tracker(registry_chain());
        let mut tx = change_tx(&config, "ContractDeployed", deployed_payload(), "{}");
        tx.time = "1970-01-01T00:00:00Z".to_string();

        let record = tracker.build_contract_change(&tx, None).await.unwrap();
        assert_eq!(record.time, config.chain_init_time);
    }

    // ==================== Failure tests ====================

    #[tokio::test]
    async fn test_registry_failure_fails_operation() {
        let mut chain = MockChain::new();
        chain.expect_call().returning(|contract, method, _| match method {
            GET_CONTRACT_INFO => Ok(json!({})),
            _ => Err(ChainError::Call {
                contract: contract.to_string(),
                method: method.to_string(),
                reason: "timeout".to_string(),
            }),
        });
        let (tracker, config) = tracker(chain);
        let tx = change_tx(&config, "ContractDeployed", deployed_payload(), "{}");

        assert!(matches!(
            tracker.build_contract_change(&tx, None).await,
            Err(RegistryError::Chain(_))
        ));
    }

    #[tokio::test]
    async fn test_non_object_registry_response() {
        let mut chain = MockChain::new();
        chain.expect_call().returning(|_, _, _| Ok(json!("oops")));
        let (tracker, config) = tracker(chain);
        let tx = change_tx(&config, "ContractDeployed", deployed_payload(), "{}");

        assert!(matches!(
            tracker.build_contract_change(&tx, None).await,
            Err(RegistryError::UnexpectedResponse { kind: "a string", .. })
        ));
    }

    #[tokio::test]
    async fn test_null_registry_response_is_empty() {
        let mut chain = MockChain::new();
        chain.expect_call().times(2).returning(|_, _, _| Ok(Value::Null));
        let (tracker, _) = tracker(chain);
        assert!(tracker.registry_fields("addr").await.unwrap().is_empty());
    }

    #[test]
    fn test_missing_contract_log() {
        let (tracker, config) = tracker(MockChain::new());
        let mut tx = change_tx(&config, "ContractDeployed", vec![], "{}");
        tx.logs[0].name = "CodeCheckRequired".to_string();
        assert!(matches!(
            tracker.contract_event(&tx),
            Err(RegistryError::NoContractLog(_))
        ));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let event = DecodedEvent {
            event_name: "Transferred".to_string(),
            fields: Map::new(),
        };
        assert!(matches!(
            ContractEvent::from_decoded(&event),
            Err(RegistryError::UnknownEvent(_))
        ));
    }
}
