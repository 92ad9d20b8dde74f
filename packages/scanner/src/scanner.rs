//! Per-transaction driver
//!
//! Runs classification, then the proposal and contract trackers in the order
//! a polling orchestrator needs. Persistence of contract-change rows is left
//! to the caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::chain::ChainReader;
use crate::config::ScanConfig;
use crate::filter::{Classification, TransactionFilter};
use crate::proposal::{ProposalError, ProposalLifecycleTracker, ProposalRecord};
use crate::registry::{ContractChangeRecord, ContractRegistryTracker, RegistryError};
use crate::store::{ContractNameResolver, ProposalStore};
use crate::transaction::Transaction;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Proposal tracking failed: {0}")]
    Proposal(#[from] ProposalError),

    #[error("Contract tracking failed: {0}")]
    Registry(#[from] RegistryError),
}

/// What processing one transaction produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub classifications: BTreeSet<Classification>,
    /// Proposal created by the transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalRecord>,
    /// Proposal released by the transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released: Option<ProposalRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_change: Option<ContractChangeRecord>,
}

impl ScanOutcome {
    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.proposal.is_none() && self.released.is_none() && self.contract_change.is_none()
    }
}

/// Per-transaction pipeline: classify, then hand off to the proposal and
/// registry trackers
///
/// Owns no state of its own; persistence lives behind the proposal store.
pub struct Scanner {
    filter: TransactionFilter,
    proposals: ProposalLifecycleTracker,
    registry: ContractRegistryTracker,
}

impl Scanner {
    pub fn new(
        config: Arc<ScanConfig>,
        chain: Arc<dyn ChainReader>,
        store: Arc<dyn ProposalStore>,
        names: Arc<dyn ContractNameResolver>,
    ) -> Self {
        Self {
            filter: TransactionFilter::new(config.clone()),
            proposals: ProposalLifecycleTracker::new(config.clone(), store, names),
            registry: ContractRegistryTracker::new(config, chain),
        }
    }

    pub fn filter(&self) -> &TransactionFilter {
        &self.filter
    }

    pub fn proposals(&self) -> &ProposalLifecycleTracker {
        &self.proposals
    }

    pub fn registry(&self) -> &ContractRegistryTracker {
        &self.registry
    }

    /// Classify `tx` and run the trackers that apply
    ///
    /// A release only touches the store once its contract change has been
    /// built, so a failed registry read leaves the proposal unreleased.
    /// Releases without a contract change event are skipped.
    ///
    /// # Arguments
    /// * `tx` - A polled transaction with its logs attached
    ///
    /// # Returns
    /// The classifications plus whatever proposal and contract-change rows
    /// were produced, or the first tracker error
    pub async fn process(&self, tx: &Transaction) -> Result<ScanOutcome, ScanError> {
        let classifications = self.filter.classify(tx);
        let mut outcome = ScanOutcome {
            classifications,
            ..ScanOutcome::default()
        };
        if outcome.classifications.contains(&Classification::Irrelevant) {
            return Ok(outcome);
        }

        if outcome.classifications.contains(&Classification::ProposalCreated) {
            outcome.proposal = Some(self.proposals.record_proposal(tx).await?);
        }

        if outcome.classifications.contains(&Classification::ContractRelated) {
            let change = self.registry.build_contract_change(tx, None).await?;
            if outcome.classifications.contains(&Classification::ReleaseOccurred) {
                let released = self.proposals.release_proposal(tx).await?;
                outcome.contract_change = Some(change.with_proposal(&released));
                outcome.released = Some(released);
            } else {
                outcome.contract_change = Some(change);
            }
        } else if outcome.classifications.contains(&Classification::ReleaseOccurred) {
            debug!("Release {} carries no contract change, skipping", tx.id);
        }

        Ok(outcome)
    }
}
