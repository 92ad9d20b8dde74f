//! Transaction Filtering
//!
//! Classifies mined transactions by the contract-lifecycle and governance
//! events they carry. Pure: decisions use only the transaction and the
//! configured contract addresses.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use serde::Serialize;
use tracing::debug;

use crate::config::ScanConfig;
use crate::transaction::{Log, Transaction};

/// Event emitted alongside a governance proposal
pub const PROPOSAL_CREATED_EVENT: &str = "ProposalCreated";

/// Event carrying the code of an implicit zero-contract proposal
pub const CODE_CHECK_REQUIRED_EVENT: &str = "CodeCheckRequired";

/// Zero contract methods the scanner tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZeroMethod {
    DeploySmartContract,
    DeploySystemSmartContract,
    UpdateSmartContract,
    ChangeContractAuthor,
    ChangeGenesisOwner,
    /// Raises the implicit code-check proposal
    ReleaseApprovedContract,
    /// Releases an implicit proposal once the code check passed
    ReleaseCodeCheckedContract,
}

impl ZeroMethod {
    /// Method name as it appears in `Transaction::method_name`
    pub fn name(&self) -> &'static str {
        match self {
            ZeroMethod::DeploySmartContract => "DeploySmartContract",
            ZeroMethod::DeploySystemSmartContract => "DeploySystemSmartContract",
            ZeroMethod::UpdateSmartContract => "UpdateSmartContract",
            ZeroMethod::ChangeContractAuthor => "ChangeContractAuthor",
            ZeroMethod::ChangeGenesisOwner => "ChangeGenesisOwner",
            ZeroMethod::ReleaseApprovedContract => "ReleaseApprovedContract",
            ZeroMethod::ReleaseCodeCheckedContract => "ReleaseCodeCheckedContract",
        }
    }

    /// Methods that change a contract directly
    pub fn is_contract_related(&self) -> bool {
        matches!(
            self,
            ZeroMethod::DeploySmartContract
                | ZeroMethod::DeploySystemSmartContract
                | ZeroMethod::UpdateSmartContract
                | ZeroMethod::ChangeContractAuthor
                | ZeroMethod::ChangeGenesisOwner
        )
    }

    /// Methods a governance proposal may target on the zero contract
    pub fn is_proposal_target(&self) -> bool {
        matches!(
            self,
            ZeroMethod::DeploySmartContract
                | ZeroMethod::DeploySystemSmartContract
                | ZeroMethod::UpdateSmartContract
        )
    }
}

static ZERO_METHODS: LazyLock<HashMap<&'static str, ZeroMethod>> = LazyLock::new(|| {
    [
        ZeroMethod::DeploySmartContract,
        ZeroMethod::DeploySystemSmartContract,
        ZeroMethod::UpdateSmartContract,
        ZeroMethod::ChangeContractAuthor,
        ZeroMethod::ChangeGenesisOwner,
        ZeroMethod::ReleaseApprovedContract,
        ZeroMethod::ReleaseCodeCheckedContract,
    ]
    .into_iter()
    .map(|m| (m.name(), m))
    .collect()
});

/// Look up a zero contract method by name
pub fn get_zero_method(name: &str) -> Option<ZeroMethod> {
    ZERO_METHODS.get(name).copied()
}

/// Governance controller methods the scanner tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerMethod {
    CreateProposal,
    Release,
}

impl ControllerMethod {
    /// Method name as it appears in `Transaction::method_name`
    pub fn name(&self) -> &'static str {
        match self {
            ControllerMethod::CreateProposal => "CreateProposal",
            ControllerMethod::Release => "Release",
        }
    }

    /// Parse a method name, `None` for anything else the controller exposes
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "CreateProposal" => Some(ControllerMethod::CreateProposal),
            "Release" => Some(ControllerMethod::Release),
            _ => None,
        }
    }
}

/// Zero contract events that describe a contract change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractEventName {
    ContractDeployed,
    CodeUpdated,
    AuthorChanged,
}

impl ContractEventName {
    pub fn name(&self) -> &'static str {
        match self {
            ContractEventName::ContractDeployed => "ContractDeployed",
            ContractEventName::CodeUpdated => "CodeUpdated",
            ContractEventName::AuthorChanged => "AuthorChanged",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ContractDeployed" => Some(ContractEventName::ContractDeployed),
            "CodeUpdated" => Some(ContractEventName::CodeUpdated),
            "AuthorChanged" => Some(ContractEventName::AuthorChanged),
            _ => None,
        }
    }
}

/// Why a transaction is of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Classification {
    ContractRelated,
    ProposalCreated,
    ReleaseOccurred,
    Irrelevant,
}

/// Relevance predicates over transactions
#[derive(Debug, Clone)]
pub struct TransactionFilter {
    config: Arc<ScanConfig>,
}

impl TransactionFilter {
    /// Create a filter over the configured zero and controller addresses
    pub fn new(config: Arc<ScanConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Every classification that applies, or `{Irrelevant}` when none does
    ///
    /// # Arguments
    /// * `tx` - A transaction with its logs already attached
    ///
    /// # Returns
    /// A non-empty set; only mined transactions can be anything but `Irrelevant`
    pub fn classify(&self, tx: &Transaction) -> BTreeSet<Classification> {
        let mut classes = BTreeSet::new();
        if tx.is_mined() {
            if self.is_contract_related(tx) {
                classes.insert(Classification::ContractRelated);
            }
            if self.is_explicit_proposal(tx) || self.is_implicit_proposal(tx) {
                classes.insert(Classification::ProposalCreated);
            }
            if self.is_release(tx) {
                classes.insert(Classification::ReleaseOccurred);
            }
        }
        if classes.is_empty() {
            classes.insert(Classification::Irrelevant);
        }
        debug!("Classified {} ({}): {:?}", tx.id, tx.method_name, classes);
        classes
    }

    /// Cheap pre-filter on status and method name, before logs are fetched
    pub fn is_candidate(&self, tx: &Transaction) -> bool {
        tx.is_mined()
            && (get_zero_method(&tx.method_name).is_some()
                || ControllerMethod::from_name(&tx.method_name).is_some())
    }

    /// First log announcing a contract change from the zero contract
    pub fn contract_log<'t>(&self, tx: &'t Transaction) -> Option<&'t Log> {
        tx.logs.iter().find(|log| {
            self.config.is_zero_contract(&log.address) && ContractEventName::from_name(&log.name).is_some()
        })
    }

    /// Whether the zero contract logged a contract change event
    pub fn is_contract_related(&self, tx: &Transaction) -> bool {
        self.contract_log(tx).is_some()
    }

    /// `CreateProposal` on the controller targeting a zero contract deploy or update
    ///
    /// Opaque parameters never qualify.
    pub fn is_explicit_proposal(&self, tx: &Transaction) -> bool {
        if !self.config.is_controller(&tx.to)
            || ControllerMethod::from_name(&tx.method_name) != Some(ControllerMethod::CreateProposal)
        {
            return false;
        }
        let params = tx.params();
        let targets_zero = params
            .str_field("toAddress")
            .is_some_and(|to| self.config.is_zero_contract(to));
        let targets_deploy = params
            .str_field("contractMethodName")
            .and_then(get_zero_method)
            .is_some_and(|m| m.is_proposal_target());
        targets_zero && targets_deploy
    }

    /// `ReleaseApprovedContract` on the zero contract
    pub fn is_implicit_proposal(&self, tx: &Transaction) -> bool {
        self.config.is_zero_contract(&tx.to)
            && get_zero_method(&tx.method_name) == Some(ZeroMethod::ReleaseApprovedContract)
    }

    /// `Release` on the controller, or `ReleaseCodeCheckedContract` on the zero contract
    pub fn is_release(&self, tx: &Transaction) -> bool {
        (self.config.is_controller(&tx.to)
            && ControllerMethod::from_name(&tx.method_name) == Some(ControllerMethod::Release))
            || (self.config.is_zero_contract(&tx.to)
                && get_zero_method(&tx.method_name) == Some(ZeroMethod::ReleaseCodeCheckedContract))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use serde_json::json;

    fn filter() -> TransactionFilter {
        TransactionFilter::new(Arc::new(test_config()))
    }

    fn tx(to: &str, method: &str, params: &str, logs: Vec<Log>) -> Transaction {
        Transaction {
            id: "tx".to_string(),
            from: "sender".to_string(),
            to: to.to_string(),
            method_name: method.to_string(),
            params_raw: params.to_string(),
            status: "MINED".to_string(),
            block_number: 100,
            time: "2021-06-01T00:00:00Z".to_string(),
            logs,
        }
    }

    fn log(address: &str, name: &str) -> Log {
        Log {
            address: address.to_string(),
            name: name.to_string(),
            indexed: vec![],
            non_indexed: String::new(),
        }
    }

    fn set(classes: &[Classification]) -> BTreeSet<Classification> {
        classes.iter().copied().collect()
    }

    // ==================== Method table tests ====================

    #[test]
    fn test_zero_method_lookup() {
        assert_eq!(get_zero_method("UpdateSmartContract"), Some(ZeroMethod::UpdateSmartContract));
        assert_eq!(get_zero_method("Transfer"), None);
        for method in ZERO_METHODS.values() {
            assert_eq!(get_zero_method(method.name()), Some(*method));
        }
    }

    #[test]
    fn test_proposal_targets_are_deploy_and_update() {
        assert!(ZeroMethod::DeploySystemSmartContract.is_proposal_target());
        assert!(!ZeroMethod::ChangeContractAuthor.is_proposal_target());
        assert!(ZeroMethod::ChangeGenesisOwner.is_contract_related());
        assert!(!ZeroMethod::ReleaseApprovedContract.is_contract_related());
    }

    // ==================== classify tests ====================

    #[test]
    fn test_not_mined_is_irrelevant() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let mut t = tx(&zero, "DeploySmartContract", "", vec![log(&zero, "ContractDeployed")]);
        t.status = "FAILED".to_string();
        assert_eq!(f.classify(&t), set(&[Classification::Irrelevant]));
    }

    #[test]
    fn test_deploy_with_contract_log_is_contract_related() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let t = tx(&zero, "DeploySmartContract", "", vec![log(&zero, "ContractDeployed")]);
        assert_eq!(f.classify(&t), set(&[Classification::ContractRelated]));
    }

    #[test]
    fn test_contract_log_from_other_address_ignored() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let t = tx(&zero, "DeploySmartContract", "", vec![log("elsewhere", "ContractDeployed")]);
        assert_eq!(f.classify(&t), set(&[Classification::Irrelevant]));
    }

    #[test]
    fn test_explicit_proposal() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let controller = f.config().controller.contract_address.clone();
        let params = json!({"toAddress": zero, "contractMethodName": "UpdateSmartContract"}).to_string();
        let t = tx(&controller, "CreateProposal", &params, vec![]);
        assert_eq!(f.classify(&t), set(&[Classification::ProposalCreated]));
    }

    #[test]
    fn test_explicit_proposal_wrong_target_method() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let controller = f.config().controller.contract_address.clone();
        let params = json!({"toAddress": zero, "contractMethodName": "ChangeGenesisOwner"}).to_string();
        assert!(!f.is_explicit_proposal(&tx(&controller, "CreateProposal", &params, vec![])));
    }

    #[test]
    fn test_explicit_proposal_wrong_target_address() {
        let f = filter();
        let controller = f.config().controller.contract_address.clone();
        let params = json!({"toAddress": "token", "contractMethodName": "DeploySmartContract"}).to_string();
        assert!(!f.is_explicit_proposal(&tx(&controller, "CreateProposal", &params, vec![])));
    }

    #[test]
    fn test_explicit_proposal_opaque_params_fail_closed() {
        let f = filter();
        let controller = f.config().controller.contract_address.clone();
        let t = tx(&controller, "CreateProposal", "{broken", vec![]);
        assert_eq!(f.classify(&t), set(&[Classification::Irrelevant]));
    }

    #[test]
    fn test_implicit_proposal() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let t = tx(&zero, "ReleaseApprovedContract", "", vec![]);
        assert_eq!(f.classify(&t), set(&[Classification::ProposalCreated]));
    }

    #[test]
    fn test_release_paths() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let controller = f.config().controller.contract_address.clone();
        assert!(f.is_release(&tx(&controller, "Release", "\"pid\"", vec![])));
        assert!(f.is_release(&tx(&zero, "ReleaseCodeCheckedContract", "", vec![])));
        assert!(!f.is_release(&tx(&zero, "Release", "", vec![])));
        assert!(!f.is_release(&tx(&controller, "ReleaseCodeCheckedContract", "", vec![])));
    }

    #[test]
    fn test_release_with_contract_log_has_both_classes() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let controller = f.config().controller.contract_address.clone();
        let t = tx(&controller, "Release", "\"pid\"", vec![log(&zero, "CodeUpdated")]);
        assert_eq!(
            f.classify(&t),
            set(&[Classification::ContractRelated, Classification::ReleaseOccurred])
        );
    }

    #[test]
    fn test_unrelated_method_is_irrelevant() {
        let f = filter();
        let t = tx("token", "Transfer", "{}", vec![log("token", "Transferred")]);
        assert_eq!(f.classify(&t), set(&[Classification::Irrelevant]));
    }

    // ==================== Pre-filter tests ====================

    #[test]
    fn test_is_candidate() {
        let f = filter();
        assert!(f.is_candidate(&tx("any", "ChangeContractAuthor", "", vec![])));
        assert!(f.is_candidate(&tx("any", "Release", "", vec![])));
        assert!(!f.is_candidate(&tx("any", "Transfer", "", vec![])));

        let mut failed = tx("any", "CreateProposal", "", vec![]);
        failed.status = "FAILED".to_string();
        assert!(!f.is_candidate(&failed));
    }

    #[test]
    fn test_contract_log_picks_first_qualifying() {
        let f = filter();
        let zero = f.config().zero_contract.clone();
        let t = tx(
            &zero,
            "UpdateSmartContract",
            "",
            vec![
                log(&zero, "CodeCheckRequired"),
                log(&zero, "CodeUpdated"),
                log(&zero, "AuthorChanged"),
            ],
        );
        assert_eq!(f.contract_log(&t).map(|l| l.name.as_str()), Some("CodeUpdated"));
    }
}
