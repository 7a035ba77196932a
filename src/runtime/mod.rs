use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::contracts::{AdoptionContract, AdoptionError, ContractEvent};
use crate::ledger::{AccountId, Amount, InMemoryLedger, LedgerError};

pub const CONTRACT_ACCOUNT: &str = "adoption-contract";

/// Identity and attached value of the account invoking a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallContext {
    pub caller: AccountId,
    pub value: Amount,
}

impl CallContext {
    pub fn new(caller: impl Into<AccountId>) -> Self {
        Self {
            caller: caller.into(),
            value: 0,
        }
    }

    pub fn with_value(mut self, value: Amount) -> Self {
        self.value = value;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Call {
    Register { name: String },
    Adopt { name: String },
    Donate,
    Claim,
}

impl Call {
    pub fn label(&self) -> &'static str {
        match self {
            Call::Register { .. } => "register",
            Call::Adopt { .. } => "adopt",
            Call::Donate => "donate",
            Call::Claim => "claim",
        }
    }

    fn is_payable(&self) -> bool {
        matches!(self, Call::Donate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Reverted(#[from] AdoptionError),
    #[error("{call} does not accept attached value")]
    NonPayable { call: &'static str },
    #[error("account {account} is reserved for the contract and cannot make calls")]
    ReservedCaller { account: AccountId },
    #[error("cannot attach value: {0}")]
    Ledger(#[from] LedgerError),
}

impl RuntimeError {
    pub fn reason(&self) -> &'static str {
        match self {
            RuntimeError::Reverted(err) => err.reason(),
            RuntimeError::NonPayable { .. } => "NonPayable",
            RuntimeError::ReservedCaller { .. } => "ReservedCaller",
            RuntimeError::Ledger(err) => err.reason(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Accepted { events: Vec<ContractEvent> },
    Rejected { reason: String, message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallReceipt {
    pub sequence: u64,
    pub caller: AccountId,
    pub call: Call,
    pub value: Amount,
    pub outcome: CallOutcome,
    #[serde(with = "serde_digest")]
    pub digest: [u8; 32],
}

impl CallReceipt {
    fn compute_digest(
        previous: Option<&[u8; 32]>,
        sequence: u64,
        caller: &str,
        call: &Call,
        value: Amount,
        outcome: &CallOutcome,
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"receipt");
        hasher.update(previous.copied().unwrap_or([0u8; 32]));
        hasher.update(sequence.to_le_bytes());
        update_str(&mut hasher, caller);
        update_str(&mut hasher, call.label());
        if let Call::Register { name } | Call::Adopt { name } = call {
            update_str(&mut hasher, name);
        }
        hasher.update(value.to_le_bytes());
        match outcome {
            CallOutcome::Accepted { events } => {
                hasher.update(b"accepted");
                hasher.update((events.len() as u64).to_le_bytes());
                for event in events {
                    update_event(&mut hasher, event);
                }
            }
            CallOutcome::Rejected { reason, message } => {
                hasher.update(b"rejected");
                update_str(&mut hasher, reason);
                update_str(&mut hasher, message);
            }
        }
        hasher.finalize().into()
    }
}

fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn update_event(hasher: &mut Sha256, event: &ContractEvent) {
    match event {
        ContractEvent::PetRegistered { name, owner } => {
            hasher.update(b"registered");
            update_str(hasher, name.as_str());
            update_str(hasher, owner);
        }
        ContractEvent::PetAdopted {
            name,
            previous_owner,
            new_owner,
        } => {
            hasher.update(b"adopted");
            update_str(hasher, name.as_str());
            update_str(hasher, previous_owner);
            update_str(hasher, new_owner);
        }
        ContractEvent::DonationReceived { donor, amount } => {
            hasher.update(b"donation");
            update_str(hasher, donor);
            hasher.update(amount.to_le_bytes());
        }
        ContractEvent::AwardClaimed { claimant, amount } => {
            hasher.update(b"award");
            update_str(hasher, claimant);
            hasher.update(amount.to_le_bytes());
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiptChainError {
    #[error("receipt {index} has sequence {found}, expected {index}")]
    OutOfOrder { index: usize, found: u64 },
    #[error("receipt {sequence} digest does not match its contents")]
    DigestMismatch { sequence: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StateFileError {
    #[error("cannot access state file: {0}")]
    Io(#[from] io::Error),
    #[error("state file is not valid: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state file receipts are corrupt: {0}")]
    Chain(#[from] ReceiptChainError),
}

/// Serializes calls against the adoption contract and its value ledger.
///
/// Every call runs to completion before the next one starts. A call that
/// fails is rolled back entirely, attached value included, and still leaves
/// a `Rejected` receipt behind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Runtime {
    contract: AdoptionContract,
    ledger: InMemoryLedger,
    receipts: Vec<CallReceipt>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            contract: AdoptionContract::new(),
            ledger: InMemoryLedger::new(CONTRACT_ACCOUNT),
            receipts: Vec::new(),
        }
    }

    pub fn contract(&self) -> &AdoptionContract {
        &self.contract
    }

    pub fn ledger(&self) -> &InMemoryLedger {
        &self.ledger
    }

    pub fn receipts(&self) -> &[CallReceipt] {
        &self.receipts
    }

    /// Genesis credit for an external account.
    pub fn fund(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        self.ledger.credit_account(account, amount)?;
        info!(account = %account, amount, "account funded");
        Ok(())
    }

    pub fn execute(&mut self, ctx: &CallContext, call: Call) -> Result<Vec<ContractEvent>, RuntimeError> {
        let snapshot = (self.contract.clone(), self.ledger.clone());
        let result = self.dispatch(ctx, &call);

        let outcome = match &result {
            Ok(events) => {
                info!(
                    caller = %ctx.caller,
                    call = call.label(),
                    value = ctx.value,
                    events = events.len(),
                    "call committed"
                );
                CallOutcome::Accepted {
                    events: events.clone(),
                }
            }
            Err(err) => {
                (self.contract, self.ledger) = snapshot;
                warn!(
                    caller = %ctx.caller,
                    call = call.label(),
                    reason = err.reason(),
                    "call reverted: {err}"
                );
                CallOutcome::Rejected {
                    reason: err.reason().to_string(),
                    message: err.to_string(),
                }
            }
        };
        self.record(ctx, call, outcome);
        result
    }

    fn dispatch(&mut self, ctx: &CallContext, call: &Call) -> Result<Vec<ContractEvent>, RuntimeError> {
        // The pool must stay backed by value that really left another account.
        if ctx.caller == *self.ledger.contract_account() {
            return Err(RuntimeError::ReservedCaller {
                account: ctx.caller.clone(),
            });
        }
        if ctx.value > 0 {
            if !call.is_payable() {
                return Err(RuntimeError::NonPayable { call: call.label() });
            }
            let contract_account = self.ledger.contract_account().clone();
            self.ledger
                .transfer_between(&ctx.caller, &contract_account, ctx.value)?;
        }
        match call {
            Call::Register { name } => self.contract.register_item(name, &ctx.caller)?,
            Call::Adopt { name } => self.contract.transfer_ownership(name, &ctx.caller)?,
            Call::Donate => self.contract.deposit(&ctx.caller, ctx.value)?,
            Call::Claim => {
                self.contract.claim(&ctx.caller, &mut self.ledger)?;
            }
        }
        Ok(self.contract.take_events())
    }

    fn record(&mut self, ctx: &CallContext, call: Call, outcome: CallOutcome) {
        let previous = self.receipts.last().map(|r| r.digest);
        let sequence = self.receipts.len() as u64;
        let digest = CallReceipt::compute_digest(
            previous.as_ref(),
            sequence,
            &ctx.caller,
            &call,
            ctx.value,
            &outcome,
        );
        self.receipts.push(CallReceipt {
            sequence,
            caller: ctx.caller.clone(),
            call,
            value: ctx.value,
            outcome,
            digest,
        });
    }

    pub fn verify_receipts(&self) -> Result<(), ReceiptChainError> {
        let mut previous: Option<[u8; 32]> = None;
        for (index, receipt) in self.receipts.iter().enumerate() {
            if receipt.sequence != index as u64 {
                return Err(ReceiptChainError::OutOfOrder {
                    index,
                    found: receipt.sequence,
                });
            }
            let expected = CallReceipt::compute_digest(
                previous.as_ref(),
                receipt.sequence,
                &receipt.caller,
                &receipt.call,
                receipt.value,
                &receipt.outcome,
            );
            if expected != receipt.digest {
                return Err(ReceiptChainError::DigestMismatch {
                    sequence: receipt.sequence,
                });
            }
            previous = Some(receipt.digest);
        }
        Ok(())
    }

    /// Commitment over contract state and ledger balances.
    pub fn state_root(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"adoption-state");
        hasher.update(self.ledger.merkle_root());
        hasher.update((self.contract.registry().len() as u64).to_le_bytes());
        for (name, owner) in self.contract.list_all() {
            update_str(&mut hasher, name.as_str());
            update_str(&mut hasher, owner);
        }
        hasher.update(self.contract.pool_balance().to_le_bytes());
        for (account, count) in self.contract.credits().iter() {
            update_str(&mut hasher, account);
            hasher.update(count.to_le_bytes());
        }
        hasher.finalize().into()
    }

    /// Loads the runtime from `path`, or starts a fresh one if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, StateFileError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(err.into()),
        };
        let runtime: Runtime = serde_json::from_slice(&bytes)?;
        runtime.verify_receipts()?;
        Ok(runtime)
    }

    pub fn save(&self, path: &Path) -> Result<(), StateFileError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub(crate) mod serde_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("digest must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::UNIT_SCALE;

    const CENT: Amount = UNIT_SCALE / 100;

    fn funded_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        for account in ["alice", "bob"] {
            runtime.fund(&account.to_string(), UNIT_SCALE).unwrap();
        }
        runtime
    }

    fn register(name: &str) -> Call {
        Call::Register { name: name.into() }
    }

    fn adopt(name: &str) -> Call {
        Call::Adopt { name: name.into() }
    }

    #[test]
    fn donation_then_claim_moves_value_through_the_ledger() {
        let mut runtime = funded_runtime();
        let alice = CallContext::new("alice");
        let bob = CallContext::new("bob");

        runtime
            .execute(&alice.clone().with_value(2 * CENT), Call::Donate)
            .unwrap();
        runtime.execute(&alice, register("goofy")).unwrap();
        runtime.execute(&bob, adopt("goofy")).unwrap();
        let events = runtime.execute(&bob, Call::Claim).unwrap();

        assert_eq!(
            events,
            vec![ContractEvent::AwardClaimed {
                claimant: "bob".into(),
                amount: CENT
            }]
        );
        assert_eq!(runtime.ledger().balance_of("bob"), UNIT_SCALE + CENT);
        assert_eq!(runtime.ledger().balance_of("alice"), UNIT_SCALE - 2 * CENT);
        assert_eq!(runtime.ledger().balance_of(CONTRACT_ACCOUNT), CENT);
        assert_eq!(runtime.contract().pool_balance(), CENT);
        assert_eq!(runtime.contract().credits_of("bob"), 0);
        assert_eq!(runtime.receipts().len(), 4);
    }

    #[test]
    fn rejected_call_rolls_back_and_leaves_a_receipt() {
        let mut runtime = funded_runtime();
        let alice = CallContext::new("alice");
        runtime.execute(&alice, register("mickey")).unwrap();
        let root = runtime.state_root();

        let err = runtime.execute(&alice, register("mickey")).unwrap_err();
        assert_eq!(err.reason(), "DuplicateItem");
        assert_eq!(runtime.state_root(), root);

        let last = runtime.receipts().last().unwrap();
        assert_eq!(last.sequence, 1);
        assert_eq!(
            last.outcome,
            CallOutcome::Rejected {
                reason: "DuplicateItem".into(),
                message: "A pet with this name is already exists.".into(),
            }
        );
        runtime.verify_receipts().unwrap();
    }

    #[test]
    fn value_attached_to_non_payable_call_is_refused() {
        let mut runtime = funded_runtime();
        let alice = CallContext::new("alice").with_value(CENT);
        let err = runtime.execute(&alice, register("mickey")).unwrap_err();
        assert_eq!(err, RuntimeError::NonPayable { call: "register" });
        assert_eq!(runtime.ledger().balance_of("alice"), UNIT_SCALE);
        assert!(runtime.contract().registry().is_empty());
    }

    #[test]
    fn donation_beyond_caller_balance_is_refused() {
        let mut runtime = funded_runtime();
        let carol = CallContext::new("carol").with_value(CENT);
        let err = runtime.execute(&carol, Call::Donate).unwrap_err();
        assert_eq!(err.reason(), "UnknownAccount");
        assert_eq!(runtime.contract().pool_balance(), 0);
        assert_eq!(runtime.ledger().balance_of(CONTRACT_ACCOUNT), 0);
    }

    #[test]
    fn contract_account_cannot_call_or_be_funded() {
        let mut runtime = funded_runtime();
        let contract = CallContext::new(CONTRACT_ACCOUNT);

        let err = runtime.fund(&CONTRACT_ACCOUNT.to_string(), 100).unwrap_err();
        assert_eq!(err.reason(), "ReservedAccount");

        runtime
            .execute(&CallContext::new("alice").with_value(100), Call::Donate)
            .unwrap();
        let err = runtime
            .execute(&contract.clone().with_value(100), Call::Donate)
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::ReservedCaller {
                account: CONTRACT_ACCOUNT.into()
            }
        );
        assert_eq!(runtime.execute(&contract, Call::Donate).unwrap_err().reason(), "ReservedCaller");

        runtime.execute(&CallContext::new("alice"), register("goofy")).unwrap();
        let err = runtime.execute(&contract, adopt("goofy")).unwrap_err();
        assert_eq!(err.reason(), "ReservedCaller");
        assert_eq!(runtime.contract().credits_of(CONTRACT_ACCOUNT), 0);
        assert_eq!(runtime.execute(&contract, Call::Claim).unwrap_err().reason(), "ReservedCaller");

        runtime.execute(&CallContext::new("bob"), adopt("goofy")).unwrap();
        runtime.execute(&CallContext::new("bob"), Call::Claim).unwrap();

        assert_eq!(runtime.contract().pool_balance(), 50);
        assert!(runtime.contract().pool_balance() <= runtime.ledger().balance_of(CONTRACT_ACCOUNT));
        assert_eq!(runtime.ledger().balance_of(CONTRACT_ACCOUNT), 50);

        let last_rejected = runtime
            .receipts()
            .iter()
            .rev()
            .find(|r| r.caller == CONTRACT_ACCOUNT)
            .unwrap();
        assert!(matches!(
            &last_rejected.outcome,
            CallOutcome::Rejected { reason, .. } if reason == "ReservedCaller"
        ));
        runtime.verify_receipts().unwrap();
    }

    #[test]
    fn ledger_failures_report_their_own_reason() {
        let mut runtime = funded_runtime();
        let err = runtime
            .execute(&CallContext::new("carol").with_value(1), Call::Donate)
            .unwrap_err();
        assert_eq!(err.reason(), "UnknownAccount");

        let err = runtime
            .execute(&CallContext::new("alice").with_value(2 * UNIT_SCALE), Call::Donate)
            .unwrap_err();
        assert_eq!(err.reason(), "InsufficientValue");
    }

    #[test]
    fn failed_claim_keeps_credit_and_pool() {
        let mut runtime = funded_runtime();
        runtime.execute(&CallContext::new("alice"), register("goofy")).unwrap();
        runtime.execute(&CallContext::new("bob"), adopt("goofy")).unwrap();
        let err = runtime.execute(&CallContext::new("bob"), Call::Claim).unwrap_err();
        assert_eq!(err, RuntimeError::Reverted(AdoptionError::InsufficientDonations));
        assert_eq!(runtime.contract().credits_of("bob"), 1);

        let err = runtime.execute(&CallContext::new("alice"), Call::Claim).unwrap_err();
        assert_eq!(err.reason(), "NoAdoptionCredit");
    }

    #[test]
    fn tampered_receipts_are_detected() {
        let mut runtime = funded_runtime();
        runtime.execute(&CallContext::new("alice"), register("goofy")).unwrap();
        runtime.execute(&CallContext::new("bob"), adopt("goofy")).unwrap();
        runtime.verify_receipts().unwrap();

        let mut forged = runtime.clone();
        forged.receipts[0].caller = "mallory".into();
        assert!(matches!(
            forged.verify_receipts(),
            Err(ReceiptChainError::DigestMismatch { sequence: 0 })
        ));

        let mut reordered = runtime.clone();
        reordered.receipts.swap(0, 1);
        assert!(matches!(
            reordered.verify_receipts(),
            Err(ReceiptChainError::OutOfOrder { index: 0, found: 1 })
        ));
    }

    #[test]
    fn state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let fresh = Runtime::load_or_default(&path).unwrap();
        assert_eq!(fresh, Runtime::new());

        let mut runtime = funded_runtime();
        runtime
            .execute(&CallContext::new("alice").with_value(CENT), Call::Donate)
            .unwrap();
        runtime.execute(&CallContext::new("alice"), register("mickey")).unwrap();
        runtime.save(&path).unwrap();

        let loaded = Runtime::load_or_default(&path).unwrap();
        assert_eq!(loaded, runtime);
        assert_eq!(loaded.state_root(), runtime.state_root());
    }
}
