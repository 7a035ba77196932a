use std::{
    borrow::Borrow,
    collections::BTreeMap,
    fmt,
    mem,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ledger::{AccountId, Amount, LedgerError, LedgerPrimitive};

/// Every way a contract operation can be refused. A refused operation has
/// changed nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdoptionError {
    #[error("A pet with this name is already exists.")]
    DuplicateItem { name: String },
    #[error("The pet isn't available to be adopted.")]
    ItemNotFound { name: String },
    #[error("You already are the owner of this pet.")]
    AlreadyOwner { name: String },
    #[error("You need to adopt a pet before.")]
    NoAdoptionCredit,
    #[error("There are not enough donations to your award.")]
    InsufficientDonations,
    #[error("The pet needs a name.")]
    EmptyName,
    #[error("donation pool would overflow")]
    PoolOverflow,
    #[error("award transfer failed: {0}")]
    Ledger(#[from] LedgerError),
}

impl AdoptionError {
    /// Stable tag naming the failure class.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::DuplicateItem { .. } => "DuplicateItem",
            Self::ItemNotFound { .. } => "ItemNotFound",
            Self::AlreadyOwner { .. } => "AlreadyOwner",
            Self::NoAdoptionCredit => "NoAdoptionCredit",
            Self::InsufficientDonations => "InsufficientDonations",
            Self::EmptyName => "EmptyName",
            Self::PoolOverflow => "PoolOverflow",
            Self::Ledger(_) => "LedgerTransferFailed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PetName(String);

impl PetName {
    pub fn new(name: impl Into<String>) -> Result<Self, AdoptionError> {
        let name = name.into();
        if name.is_empty() {
            return Err(AdoptionError::EmptyName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PetName {
    type Error = AdoptionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PetName> for String {
    fn from(name: PetName) -> Self {
        name.0
    }
}

impl Borrow<str> for PetName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemRecord {
    pub name: PetName,
    pub owner: AccountId,
}

#[derive(Debug, thiserror::Error)]
#[error("pet {0} is registered twice")]
pub struct DuplicateRecord(PetName);

/// Pets in order of first registration, indexed by name.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Vec<ItemRecord>", into = "Vec<ItemRecord>")]
pub struct Registry {
    records: Vec<ItemRecord>,
    index: BTreeMap<PetName, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn owner_of(&self, name: &str) -> Option<&AccountId> {
        self.index.get(name).map(|&idx| &self.records[idx].owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemRecord> + '_ {
        self.records.iter()
    }

    fn insert(&mut self, name: PetName, owner: AccountId) -> Result<(), DuplicateRecord> {
        if self.index.contains_key(&name) {
            return Err(DuplicateRecord(name));
        }
        self.index.insert(name.clone(), self.records.len());
        self.records.push(ItemRecord { name, owner });
        Ok(())
    }

    /// Replaces the owner of a registered pet, returning the previous one.
    fn reassign(&mut self, name: &str, owner: AccountId) -> Option<AccountId> {
        let idx = *self.index.get(name)?;
        Some(mem::replace(&mut self.records[idx].owner, owner))
    }
}

impl TryFrom<Vec<ItemRecord>> for Registry {
    type Error = DuplicateRecord;

    fn try_from(records: Vec<ItemRecord>) -> Result<Self, Self::Error> {
        let mut registry = Registry::new();
        for record in records {
            registry.insert(record.name, record.owner)?;
        }
        Ok(registry)
    }
}

impl From<Registry> for Vec<ItemRecord> {
    fn from(registry: Registry) -> Self {
        registry.records
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DonationPool {
    balance: Amount,
}

impl DonationPool {
    pub fn balance(&self) -> Amount {
        self.balance
    }

    /// Half the balance, rounded down.
    pub fn award(&self) -> Amount {
        self.balance / 2
    }
}

#[derive(Debug, thiserror::Error)]
#[error("account {0} holds a zero credit entry")]
pub struct ZeroCredit(AccountId);

/// Outstanding adoption credits. Accounts with no credit are absent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    try_from = "BTreeMap<AccountId, u64>",
    into = "BTreeMap<AccountId, u64>"
)]
pub struct ClaimCredits {
    credits: BTreeMap<AccountId, u64>,
}

impl TryFrom<BTreeMap<AccountId, u64>> for ClaimCredits {
    type Error = ZeroCredit;

    fn try_from(credits: BTreeMap<AccountId, u64>) -> Result<Self, Self::Error> {
        if let Some((account, _)) = credits.iter().find(|(_, count)| **count == 0) {
            return Err(ZeroCredit(account.clone()));
        }
        Ok(Self { credits })
    }
}

impl From<ClaimCredits> for BTreeMap<AccountId, u64> {
    fn from(credits: ClaimCredits) -> Self {
        credits.credits
    }
}

impl ClaimCredits {
    pub fn credits_of(&self, account: &str) -> u64 {
        self.credits.get(account).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, u64)> + '_ {
        self.credits.iter().map(|(account, count)| (account, *count))
    }

    fn grant(&mut self, account: &AccountId) {
        let count = self.credits.entry(account.clone()).or_insert(0);
        *count = count.saturating_add(1);
    }

    fn consume(&mut self, account: &str) {
        if let Some(count) = self.credits.get_mut(account) {
            *count -= 1;
            if *count == 0 {
                self.credits.remove(account);
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractEvent {
    PetRegistered {
        name: PetName,
        owner: AccountId,
    },
    PetAdopted {
        name: PetName,
        previous_owner: AccountId,
        new_owner: AccountId,
    },
    DonationReceived {
        donor: AccountId,
        amount: Amount,
    },
    AwardClaimed {
        claimant: AccountId,
        amount: Amount,
    },
}

/// The whole adoption state: registry, donation pool and claim credits.
///
/// Each operation validates every precondition before it touches any field,
/// so an `Err` always leaves the contract exactly as it was. Events from
/// successful operations queue up until [`AdoptionContract::take_events`].
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdoptionContract {
    registry: Registry,
    pool: DonationPool,
    credits: ClaimCredits,
    #[serde(skip)]
    pending_events: Vec<ContractEvent>,
}

impl AdoptionContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn credits(&self) -> &ClaimCredits {
        &self.credits
    }

    pub fn register_item(&mut self, name: &str, caller: &AccountId) -> Result<(), AdoptionError> {
        let name = PetName::new(name)?;
        self.registry
            .insert(name.clone(), caller.clone())
            .map_err(|DuplicateRecord(name)| AdoptionError::DuplicateItem {
                name: name.to_string(),
            })?;
        debug!(pet = %name, owner = %caller, "pet registered");
        self.pending_events.push(ContractEvent::PetRegistered {
            name,
            owner: caller.clone(),
        });
        Ok(())
    }

    pub fn transfer_ownership(&mut self, name: &str, caller: &AccountId) -> Result<(), AdoptionError> {
        let owner = self
            .registry
            .owner_of(name)
            .ok_or_else(|| AdoptionError::ItemNotFound {
                name: name.to_string(),
            })?;
        if owner == caller {
            return Err(AdoptionError::AlreadyOwner {
                name: name.to_string(),
            });
        }
        let previous_owner = self
            .registry
            .reassign(name, caller.clone())
            .ok_or_else(|| AdoptionError::ItemNotFound {
                name: name.to_string(),
            })?;
        self.credits.grant(caller);
        debug!(pet = name, from = %previous_owner, to = %caller, "pet adopted");
        self.pending_events.push(ContractEvent::PetAdopted {
            name: PetName(name.to_string()),
            previous_owner,
            new_owner: caller.clone(),
        });
        Ok(())
    }

    pub fn owner_of(&self, name: &str) -> Result<&AccountId, AdoptionError> {
        self.registry
            .owner_of(name)
            .ok_or_else(|| AdoptionError::ItemNotFound {
                name: name.to_string(),
            })
    }

    /// `(name, owner)` pairs in first-registration order. Calling it again
    /// starts over from the first pet.
    pub fn list_all(&self) -> impl Iterator<Item = (&PetName, &AccountId)> + '_ {
        self.registry.iter().map(|record| (&record.name, &record.owner))
    }

    /// Adds the value attached to a call to the pool. Zero is accepted.
    pub fn deposit(&mut self, donor: &AccountId, amount: Amount) -> Result<(), AdoptionError> {
        let balance = self
            .pool
            .balance
            .checked_add(amount)
            .ok_or(AdoptionError::PoolOverflow)?;
        self.pool.balance = balance;
        self.pending_events.push(ContractEvent::DonationReceived {
            donor: donor.clone(),
            amount,
        });
        Ok(())
    }

    pub fn pool_balance(&self) -> Amount {
        self.pool.balance()
    }

    pub fn credits_of(&self, account: &str) -> u64 {
        self.credits.credits_of(account)
    }

    /// Pays half the pool to `caller` in exchange for one adoption credit.
    pub fn claim<L>(&mut self, caller: &AccountId, ledger: &mut L) -> Result<Amount, AdoptionError>
    where
        L: LedgerPrimitive + ?Sized,
    {
        if self.credits.credits_of(caller) == 0 {
            return Err(AdoptionError::NoAdoptionCredit);
        }
        let award = self.pool.award();
        if award == 0 {
            return Err(AdoptionError::InsufficientDonations);
        }
        debug!(claimant = %caller, award, pool = self.pool.balance, "claim checks passed");

        ledger.transfer(caller, award)?;

        self.pool.balance -= award;
        self.credits.consume(caller);
        self.pending_events.push(ContractEvent::AwardClaimed {
            claimant: caller.clone(),
            amount: award,
        });
        Ok(award)
    }

    pub fn take_events(&mut self) -> Vec<ContractEvent> {
        mem::take(&mut self.pending_events)
    }
}
