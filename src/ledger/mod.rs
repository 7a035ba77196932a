use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type AccountId = String;
pub type Amount = u128;

pub const UNIT_SCALE: u128 = 1_000_000_000_000_000_000; // 1 coin = 1e18 minimal units
const UNIT_DECIMALS: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds in account {account}: need {required}, have {available}")]
    InsufficientAccountFunds {
        account: AccountId,
        required: Amount,
        available: Amount,
    },
    #[error("unknown account {account}")]
    UnknownAccount { account: AccountId },
    #[error("balance overflow in account {account}")]
    BalanceOverflow { account: AccountId },
    #[error("account {account} is reserved for the contract")]
    ReservedAccount { account: AccountId },
}

impl LedgerError {
    pub fn reason(&self) -> &'static str {
        match self {
            LedgerError::InsufficientAccountFunds { .. } => "InsufficientValue",
            LedgerError::UnknownAccount { .. } => "UnknownAccount",
            LedgerError::BalanceOverflow { .. } => "BalanceOverflow",
            LedgerError::ReservedAccount { .. } => "ReservedAccount",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,
    #[error("amount {0:?} is not a non-negative decimal number")]
    Malformed(String),
    #[error("amount {0:?} has more than 18 fractional digits")]
    TooPrecise(String),
    #[error("amount {0:?} does not fit in the ledger's range")]
    Overflow(String),
}

/// Parses a decimal coin amount (`"0.02"`) into minimal units.
pub fn parse_amount(input: &str) -> Result<Amount, AmountError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(AmountError::Empty);
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if (whole.is_empty() && frac.is_empty())
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
    {
        return Err(AmountError::Malformed(s.to_string()));
    }
    if frac.len() > UNIT_DECIMALS {
        return Err(AmountError::TooPrecise(s.to_string()));
    }
    let overflow = || AmountError::Overflow(s.to_string());
    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().map_err(|_| overflow())?
    };
    let frac_units = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<width$}", width = UNIT_DECIMALS);
        padded.parse::<u128>().map_err(|_| overflow())?
    };
    whole_units
        .checked_mul(UNIT_SCALE)
        .and_then(|v| v.checked_add(frac_units))
        .ok_or_else(overflow)
}

/// Formats minimal units as a decimal coin amount without trailing zeros.
pub fn format_amount(amount: Amount) -> String {
    let whole = amount / UNIT_SCALE;
    let frac = amount % UNIT_SCALE;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:0width$}", width = UNIT_DECIMALS);
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Value movement capability handed to contract code. Transfers always
/// originate from the contract's own account.
pub trait LedgerPrimitive {
    fn transfer(&mut self, to: &AccountId, amount: Amount) -> Result<(), LedgerError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Emission {
        to: AccountId,
        amount: Amount,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InMemoryLedger {
    contract: AccountId,
    accounts: BTreeMap<AccountId, Amount>,
    events: Vec<LedgerEvent>,
}

impl InMemoryLedger {
    pub fn new(contract: impl Into<AccountId>) -> Self {
        Self {
            contract: contract.into(),
            accounts: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn contract_account(&self) -> &AccountId {
        &self.contract
    }

    pub fn balance_of(&self, account: &str) -> Amount {
        self.accounts.get(account).copied().unwrap_or(0)
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Mints `amount` into `account`. Used for genesis funding only; the
    /// contract account only ever holds donated value.
    pub fn credit_account(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        if *account == self.contract {
            return Err(LedgerError::ReservedAccount {
                account: account.clone(),
            });
        }
        self.deposit_into(account, amount)?;
        self.events.push(LedgerEvent::Emission {
            to: account.clone(),
            amount,
        });
        Ok(())
    }

    pub fn debit_account(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let balance = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| LedgerError::UnknownAccount {
                account: account.clone(),
            })?;
        if *balance < amount {
            return Err(LedgerError::InsufficientAccountFunds {
                account: account.clone(),
                required: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        Ok(())
    }

    pub fn transfer_between(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if amount == 0 {
            return Ok(());
        }
        // Check the credit side first so a failure leaves both balances untouched.
        let to_balance = self.balance_of(to);
        if to != from && to_balance.checked_add(amount).is_none() {
            return Err(LedgerError::BalanceOverflow {
                account: to.clone(),
            });
        }
        self.debit_account(from, amount)?;
        self.deposit_into(to, amount)?;
        self.events.push(LedgerEvent::Transfer {
            from: from.clone(),
            to: to.clone(),
            amount,
        });
        Ok(())
    }

    pub fn merkle_root(&self) -> [u8; 32] {
        let leaves = self
            .accounts
            .iter()
            .map(|(account, balance)| {
                let mut hasher = Sha256::new();
                hasher.update(b"acct");
                hasher.update(account.as_bytes());
                hasher.update(balance.to_le_bytes());
                hasher.finalize().into()
            })
            .collect();
        build_merkle(leaves)
    }

    fn deposit_into(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.accounts.entry(account.clone()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::BalanceOverflow {
                account: account.clone(),
            })?;
        Ok(())
    }
}

impl LedgerPrimitive for InMemoryLedger {
    fn transfer(&mut self, to: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let from = self.contract.clone();
        self.transfer_between(&from, to, amount)
    }
}

pub(crate) fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"adoption-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

/// Ledger double that records outgoing transfers and can be told to refuse them.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingLedger {
    pub transfers: Vec<(AccountId, Amount)>,
    pub refuse: bool,
}

#[cfg(test)]
impl LedgerPrimitive for RecordingLedger {
    fn transfer(&mut self, to: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        if self.refuse {
            return Err(LedgerError::InsufficientAccountFunds {
                account: "contract".into(),
                required: amount,
                available: 0,
            });
        }
        self.transfers.push((to.clone(), amount));
        Ok(())
    }
}
