//! Pet adoption registry.
//!
//! Three pieces of state live behind a single contract object:
//!
//! * the pet [`contracts::Registry`], ordered by first registration;
//! * the [`contracts::DonationPool`] filled by donations;
//! * [`contracts::ClaimCredits`], one credit per pet adopted from someone else,
//!   each redeemable for half of the pool.
//!
//! [`runtime::Runtime`] plays the execution environment: it runs one call at a
//! time against the contract and an [`ledger::InMemoryLedger`], rolls failed
//! calls back, and keeps a hash-chained receipt log.

pub mod config;
pub mod contracts;
pub mod ledger;
pub mod runtime;

pub use contracts::{AdoptionContract, AdoptionError, ContractEvent, PetName};
pub use ledger::{format_amount, parse_amount, AccountId, Amount, LedgerPrimitive, UNIT_SCALE};
pub use runtime::{Call, CallContext, CallReceipt, Runtime, RuntimeError};
