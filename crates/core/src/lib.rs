//! `bank-core` — ledger domain building blocks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, records, the currency value object and the error taxonomy
//! shared by the store and the worker.

pub mod currency;
pub mod error;
pub mod id;
pub mod model;

pub use currency::Currency;
pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use id::{AccountId, EntryId, TransferId, VerifyEmailId};
pub use model::{Account, Entry, Role, Transfer, User, VerifyEmail, VERIFY_EMAIL_TTL_MINUTES};
