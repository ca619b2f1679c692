//! Ledger records.
//!
//! Entries and transfers are immutable once written. Accounts only change
//! through balance updates; their currency never changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::currency::Currency;
use crate::error::LedgerError;
use crate::id::{AccountId, EntryId, TransferId, VerifyEmailId};

/// How long a verification code stays usable.
pub const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

/// A balance held in one currency by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    /// Minor units (e.g. cents).
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// One signed balance movement on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// Positive = credit, negative = debit.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A movement of `amount` from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Always positive.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Depositor,
    Banker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Depositor => "depositor",
            Role::Banker => "banker",
        }
    }
}

impl core::str::FromStr for Role {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "depositor" => Ok(Role::Depositor),
            "banker" => Ok(Role::Banker),
            other => Err(LedgerError::invalid_input(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Opaque to the ledger; hashing happens upstream.
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A one-time email verification code issued to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmail {
    pub id: VerifyEmailId,
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl VerifyEmail {
    /// Whether `secret_code` may still consume this record at `now`.
    pub fn accepts(&self, secret_code: &str, now: DateTime<Utc>) -> bool {
        !self.is_used && self.secret_code == secret_code && self.expired_at > now
    }
}
