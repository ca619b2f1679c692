//! Ledger store boundary.
//!
//! `Queries` is the row-level surface every backend provides. A `Database`
//! hands out `Transaction`s; each transaction exposes its `Queries` bound to
//! that atomic scope. Nothing written through a transaction is visible to
//! other transactions until `commit` returns.
//!
//! ## Implementation Requirements
//!
//! Backends must:
//! - keep uncommitted writes private to their transaction
//! - hold the row lock taken by `add_account_balance` until commit or
//!   rollback
//! - discard all writes when a transaction is dropped without `commit`
//! - make tasks written by `enqueue_task` claimable only once the scope
//!   commits, and never if it rolls back
//! - report uniqueness violations as `Conflict`, missing referenced rows as
//!   `NotFound`, and retry-safe concurrency aborts as `Retryable`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use bank_core::{
    Account, AccountId, Currency, Entry, EntryId, LedgerResult, Role, Transfer, TransferId, User,
    VerifyEmail, VerifyEmailId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
}

/// Partial user update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateUserParams {
    pub username: String,
    pub hashed_password: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

impl UpdateUserParams {
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub(crate) fn apply(&self, user: &mut User) {
        if let Some(hash) = &self.hashed_password {
            user.hashed_password = hash.clone();
        }
        if let Some(at) = self.password_changed_at {
            user.password_changed_at = at;
        }
        if let Some(name) = &self.full_name {
            user.full_name = name.clone();
        }
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        if let Some(verified) = self.is_email_verified {
            user.is_email_verified = verified;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
}

/// A background task written in the same scope as the ledger change that
/// produced it (transactional outbox). Becomes a `pending` task on commit.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueTaskParams {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Limit/offset window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    pub(crate) fn slice<T>(&self, rows: Vec<T>) -> Vec<T> {
        rows.into_iter()
            .skip(self.offset.max(0) as usize)
            .take(self.limit.max(0) as usize)
            .collect()
    }
}

/// Row-level ledger operations.
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, arg: CreateAccountParams) -> LedgerResult<Account>;

    async fn get_account(&mut self, id: AccountId) -> LedgerResult<Account>;

    async fn list_accounts(&mut self, owner: &str, page: Page) -> LedgerResult<Vec<Account>>;

    /// Add `amount` (signed) to the balance, taking the row lock.
    async fn add_account_balance(&mut self, id: AccountId, amount: i64) -> LedgerResult<Account>;

    async fn create_entry(&mut self, arg: CreateEntryParams) -> LedgerResult<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> LedgerResult<Entry>;

    async fn list_entries(&mut self, account_id: AccountId, page: Page) -> LedgerResult<Vec<Entry>>;

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> LedgerResult<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> LedgerResult<Transfer>;

    /// Transfers where `account_id` is either side.
    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>>;

    async fn create_user(&mut self, arg: CreateUserParams) -> LedgerResult<User>;

    async fn get_user(&mut self, username: &str) -> LedgerResult<User>;

    async fn update_user(&mut self, arg: UpdateUserParams) -> LedgerResult<User>;

    async fn create_verify_email(&mut self, arg: CreateVerifyEmailParams)
    -> LedgerResult<VerifyEmail>;

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> LedgerResult<VerifyEmail>;

    /// Mark the record used if `secret_code` matches, it is unused and not
    /// expired. Returns `None` when any of those conditions fails.
    async fn update_verify_email(
        &mut self,
        id: VerifyEmailId,
        secret_code: &str,
    ) -> LedgerResult<Option<VerifyEmail>>;

    /// Stage a task that is published if and only if this scope commits.
    async fn enqueue_task(&mut self, arg: EnqueueTaskParams) -> LedgerResult<()>;
}

/// An open atomic scope.
#[async_trait]
pub trait Transaction: Send {
    /// Operations bound to this scope.
    fn queries(&mut self) -> &mut dyn Queries;

    async fn commit(&mut self) -> LedgerResult<()>;

    async fn rollback(&mut self) -> LedgerResult<()>;
}

/// A backend able to open atomic scopes.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> LedgerResult<Box<dyn Transaction>>;
}

#[async_trait]
impl<D> Database for std::sync::Arc<D>
where
    D: Database + ?Sized,
{
    async fn begin(&self) -> LedgerResult<Box<dyn Transaction>> {
        (**self).begin().await
    }
}
