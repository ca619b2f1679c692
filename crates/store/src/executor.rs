//! Transaction executor.
//!
//! `Store` wraps a `Database` and runs closures inside one atomic scope:
//! either every operation the closure performs commits, or none does.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use bank_core::{
    Account, AccountId, Entry, EntryId, LedgerError, LedgerResult, Transfer, TransferId, User,
    VerifyEmail, VerifyEmailId,
};

use crate::queries::{
    CreateAccountParams, CreateVerifyEmailParams, Database, Page, Queries, Transaction,
    UpdateUserParams,
};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on attempts made by `exec_tx_with_retry` (minimum 1).
    pub max_tx_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_tx_attempts: 3 }
    }
}

/// Entry point to the ledger: atomic scopes plus the ledger transactions
/// built on them (`transfer_tx`, `create_user_tx`, `verify_email_tx`).
#[derive(Debug, Clone)]
pub struct Store<D> {
    db: D,
    config: StoreConfig,
}

impl<D: Database> Store<D> {
    pub fn new(db: D) -> Self {
        Self::with_config(db, StoreConfig::default())
    }

    pub fn with_config(db: D, config: StoreConfig) -> Self {
        Self { db, config }
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Run `f` inside a single atomic scope.
    ///
    /// On `Err` the scope is rolled back and the closure's error returned; if
    /// the rollback fails too, both errors are returned together as
    /// `LedgerError::RollbackFailed`. On `Ok` the scope is committed before
    /// returning and a commit failure becomes the result.
    pub async fn exec_tx<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: for<'c> FnOnce(&'c mut dyn Queries) -> BoxFuture<'c, LedgerResult<T>> + Send,
        T: Send,
    {
        let mut tx = self.db.begin().await?;
        let result = f(tx.queries()).await;
        finish(tx, result).await
    }

    /// Like `exec_tx`, but a `Retryable` failure rolls the scope back and runs
    /// `f` again in a fresh scope, up to `max_tx_attempts` attempts in total.
    pub async fn exec_tx_with_retry<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: for<'c> Fn(&'c mut dyn Queries) -> BoxFuture<'c, LedgerResult<T>> + Send + Sync,
        T: Send,
    {
        let max_attempts = self.config.max_tx_attempts.max(1);
        let mut attempt = 1;

        loop {
            let mut tx = self.db.begin().await?;
            let result = f(tx.queries()).await;

            match finish(tx, result).await {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %err, "transaction conflict; retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn create_account(&self, arg: CreateAccountParams) -> LedgerResult<Account> {
        self.exec_tx(move |q| q.create_account(arg)).await
    }

    pub async fn get_account(&self, id: AccountId) -> LedgerResult<Account> {
        self.exec_tx(move |q| q.get_account(id)).await
    }

    pub async fn list_accounts(&self, owner: &str, page: Page) -> LedgerResult<Vec<Account>> {
        let owner = owner.to_string();
        self.exec_tx(move |q| Box::pin(async move { q.list_accounts(&owner, page).await }))
            .await
    }

    pub async fn get_entry(&self, id: EntryId) -> LedgerResult<Entry> {
        self.exec_tx(move |q| q.get_entry(id)).await
    }

    pub async fn list_entries(&self, account_id: AccountId, page: Page) -> LedgerResult<Vec<Entry>> {
        self.exec_tx(move |q| q.list_entries(account_id, page)).await
    }

    pub async fn get_transfer(&self, id: TransferId) -> LedgerResult<Transfer> {
        self.exec_tx(move |q| q.get_transfer(id)).await
    }

    pub async fn list_transfers(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>> {
        self.exec_tx(move |q| q.list_transfers(account_id, page)).await
    }

    pub async fn get_user(&self, username: &str) -> LedgerResult<User> {
        let username = username.to_string();
        self.exec_tx(move |q| Box::pin(async move { q.get_user(&username).await }))
            .await
    }

    pub async fn update_user(&self, arg: UpdateUserParams) -> LedgerResult<User> {
        self.exec_tx(move |q| q.update_user(arg)).await
    }

    pub async fn create_verify_email(
        &self,
        arg: CreateVerifyEmailParams,
    ) -> LedgerResult<VerifyEmail> {
        self.exec_tx(move |q| q.create_verify_email(arg)).await
    }

    pub async fn get_verify_email(&self, id: VerifyEmailId) -> LedgerResult<VerifyEmail> {
        self.exec_tx(move |q| q.get_verify_email(id)).await
    }
}

async fn finish<T>(mut tx: Box<dyn Transaction>, result: LedgerResult<T>) -> LedgerResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => match tx.rollback().await {
            Ok(()) => {
                debug!(error = %err, "transaction rolled back");
                Err(err)
            }
            Err(rollback) => Err(LedgerError::rollback_failed(err, rollback)),
        },
    }
}
