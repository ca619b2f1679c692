//! In-memory ledger backend.
//!
//! Intended for tests/dev. It keeps the isolation behaviour of the Postgres
//! backend so concurrency properties can be exercised without a database:
//!
//! - every transaction stages its writes privately and publishes them in one
//!   step on commit
//! - row locks (accounts, usernames, emails, verification records,
//!   owner/currency pairs) are held until commit or rollback
//! - waiting on a row lock is bounded by `lock_timeout`; expiry is reported as
//!   `LedgerError::Retryable`, the in-memory counterpart of Postgres deadlock
//!   detection
//! - dropping a transaction without committing discards its writes
//! - tasks staged with `enqueue_task` reach the `TaskOutbox` in the same step
//!   that publishes the rows, and are discarded on rollback

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use bank_core::{
    Account, AccountId, Currency, Entry, EntryId, LedgerError, LedgerResult, Transfer, TransferId,
    User, VerifyEmail, VerifyEmailId, VERIFY_EMAIL_TTL_MINUTES,
};

use crate::queries::{
    CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    CreateVerifyEmailParams, Database, EnqueueTaskParams, Page, Queries, Transaction,
    UpdateUserParams,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    OwnerCurrency(String, Currency),
    User(String),
    Email(String),
    VerifyEmail(VerifyEmailId),
}

#[derive(Debug, Default, Clone)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    users: BTreeMap<String, User>,
    verify_emails: BTreeMap<VerifyEmailId, VerifyEmail>,
}

#[derive(Debug, Default)]
struct Sequences {
    accounts: AtomicI64,
    entries: AtomicI64,
    transfers: AtomicI64,
    verify_emails: AtomicI64,
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

/// Receives the tasks of each committed in-memory transaction.
///
/// `publish` runs while the commit holds the table lock; an error aborts the
/// commit and none of the transaction's writes become visible.
pub trait TaskOutbox: Send + Sync + std::fmt::Debug {
    fn publish(&self, tasks: Vec<EnqueueTaskParams>) -> LedgerResult<()>;
}

#[derive(Debug)]
struct Shared {
    committed: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    sequences: Sequences,
    lock_timeout: Duration,
    outbox: Option<Arc<dyn TaskOutbox>>,
}

impl Shared {
    fn committed(&self) -> LedgerResult<MutexGuard<'_, Tables>> {
        self.committed
            .lock()
            .map_err(|_| LedgerError::internal("lock poisoned"))
    }

    fn row_lock(&self, key: &RowKey) -> LedgerResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| LedgerError::internal("lock poisoned"))?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    /// Drop lock entries nobody holds or waits on.
    fn prune_row_locks(&self, keys: impl IntoIterator<Item = RowKey>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(|p| p.into_inner());
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }
}

/// In-memory database handing out isolated transactions.
///
/// Cheap to clone; clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemoryDatabase {
    shared: Arc<Shared>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self::build(lock_timeout, None)
    }

    /// A database whose transactions may `enqueue_task`; committed tasks are
    /// handed to `outbox`.
    pub fn with_outbox(outbox: Arc<dyn TaskOutbox>) -> Self {
        Self::build(DEFAULT_LOCK_TIMEOUT, Some(outbox))
    }

    fn build(lock_timeout: Duration, outbox: Option<Arc<dyn TaskOutbox>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                sequences: Sequences::default(),
                lock_timeout,
                outbox,
            }),
        }
    }

    /// Row lock entries currently tracked.
    pub fn row_lock_count(&self) -> usize {
        self.shared
            .row_locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_default()
    }

    /// Open a transaction with its concrete type (tests use this to drive
    /// lock interleavings directly).
    pub fn begin_in_memory(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            shared: self.shared.clone(),
            staged: Tables::default(),
            tasks: Vec::new(),
            held: HashMap::new(),
        }
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> LedgerResult<Box<dyn Transaction>> {
        Ok(Box::new(self.begin_in_memory()))
    }
}

/// One open scope over an `InMemoryDatabase`.
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    staged: Tables,
    tasks: Vec<EnqueueTaskParams>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl InMemoryTransaction {
    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self.held.keys().cloned().collect();
        self.held.clear();
        self.shared.prune_row_locks(keys);
    }

    async fn lock_row(&mut self, key: RowKey) -> LedgerResult<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }

        let lock = self.shared.row_lock(&key)?;
        match tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned()).await {
            Ok(guard) => {
                self.held.insert(key, guard);
                Ok(())
            }
            Err(_) => Err(LedgerError::retryable(format!(
                "lock timeout after {:?} waiting for {key:?}",
                self.shared.lock_timeout
            ))),
        }
    }

    fn read<K, V>(&self, key: &K, table: impl Fn(&Tables) -> &BTreeMap<K, V>) -> LedgerResult<Option<V>>
    where
        K: Ord,
        V: Clone,
    {
        if let Some(row) = table(&self.staged).get(key) {
            return Ok(Some(row.clone()));
        }
        let committed = self.shared.committed()?;
        Ok(table(&committed).get(key).cloned())
    }

    /// Committed rows overlaid with this transaction's staged rows, in key order.
    fn scan<K, V>(&self, table: impl Fn(&Tables) -> &BTreeMap<K, V>) -> LedgerResult<Vec<V>>
    where
        K: Ord + Clone,
        V: Clone,
    {
        let mut rows = table(&*self.shared.committed()?).clone();
        for (k, v) in table(&self.staged) {
            rows.insert(k.clone(), v.clone());
        }
        Ok(rows.into_values().collect())
    }

    fn account(&self, id: AccountId) -> LedgerResult<Account> {
        self.read(&id, |t| &t.accounts)?
            .ok_or_else(|| LedgerError::not_found(format!("account {id}")))
    }

    fn user(&self, username: &str) -> LedgerResult<User> {
        self.read(&username.to_string(), |t| &t.users)?
            .ok_or_else(|| LedgerError::not_found(format!("user {username}")))
    }

    fn ensure_email_free(&self, email: &str, except: Option<&str>) -> LedgerResult<()> {
        let taken = self
            .scan(|t| &t.users)?
            .into_iter()
            .any(|u| u.email == email && Some(u.username.as_str()) != except);
        if taken {
            return Err(LedgerError::conflict(format!("email {email} already registered")));
        }
        Ok(())
    }
}

#[async_trait]
impl Queries for InMemoryTransaction {
    async fn create_account(&mut self, arg: CreateAccountParams) -> LedgerResult<Account> {
        self.user(&arg.owner)?;
        self.lock_row(RowKey::OwnerCurrency(arg.owner.clone(), arg.currency))
            .await?;

        let duplicate = self
            .scan(|t| &t.accounts)?
            .into_iter()
            .any(|a| a.owner == arg.owner && a.currency == arg.currency);
        if duplicate {
            return Err(LedgerError::conflict(format!(
                "owner {} already has a {} account",
                arg.owner, arg.currency
            )));
        }

        let account = Account {
            id: AccountId::new(next_id(&self.shared.sequences.accounts)),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.staged.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> LedgerResult<Account> {
        self.account(id)
    }

    async fn list_accounts(&mut self, owner: &str, page: Page) -> LedgerResult<Vec<Account>> {
        let rows = self
            .scan(|t| &t.accounts)?
            .into_iter()
            .filter(|a| a.owner == owner)
            .collect();
        Ok(page.slice(rows))
    }

    async fn add_account_balance(&mut self, id: AccountId, amount: i64) -> LedgerResult<Account> {
        self.lock_row(RowKey::Account(id)).await?;
        let mut account = self.account(id)?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::invalid_input(format!("balance overflow on account {id}")))?;
        self.staged.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> LedgerResult<Entry> {
        self.account(arg.account_id)?;
        let entry = Entry {
            id: EntryId::new(next_id(&self.shared.sequences.entries)),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.staged.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> LedgerResult<Entry> {
        self.read(&id, |t| &t.entries)?
            .ok_or_else(|| LedgerError::not_found(format!("entry {id}")))
    }

    async fn list_entries(&mut self, account_id: AccountId, page: Page) -> LedgerResult<Vec<Entry>> {
        let rows = self
            .scan(|t| &t.entries)?
            .into_iter()
            .filter(|e| e.account_id == account_id)
            .collect();
        Ok(page.slice(rows))
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> LedgerResult<Transfer> {
        if arg.amount <= 0 {
            return Err(LedgerError::invalid_input("transfer amount must be positive"));
        }
        self.account(arg.from_account_id)?;
        self.account(arg.to_account_id)?;

        let transfer = Transfer {
            id: TransferId::new(next_id(&self.shared.sequences.transfers)),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.staged.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> LedgerResult<Transfer> {
        self.read(&id, |t| &t.transfers)?
            .ok_or_else(|| LedgerError::not_found(format!("transfer {id}")))
    }

    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>> {
        let rows = self
            .scan(|t| &t.transfers)?
            .into_iter()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .collect();
        Ok(page.slice(rows))
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> LedgerResult<User> {
        self.lock_row(RowKey::User(arg.username.clone())).await?;
        self.lock_row(RowKey::Email(arg.email.clone())).await?;

        if self.read(&arg.username, |t| &t.users)?.is_some() {
            return Err(LedgerError::conflict(format!(
                "username {} already exists",
                arg.username
            )));
        }
        self.ensure_email_free(&arg.email, None)?;

        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            role: arg.role,
            is_email_verified: false,
            password_changed_at: DateTime::<Utc>::default(),
            created_at: Utc::now(),
        };
        self.staged.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> LedgerResult<User> {
        self.user(username)
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> LedgerResult<User> {
        self.lock_row(RowKey::User(arg.username.clone())).await?;
        let mut user = self.user(&arg.username)?;

        if let Some(email) = arg.email.as_ref().filter(|e| **e != user.email) {
            self.lock_row(RowKey::Email(email.clone())).await?;
            self.ensure_email_free(email, Some(&arg.username))?;
        }

        arg.apply(&mut user);
        self.staged.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> LedgerResult<VerifyEmail> {
        self.user(&arg.username)?;
        let now = Utc::now();
        let record = VerifyEmail {
            id: VerifyEmailId::new(next_id(&self.shared.sequences.verify_emails)),
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: now,
            expired_at: now + chrono::Duration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        };
        self.staged.verify_emails.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> LedgerResult<VerifyEmail> {
        self.read(&id, |t| &t.verify_emails)?
            .ok_or_else(|| LedgerError::not_found(format!("verify email {id}")))
    }

    async fn update_verify_email(
        &mut self,
        id: VerifyEmailId,
        secret_code: &str,
    ) -> LedgerResult<Option<VerifyEmail>> {
        self.lock_row(RowKey::VerifyEmail(id)).await?;
        let Some(mut record) = self.read(&id, |t| &t.verify_emails)? else {
            return Ok(None);
        };
        if !record.accepts(secret_code, Utc::now()) {
            return Ok(None);
        }

        record.is_used = true;
        self.staged.verify_emails.insert(id, record.clone());
        Ok(Some(record))
    }

    async fn enqueue_task(&mut self, arg: EnqueueTaskParams) -> LedgerResult<()> {
        if self.shared.outbox.is_none() {
            return Err(LedgerError::internal(format!(
                "cannot enqueue {}: database has no task outbox",
                arg.task_type
            )));
        }
        self.tasks.push(arg);
        Ok(())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(&mut self) -> LedgerResult<()> {
        let staged = std::mem::take(&mut self.staged);
        let tasks = std::mem::take(&mut self.tasks);
        {
            let mut committed = self.shared.committed()?;
            if !tasks.is_empty() {
                if let Some(outbox) = &self.shared.outbox {
                    outbox.publish(tasks)?;
                }
            }
            committed.accounts.extend(staged.accounts);
            committed.entries.extend(staged.entries);
            committed.transfers.extend(staged.transfers);
            committed.users.extend(staged.users);
            committed.verify_emails.extend(staged.verify_emails);
        }
        // Row locks are released only once the writes are visible.
        self.release_locks();
        Ok(())
    }

    async fn rollback(&mut self) -> LedgerResult<()> {
        self.staged = Tables::default();
        self.tasks.clear();
        self.release_locks();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::user_params;

    #[derive(Debug, Default)]
    struct RecordingOutbox {
        published: Mutex<Vec<EnqueueTaskParams>>,
        fail: bool,
    }

    impl TaskOutbox for RecordingOutbox {
        fn publish(&self, tasks: Vec<EnqueueTaskParams>) -> LedgerResult<()> {
            if self.fail {
                return Err(LedgerError::internal("outbox unavailable"));
            }
            self.published.lock().unwrap().extend(tasks);
            Ok(())
        }
    }

    fn task_params(task_type: &str) -> EnqueueTaskParams {
        let now = Utc::now();
        EnqueueTaskParams {
            id: uuid::Uuid::now_v7(),
            task_type: task_type.to_string(),
            payload: serde_json::json!({ "username": "alice" }),
            queue: "critical".to_string(),
            max_retry: 10,
            process_at: now,
            created_at: now,
        }
    }

    async fn committed_user(db: &InMemoryDatabase, name: &str) -> User {
        let mut tx = db.begin_in_memory();
        let user = tx.create_user(user_params(name)).await.unwrap();
        tx.commit().await.unwrap();
        user
    }

    async fn committed_account(db: &InMemoryDatabase, owner: &str, balance: i64) -> Account {
        let mut tx = db.begin_in_memory();
        let account = tx
            .create_account(CreateAccountParams {
                owner: owner.to_string(),
                balance,
                currency: Currency::Usd,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        account
    }

    #[tokio::test]
    async fn uncommitted_writes_are_private() {
        let db = InMemoryDatabase::new();
        committed_user(&db, "alice").await;
        let account = committed_account(&db, "alice", 100).await;

        let mut writer = db.begin_in_memory();
        writer.add_account_balance(account.id, 50).await.unwrap();

        let mut reader = db.begin_in_memory();
        assert_eq!(reader.get_account(account.id).await.unwrap().balance, 100);
        assert_eq!(writer.get_account(account.id).await.unwrap().balance, 150);

        writer.commit().await.unwrap();
        assert_eq!(reader.get_account(account.id).await.unwrap().balance, 150);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes_and_releases_locks() {
        let db = InMemoryDatabase::with_lock_timeout(Duration::from_millis(200));
        committed_user(&db, "alice").await;
        let account = committed_account(&db, "alice", 100).await;

        {
            let mut tx = db.begin_in_memory();
            tx.add_account_balance(account.id, -40).await.unwrap();
        }

        let mut tx = db.begin_in_memory();
        let locked = tx.add_account_balance(account.id, 0).await.unwrap();
        assert_eq!(locked.balance, 100);
    }

    #[tokio::test]
    async fn row_lock_blocks_until_commit() {
        let db = InMemoryDatabase::new();
        committed_user(&db, "alice").await;
        let account = committed_account(&db, "alice", 100).await;

        let mut first = db.begin_in_memory();
        first.add_account_balance(account.id, 10).await.unwrap();

        let db2 = db.clone();
        let waiter = tokio::spawn(async move {
            let mut second = db2.begin_in_memory();
            let updated = second.add_account_balance(account.id, 10).await.unwrap();
            second.commit().await.unwrap();
            updated.balance
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.commit().await.unwrap();
        assert_eq!(waiter.await.unwrap(), 120);
    }

    #[tokio::test]
    async fn opposite_lock_order_times_out_as_retryable() {
        let db = InMemoryDatabase::with_lock_timeout(Duration::from_millis(100));
        committed_user(&db, "alice").await;
        committed_user(&db, "bob").await;
        let a = committed_account(&db, "alice", 100).await;
        let b = committed_account(&db, "bob", 100).await;

        let mut tx1 = db.begin_in_memory();
        let mut tx2 = db.begin_in_memory();
        tx1.add_account_balance(a.id, -10).await.unwrap();
        tx2.add_account_balance(b.id, -10).await.unwrap();

        let (r1, r2) = tokio::join!(
            tx1.add_account_balance(b.id, 10),
            tx2.add_account_balance(a.id, 10),
        );

        assert!(r1.unwrap_err().is_retryable());
        assert!(r2.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn duplicate_username_and_email_conflict() {
        let db = InMemoryDatabase::new();
        committed_user(&db, "alice").await;

        let mut tx = db.begin_in_memory();
        let err = tx.create_user(user_params("alice")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        let mut same_email = user_params("alice2");
        same_email.email = user_params("alice").email;
        let err = tx.create_user(same_email).await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn one_account_per_owner_and_currency() {
        let db = InMemoryDatabase::new();
        committed_user(&db, "alice").await;
        committed_account(&db, "alice", 0).await;

        let mut tx = db.begin_in_memory();
        let err = tx
            .create_account(CreateAccountParams {
                owner: "alice".into(),
                balance: 0,
                currency: Currency::Usd,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        let eur = tx
            .create_account(CreateAccountParams {
                owner: "alice".into(),
                balance: 0,
                currency: Currency::Eur,
            })
            .await
            .unwrap();
        assert_eq!(eur.currency, Currency::Eur);

        let err = tx
            .create_account(CreateAccountParams {
                owner: "nobody".into(),
                balance: 0,
                currency: Currency::Usd,
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn lists_are_filtered_and_paged() {
        let db = InMemoryDatabase::new();
        committed_user(&db, "alice").await;
        let account = committed_account(&db, "alice", 0).await;

        let mut tx = db.begin_in_memory();
        for amount in 1..=5 {
            tx.create_entry(CreateEntryParams {
                account_id: account.id,
                amount,
            })
            .await
            .unwrap();
        }

        let page = tx.list_entries(account.id, Page::new(2, 1)).await.unwrap();
        let amounts: Vec<i64> = page.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![2, 3]);
        assert!(tx
            .list_entries(AccountId::new(999), Page::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn staged_tasks_are_published_on_commit_only() {
        let outbox = Arc::new(RecordingOutbox::default());
        let db = InMemoryDatabase::with_outbox(outbox.clone());

        let mut tx = db.begin_in_memory();
        tx.create_user(user_params("alice")).await.unwrap();
        tx.enqueue_task(task_params("task:send_verify_email")).await.unwrap();
        assert!(outbox.published.lock().unwrap().is_empty());
        tx.commit().await.unwrap();

        let published = outbox.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].task_type, "task:send_verify_email");

        let mut rolled_back = db.begin_in_memory();
        rolled_back.enqueue_task(task_params("task:other")).await.unwrap();
        rolled_back.rollback().await.unwrap();

        {
            let mut dropped = db.begin_in_memory();
            dropped.enqueue_task(task_params("task:other")).await.unwrap();
        }
        assert_eq!(outbox.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_aborts_the_commit() {
        let outbox = Arc::new(RecordingOutbox {
            fail: true,
            ..Default::default()
        });
        let db = InMemoryDatabase::with_outbox(outbox);

        let mut tx = db.begin_in_memory();
        tx.create_user(user_params("alice")).await.unwrap();
        tx.enqueue_task(task_params("task:send_verify_email")).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err, LedgerError::internal("outbox unavailable"));
        drop(tx);

        let mut reader = db.begin_in_memory();
        assert!(reader.get_user("alice").await.unwrap_err().is_not_found());
        assert_eq!(db.row_lock_count(), 0);
    }

    #[tokio::test]
    async fn enqueue_without_outbox_is_an_error() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin_in_memory();
        let err = tx.enqueue_task(task_params("task:send_verify_email")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Internal(_)));
    }

    #[tokio::test]
    async fn row_lock_table_does_not_grow_with_finished_transactions() {
        let db = InMemoryDatabase::new();
        for name in ["alice", "bob", "carol"] {
            committed_user(&db, name).await;
            let account = committed_account(&db, name, 100).await;

            let mut rolled_back = db.begin_in_memory();
            rolled_back.add_account_balance(account.id, 1).await.unwrap();
            rolled_back.rollback().await.unwrap();

            let mut dropped = db.begin_in_memory();
            dropped.add_account_balance(account.id, 1).await.unwrap();
        }
        assert_eq!(db.row_lock_count(), 0);

        let mut open = db.begin_in_memory();
        open.create_user(user_params("dave")).await.unwrap();
        // Username and email locks stay until the scope ends.
        assert_eq!(db.row_lock_count(), 2);
        open.commit().await.unwrap();
        assert_eq!(db.row_lock_count(), 0);
    }
}
