//! Postgres-backed ledger store.
//!
//! Each `PgTransaction` owns one `sqlx::Transaction`; every query of a scope
//! runs on that connection.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate username, email, owner/currency |
//! | Database (foreign key violation) | `23503` | `NotFound` | Owner or account does not exist |
//! | Database (check violation) | `23514` | `InvalidInput` | Non-positive transfer amount |
//! | Database (numeric out of range) | `22003` | `InvalidInput` | Balance overflow |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Retryable` | Concurrent scopes aborted by Postgres |
//! | Database (other) | Any other | `Internal` | |
//! | RowNotFound | N/A | `NotFound` | |
//! | Other | N/A | `Internal` | Network errors, pool closed, etc. |

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::instrument;

use bank_core::{
    Account, AccountId, Currency, Entry, EntryId, LedgerError, LedgerResult, Role, Transfer,
    TransferId, User, VerifyEmail, VerifyEmailId, VERIFY_EMAIL_TTL_MINUTES,
};

use crate::queries::{
    CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    CreateVerifyEmailParams, Database, EnqueueTaskParams, Page, Queries, Transaction,
    UpdateUserParams,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str = "username, hashed_password, full_name, email, role, \
     is_email_verified, password_changed_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";

/// Postgres database handing out `PgTransaction`s.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn begin(&self) -> LedgerResult<Box<dyn Transaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }
}

/// One open scope on a pooled connection.
///
/// Dropping it without `commit` rolls back (sqlx issues the ROLLBACK when the
/// connection returns to the pool).
pub struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn conn(&mut self) -> LedgerResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| LedgerError::internal("transaction already finished"))
    }
}

#[async_trait]
impl Queries for PgTransaction {
    #[instrument(skip(self, arg), fields(owner = %arg.owner, currency = %arg.currency), err)]
    async fn create_account(&mut self, arg: CreateAccountParams) -> LedgerResult<Account> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&arg.owner)
            .bind(arg.balance)
            .bind(arg.currency.code())
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("create_account", e))?;
        account_from_row(&row)
    }

    async fn get_account(&mut self, id: AccountId) -> LedgerResult<Account> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("get_account", e))?
            .ok_or_else(|| LedgerError::not_found(format!("account {id}")))?;
        account_from_row(&row)
    }

    async fn list_accounts(&mut self, owner: &str, page: Page) -> LedgerResult<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(owner)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("list_accounts", e))?;
        rows.iter().map(account_from_row).collect()
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn add_account_balance(&mut self, id: AccountId, amount: i64) -> LedgerResult<Account> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(amount)
            .bind(id.get())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("add_account_balance", e))?
            .ok_or_else(|| LedgerError::not_found(format!("account {id}")))?;
        account_from_row(&row)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> LedgerResult<Entry> {
        let sql = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(arg.account_id.get())
            .bind(arg.amount)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("create_entry", e))?;
        entry_from_row(&row)
    }

    async fn get_entry(&mut self, id: EntryId) -> LedgerResult<Entry> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("get_entry", e))?
            .ok_or_else(|| LedgerError::not_found(format!("entry {id}")))?;
        entry_from_row(&row)
    }

    async fn list_entries(&mut self, account_id: AccountId, page: Page) -> LedgerResult<Vec<Entry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.get())
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("list_entries", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> LedgerResult<Transfer> {
        let sql = format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
             RETURNING {TRANSFER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(arg.from_account_id.get())
            .bind(arg.to_account_id.get())
            .bind(arg.amount)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("create_transfer", e))?;
        transfer_from_row(&row)
    }

    async fn get_transfer(&mut self, id: TransferId) -> LedgerResult<Transfer> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("get_transfer", e))?
            .ok_or_else(|| LedgerError::not_found(format!("transfer {id}")))?;
        transfer_from_row(&row)
    }

    async fn list_transfers(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> LedgerResult<Vec<Transfer>> {
        let sql = format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.get())
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("list_transfers", e))?;
        rows.iter().map(transfer_from_row).collect()
    }

    #[instrument(skip(self, arg), fields(username = %arg.username), err)]
    async fn create_user(&mut self, arg: CreateUserParams) -> LedgerResult<User> {
        let sql = format!(
            "INSERT INTO users (username, hashed_password, full_name, email, role) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&arg.username)
            .bind(&arg.hashed_password)
            .bind(&arg.full_name)
            .bind(&arg.email)
            .bind(arg.role.as_str())
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("create_user", e))?;
        user_from_row(&row)
    }

    async fn get_user(&mut self, username: &str) -> LedgerResult<User> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?
            .ok_or_else(|| LedgerError::not_found(format!("user {username}")))?;
        user_from_row(&row)
    }

    #[instrument(skip(self, arg), fields(username = %arg.username), err)]
    async fn update_user(&mut self, arg: UpdateUserParams) -> LedgerResult<User> {
        let sql = format!(
            "UPDATE users SET \
                hashed_password = COALESCE($1, hashed_password), \
                password_changed_at = COALESCE($2, password_changed_at), \
                full_name = COALESCE($3, full_name), \
                email = COALESCE($4, email), \
                is_email_verified = COALESCE($5, is_email_verified) \
             WHERE username = $6 RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(arg.hashed_password.as_deref())
            .bind(arg.password_changed_at)
            .bind(arg.full_name.as_deref())
            .bind(arg.email.as_deref())
            .bind(arg.is_email_verified)
            .bind(&arg.username)
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("update_user", e))?
            .ok_or_else(|| LedgerError::not_found(format!("user {}", arg.username)))?;
        user_from_row(&row)
    }

    async fn create_verify_email(
        &mut self,
        arg: CreateVerifyEmailParams,
    ) -> LedgerResult<VerifyEmail> {
        let sql = format!(
            "INSERT INTO verify_emails (username, email, secret_code, expired_at) \
             VALUES ($1, $2, $3, now() + make_interval(mins => $4)) \
             RETURNING {VERIFY_EMAIL_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&arg.username)
            .bind(&arg.email)
            .bind(&arg.secret_code)
            .bind(VERIFY_EMAIL_TTL_MINUTES as i32)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("create_verify_email", e))?;
        verify_email_from_row(&row)
    }

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> LedgerResult<VerifyEmail> {
        let sql = format!("SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_emails WHERE id = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("get_verify_email", e))?
            .ok_or_else(|| LedgerError::not_found(format!("verify email {id}")))?;
        verify_email_from_row(&row)
    }

    async fn update_verify_email(
        &mut self,
        id: VerifyEmailId,
        secret_code: &str,
    ) -> LedgerResult<Option<VerifyEmail>> {
        let sql = format!(
            "UPDATE verify_emails SET is_used = TRUE \
             WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > now() \
             RETURNING {VERIFY_EMAIL_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(secret_code)
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("update_verify_email", e))?;
        row.as_ref().map(verify_email_from_row).transpose()
    }

    /// Inserts into the worker's `tasks` table on this scope's connection,
    /// so the row commits or rolls back with everything else.
    #[instrument(skip(self, arg), fields(task_id = %arg.id, task_type = %arg.task_type), err)]
    async fn enqueue_task(&mut self, arg: EnqueueTaskParams) -> LedgerResult<()> {
        let max_retry = i32::try_from(arg.max_retry)
            .map_err(|_| LedgerError::invalid_input(format!("max_retry {} out of range", arg.max_retry)))?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, payload, queue, state, retried, max_retry,
                last_error, process_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, NULL, $6, $7, $7)
            "#,
        )
        .bind(arg.id)
        .bind(&arg.task_type)
        .bind(&arg.payload)
        .bind(&arg.queue)
        .bind(max_retry)
        .bind(arg.process_at)
        .bind(arg.created_at)
        .execute(self.conn()?)
        .await
        .map_err(|e| map_sqlx_error("enqueue_task", e))?;
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    async fn commit(&mut self) -> LedgerResult<()> {
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(|e| map_sqlx_error("commit", e)),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> LedgerResult<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e)),
            None => Ok(()),
        }
    }
}

/// Map SQLx errors to LedgerError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => LedgerError::Conflict(msg),
                Some("23503") => LedgerError::NotFound(msg),
                Some("23514") | Some("22003") => LedgerError::InvalidInput(msg),
                Some("40001") | Some("40P01") => LedgerError::Retryable(msg),
                _ => LedgerError::Internal(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            LedgerError::NotFound(format!("row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Internal(format!("connection pool closed in {}", operation))
        }
        _ => LedgerError::Internal(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode(column: &str, err: impl std::fmt::Display) -> LedgerError {
    LedgerError::internal(format!("failed to read {column}: {err}"))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> LedgerResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(|e| decode(column, e))
}

fn account_from_row(row: &PgRow) -> LedgerResult<Account> {
    let currency: String = get(row, "currency")?;
    Ok(Account {
        id: AccountId::new(get(row, "id")?),
        owner: get(row, "owner")?,
        balance: get(row, "balance")?,
        currency: currency.parse::<Currency>().map_err(|e| decode("currency", e))?,
        created_at: get(row, "created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> LedgerResult<Entry> {
    Ok(Entry {
        id: EntryId::new(get(row, "id")?),
        account_id: AccountId::new(get(row, "account_id")?),
        amount: get(row, "amount")?,
        created_at: get(row, "created_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> LedgerResult<Transfer> {
    Ok(Transfer {
        id: TransferId::new(get(row, "id")?),
        from_account_id: AccountId::new(get(row, "from_account_id")?),
        to_account_id: AccountId::new(get(row, "to_account_id")?),
        amount: get(row, "amount")?,
        created_at: get(row, "created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> LedgerResult<User> {
    let role: String = get(row, "role")?;
    Ok(User {
        username: get(row, "username")?,
        hashed_password: get(row, "hashed_password")?,
        full_name: get(row, "full_name")?,
        email: get(row, "email")?,
        role: role.parse::<Role>().map_err(|e| decode("role", e))?,
        is_email_verified: get(row, "is_email_verified")?,
        password_changed_at: get(row, "password_changed_at")?,
        created_at: get(row, "created_at")?,
    })
}

fn verify_email_from_row(row: &PgRow) -> LedgerResult<VerifyEmail> {
    Ok(VerifyEmail {
        id: VerifyEmailId::new(get(row, "id")?),
        username: get(row, "username")?,
        email: get(row, "email")?,
        secret_code: get(row, "secret_code")?,
        is_used: get(row, "is_used")?,
        created_at: get(row, "created_at")?,
        expired_at: get(row, "expired_at")?,
    })
}
