//! Ledger tables.

use sqlx::PgPool;

use bank_core::{LedgerError, LedgerResult};

const STATEMENTS: &[(&str, &str)] = &[
    (
        "users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username            VARCHAR PRIMARY KEY,
            role                VARCHAR NOT NULL DEFAULT 'depositor',
            hashed_password     VARCHAR NOT NULL,
            full_name           VARCHAR NOT NULL,
            email               VARCHAR UNIQUE NOT NULL,
            is_email_verified   BOOLEAN NOT NULL DEFAULT FALSE,
            password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '1970-01-01 00:00:00Z',
            created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "accounts",
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id         BIGSERIAL PRIMARY KEY,
            owner      VARCHAR NOT NULL REFERENCES users (username),
            balance    BIGINT NOT NULL,
            currency   VARCHAR NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            CONSTRAINT owner_currency_key UNIQUE (owner, currency)
        )
        "#,
    ),
    (
        "accounts_owner_idx",
        "CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner)",
    ),
    (
        "entries",
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id         BIGSERIAL PRIMARY KEY,
            account_id BIGINT NOT NULL REFERENCES accounts (id),
            amount     BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "entries_account_idx",
        "CREATE INDEX IF NOT EXISTS entries_account_idx ON entries (account_id)",
    ),
    (
        "transfers",
        r#"
        CREATE TABLE IF NOT EXISTS transfers (
            id              BIGSERIAL PRIMARY KEY,
            from_account_id BIGINT NOT NULL REFERENCES accounts (id),
            to_account_id   BIGINT NOT NULL REFERENCES accounts (id),
            amount          BIGINT NOT NULL CHECK (amount > 0),
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "transfers_from_idx",
        "CREATE INDEX IF NOT EXISTS transfers_from_idx ON transfers (from_account_id)",
    ),
    (
        "transfers_to_idx",
        "CREATE INDEX IF NOT EXISTS transfers_to_idx ON transfers (to_account_id)",
    ),
    (
        "verify_emails",
        r#"
        CREATE TABLE IF NOT EXISTS verify_emails (
            id          BIGSERIAL PRIMARY KEY,
            username    VARCHAR NOT NULL REFERENCES users (username),
            email       VARCHAR NOT NULL,
            secret_code VARCHAR NOT NULL,
            is_used     BOOLEAN NOT NULL DEFAULT FALSE,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
            expired_at  TIMESTAMPTZ NOT NULL DEFAULT (now() + interval '15 minutes')
        )
        "#,
    ),
];

/// Create the ledger tables if they do not exist yet. Idempotent.
pub async fn ensure_schema(pool: &PgPool) -> LedgerResult<()> {
    for (name, sql) in STATEMENTS {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| LedgerError::internal(format!("failed to create {name}: {e}")))?;
    }
    Ok(())
}
