//! `bank-store` — ledger persistence and the transactions built on it.
//!
//! - `queries`: the row-level store boundary (`Queries`, `Transaction`, `Database`)
//! - `executor`: `Store`, which runs closures inside one atomic scope
//! - `tx_*`: transfer, create-user and verify-email transactions
//! - `in_memory` / `postgres`: backends

pub mod executor;
pub mod in_memory;
pub mod postgres;
pub mod queries;
pub mod schema;
pub mod tx_create_user;
pub mod tx_transfer;
pub mod tx_verify_email;

#[cfg(test)]
mod test_support;

pub use executor::{Store, StoreConfig};
pub use in_memory::{InMemoryDatabase, InMemoryTransaction, TaskOutbox};
pub use postgres::{PgTransaction, PostgresDatabase};
pub use queries::{
    CreateAccountParams, CreateEntryParams, CreateTransferParams, CreateUserParams,
    CreateVerifyEmailParams, Database, EnqueueTaskParams, Page, Queries, Transaction,
    UpdateUserParams,
};
pub use schema::ensure_schema;
pub use tx_create_user::{CreateUserTxParams, CreateUserTxResult};
pub use tx_transfer::{TransferTxParams, TransferTxResult};
pub use tx_verify_email::{VerifyEmailTxParams, VerifyEmailTxResult};
