//! Ledger transactions on a live Postgres.
//!
//! Ignored by default; run with
//! `DATABASE_URL=postgres://... cargo test -p bank-store -- --ignored`.

use bank_core::{Account, Currency, LedgerError, Role};
use bank_store::{
    CreateAccountParams, CreateUserParams, Page, PostgresDatabase, Store, StoreConfig,
    TransferTxParams, ensure_schema,
};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn connect() -> Option<Store<PostgresDatabase>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .unwrap();
    ensure_schema(&pool).await.unwrap();
    Some(Store::with_config(
        PostgresDatabase::new(pool),
        StoreConfig { max_tx_attempts: 5 },
    ))
}

/// A fresh user with one USD account; names are unique per run.
async fn open_account(store: &Store<PostgresDatabase>, balance: i64) -> Account {
    let username = format!("pg_{}", Uuid::now_v7().simple());
    let params = CreateUserParams {
        username: username.clone(),
        hashed_password: "hashed".to_string(),
        full_name: "Postgres Test".to_string(),
        email: format!("{username}@bank.test"),
        role: Role::Depositor,
    };
    store
        .exec_tx(move |q| q.create_user(params))
        .await
        .unwrap();
    store
        .create_account(CreateAccountParams {
            owner: username,
            balance,
            currency: Currency::Usd,
        })
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn opposite_direction_transfers_do_not_deadlock() {
    let Some(store) = connect().await else {
        return;
    };
    let a = open_account(&store, 100).await;
    let b = open_account(&store, 100).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
        handles.push(tokio::spawn(async move {
            store.transfer_tx(TransferTxParams::new(from, to, 10)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(store.get_account(a.id).await.unwrap().balance, 100);
    assert_eq!(store.get_account(b.id).await.unwrap().balance, 100);
    let transfers = store.list_transfers(a.id, Page::new(50, 0)).await.unwrap();
    assert_eq!(transfers.len(), 10);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn rejected_transfer_leaves_no_rows() {
    let Some(store) = connect().await else {
        return;
    };
    let a = open_account(&store, 30).await;
    let b = open_account(&store, 0).await;

    let err = store
        .transfer_tx(TransferTxParams::new(a.id, b.id, 50))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidInput(_)));
    assert_eq!(store.get_account(a.id).await.unwrap().balance, 30);
    assert_eq!(store.get_account(b.id).await.unwrap().balance, 0);
    assert!(store.list_transfers(a.id, Page::default()).await.unwrap().is_empty());
    assert!(store.list_entries(a.id, Page::default()).await.unwrap().is_empty());
}
