use std::time::Duration;

use bank_core::{Account, AccountId, Currency, LedgerError, Role};
use bank_store::{
    CreateAccountParams, CreateUserParams, InMemoryDatabase, Page, Store, StoreConfig,
    TransferTxParams,
};
use proptest::prelude::*;

async fn open_account(store: &Store<InMemoryDatabase>, owner: &str, balance: i64) -> Account {
    let params = CreateUserParams {
        username: owner.to_string(),
        hashed_password: "hashed".to_string(),
        full_name: owner.to_uppercase(),
        email: format!("{owner}@bank.test"),
        role: Role::Depositor,
    };
    store
        .exec_tx(move |q| q.create_user(params))
        .await
        .unwrap();
    store
        .create_account(CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: Currency::Usd,
        })
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_direction_transfers_move_exact_total() {
    let store = Store::new(InMemoryDatabase::new());
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 50).await;

    let n = 5;
    let amount = 10;
    let mut handles = Vec::new();
    for _ in 0..n {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .transfer_tx(TransferTxParams::new(a.id, b.id, amount))
                .await
        }));
    }

    let mut seen_from_balances = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.transfer.amount, amount);
        assert_eq!(result.from_entry.amount, -amount);
        assert_eq!(result.to_entry.amount, amount);
        assert_eq!(
            a.balance - result.from_account.balance,
            result.to_account.balance - b.balance
        );
        seen_from_balances.push(result.from_account.balance);
    }

    // Each transfer observed a distinct intermediate balance.
    seen_from_balances.sort_unstable();
    seen_from_balances.dedup();
    assert_eq!(seen_from_balances.len(), n as usize);

    assert_eq!(store.get_account(a.id).await.unwrap().balance, 100 - n * amount);
    assert_eq!(store.get_account(b.id).await.unwrap().balance, 50 + n * amount);
    assert_eq!(
        store.list_transfers(a.id, Page::default()).await.unwrap().len(),
        n as usize
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_direction_transfers_do_not_deadlock() {
    // A short lock timeout turns any ordering bug into a visible failure
    // instead of a hang. Retries are disabled so no conflict is hidden.
    let store = Store::with_config(
        InMemoryDatabase::with_lock_timeout(Duration::from_secs(2)),
        StoreConfig { max_tx_attempts: 1 },
    );
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 100).await;

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
}

#[tokio::test]
async fn scenario_a100_b50_transfer_10() {
    let store = Store::new(InMemoryDatabase::new());
    let a = open_account(&store, "alice", 100).await;
    let b = open_account(&store, "bob", 50).await;

    store
        .transfer_tx(TransferTxParams::new(a.id, b.id, 10).in_currency(Currency::Usd))
        .await
        .unwrap();

    assert_eq!(store.get_account(a.id).await.unwrap().balance, 90);
    assert_eq!(store.get_account(b.id).await.unwrap().balance, 60);

    let entries_a = store.list_entries(a.id, Page::default()).await.unwrap();
    let entries_b = store.list_entries(b.id, Page::default()).await.unwrap();
    assert_eq!(entries_a.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![-10]);
    assert_eq!(entries_b.iter().map(|e| e.amount).collect::<Vec<_>>(), vec![10]);

    let transfers = store.list_transfers(a.id, Page::default()).await.unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(
        (transfers[0].from_account_id, transfers[0].to_account_id, transfers[0].amount),
        (a.id, b.id, 10)
    );
}

#[tokio::test]
async fn cancelled_scope_leaves_nothing_behind() {
    let store = Store::with_config(
        InMemoryDatabase::with_lock_timeout(Duration::from_millis(500)),
        StoreConfig::default(),
    );
    let a = open_account(&store, "alice", 100).await;

    let pending = store.exec_tx(move |q| {
        Box::pin(async move {
            q.add_account_balance(a.id, -60).await?;
            futures::future::pending::<()>().await;
            Ok(())
        })
    });
    let outcome = tokio::time::timeout(Duration::from_millis(50), pending).await;
    assert!(outcome.is_err());

    // The write is gone and the row lock was released with the scope.
    let account = store
        .exec_tx(move |q| q.add_account_balance(a.id, 0))
        .await
        .unwrap();
    assert_eq!(account.balance, 100);
    assert_eq!(store.database().row_lock_count(), 0);
}

#[tokio::test]
async fn overflowing_balance_is_rejected() {
    let store = Store::new(InMemoryDatabase::new());
    let a = open_account(&store, "alice", i64::MAX).await;
    let b = open_account(&store, "bob", 10).await;

    let err = store
        .transfer_tx(TransferTxParams::new(b.id, a.id, 5))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidInput(_)));
    assert_eq!(store.get_account(b.id).await.unwrap().balance, 10);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn transfers_conserve_total_balance(
        moves in prop::collection::vec((0usize..3, 0usize..3, 1i64..80), 1..20)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let store = Store::new(InMemoryDatabase::new());
            let mut ids: Vec<AccountId> = Vec::new();
            for (i, owner) in ["ann", "ben", "cat"].iter().enumerate() {
                ids.push(open_account(&store, owner, 50 * (i as i64 + 1)).await.id);
            }
            let initial_total = 50 + 100 + 150;

            for (from, to, amount) in moves {
                match store
                    .transfer_tx(TransferTxParams::new(ids[from], ids[to], amount))
                    .await
                {
                    Ok(result) => {
                        assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
                        assert!(result.from_account.balance >= 0);
                    }
                    Err(LedgerError::InvalidInput(_)) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }

            let mut total = 0;
            for id in &ids {
                let account = store.get_account(*id).await.unwrap();
                assert!(account.balance >= 0);
                total += account.balance;
            }
            assert_eq!(total, initial_total);
        });
    }
}
