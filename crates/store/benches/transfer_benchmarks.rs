use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bank_core::{Account, Currency, Role};
use bank_store::{CreateAccountParams, CreateUserParams, InMemoryDatabase, Store, TransferTxParams};
use tokio::runtime::Runtime;

async fn open_account(store: &Store<InMemoryDatabase>, owner: String, balance: i64) -> Account {
    let params = CreateUserParams {
        username: owner.clone(),
        hashed_password: "hashed".to_string(),
        full_name: owner.clone(),
        email: format!("{owner}@bench.test"),
        role: Role::Depositor,
    };
    store
        .exec_tx(move |q| q.create_user(params))
        .await
        .unwrap();
    store
        .create_account(CreateAccountParams {
            owner,
            balance,
            currency: Currency::Usd,
        })
        .await
        .unwrap()
}

/// Single-caller latency of one transfer (one scope, five row operations).
fn bench_transfer_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = Store::new(InMemoryDatabase::new());
    let (a, b) = rt.block_on(async {
        (
            open_account(&store, "alice".into(), i64::MAX / 2).await,
            open_account(&store, "bob".into(), i64::MAX / 2).await,
        )
    });

    let mut group = c.benchmark_group("transfer_latency");
    group.bench_function("alternating_direction", |bench| {
        let mut flip = false;
        bench.iter(|| {
            flip = !flip;
            let (from, to) = if flip { (a.id, b.id) } else { (b.id, a.id) };
            rt.block_on(store.transfer_tx(black_box(TransferTxParams::new(from, to, 1))))
                .unwrap()
        });
    });
    group.finish();
}

/// Concurrent transfers: all on one pair (serialised on its row locks)
/// versus spread over disjoint pairs.
fn bench_contention(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("transfer_contention");

    for pairs in [1usize, 8] {
        let store = Store::new(InMemoryDatabase::new());
        let accounts: Vec<(Account, Account)> = rt.block_on(async {
            let mut out = Vec::new();
            for i in 0..pairs {
                let x = open_account(&store, format!("x{i}"), i64::MAX / 2).await;
                let y = open_account(&store, format!("y{i}"), i64::MAX / 2).await;
                out.push((x, y));
            }
            out
        });

        let batch = 64;
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("pairs", pairs), &pairs, |bench, _| {
            bench.iter(|| {
                rt.block_on(async {
                    let mut handles = Vec::with_capacity(batch);
                    for i in 0..batch {
                        let (x, y) = &accounts[i % accounts.len()];
                        let (from, to) = if i % 2 == 0 { (x.id, y.id) } else { (y.id, x.id) };
                        let store = store.clone();
                        handles.push(tokio::spawn(async move {
                            store.transfer_tx(TransferTxParams::new(from, to, 1)).await
                        }));
                    }
                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_transfer_latency, bench_contention);
criterion_main!(benches);
