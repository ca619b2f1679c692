//! Task store and transactional enqueue on a live Postgres.
//!
//! Ignored by default; run with
//! `DATABASE_URL=postgres://... cargo test -p bank-worker -- --ignored`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use bank_core::{LedgerError, Role};
use bank_store::{CreateUserParams, CreateUserTxParams, PostgresDatabase, Store, ensure_schema};
use bank_worker::{
    LEASE_EXPIRED, PayloadSendVerifyEmail, PostgresTaskStore, Task, TaskOptions, TaskState,
    TaskStore, distribute_task_send_verify_email_in, ensure_task_schema,
};

async fn connect() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .unwrap();
    ensure_schema(&pool).await.unwrap();
    ensure_task_schema(&pool).await.unwrap();
    Some(pool)
}

/// Queue name no other test run shares.
fn unique_queue() -> String {
    format!("q_{}", Uuid::now_v7().simple())
}

fn due_task(queue: &str, max_retry: u32) -> Task {
    let mut task = Task::new(
        "task:test",
        serde_json::json!({}),
        &TaskOptions::new().with_queue(queue).with_max_retry(max_retry),
    );
    task.process_at -= chrono::Duration::seconds(5);
    task
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_workers_claim_distinct_tasks() {
    let Some(pool) = connect().await else {
        return;
    };
    let store = Arc::new(PostgresTaskStore::new(pool));
    let queue = unique_queue();
    for _ in 0..8 {
        store.enqueue(due_task(&queue, 3)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let queues = vec![queue.clone()];
        handles.push(tokio::spawn(async move {
            store.dequeue(&queues, Duration::from_secs(60)).await.unwrap()
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            assert_eq!(task.state, TaskState::Active);
            assert!(claimed.insert(task.id), "task {} claimed twice", task.id);
        }
    }
    // SKIP LOCKED may make a racing claim come back empty, never duplicated.
    while let Some(task) = store.dequeue(&[queue.clone()], Duration::from_secs(60)).await.unwrap() {
        assert!(claimed.insert(task.id));
    }
    assert_eq!(claimed.len(), 8);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn expired_lease_is_reclaimed_then_killed() {
    let Some(pool) = connect().await else {
        return;
    };
    let store = PostgresTaskStore::new(pool);
    let queue = unique_queue();
    let queues = vec![queue.clone()];
    let id = store.enqueue(due_task(&queue, 1)).await.unwrap();

    let first = store.dequeue(&queues, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!((first.id, first.retried), (id, 0));

    let second = store.dequeue(&queues, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!((second.id, second.retried), (id, 1));
    assert_eq!(second.last_error.as_deref(), Some(LEASE_EXPIRED));

    assert!(store.dequeue(&queues, Duration::ZERO).await.unwrap().is_none());
    let dead = store.get(id).await.unwrap().unwrap();
    assert_eq!((dead.state, dead.retried), (TaskState::Dead, 1));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn task_staged_in_ledger_scope_commits_with_the_user() {
    let Some(pool) = connect().await else {
        return;
    };
    let ledger = Store::new(PostgresDatabase::new(pool.clone()));
    let tasks = PostgresTaskStore::new(pool);

    let create = |username: String, fail_after_enqueue: bool| {
        let staged = Arc::new(Mutex::new(None));
        let sink = staged.clone();
        let params = CreateUserTxParams::new(
            CreateUserParams {
                username: username.clone(),
                hashed_password: "hashed".to_string(),
                full_name: "Postgres Test".to_string(),
                email: format!("{username}@bank.test"),
                role: Role::Depositor,
            },
            move |q, user| {
                async move {
                    let payload = PayloadSendVerifyEmail {
                        username: user.username,
                    };
                    let info =
                        distribute_task_send_verify_email_in(q, &payload, TaskOptions::new()).await?;
                    *sink.lock().unwrap() = Some(info.id);
                    if fail_after_enqueue {
                        return Err(LedgerError::internal("later step failed"));
                    }
                    Ok::<(), LedgerError>(())
                }
                .boxed()
            },
        );
        (params, staged)
    };

    let committed_name = format!("pg_{}", Uuid::now_v7().simple());
    let (params, staged) = create(committed_name.clone(), false);
    ledger.create_user_tx(params).await.unwrap();
    let id = staged.lock().unwrap().unwrap();
    let task = tasks.get(id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.payload, serde_json::json!({ "username": committed_name }));

    let (params, staged) = create(format!("pg_{}", Uuid::now_v7().simple()), true);
    ledger.create_user_tx(params).await.unwrap_err();
    let id = staged.lock().unwrap().unwrap();
    assert!(tasks.get(id).await.unwrap().is_none());
}
