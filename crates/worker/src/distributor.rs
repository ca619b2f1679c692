//! Producer side: serialize payloads and enqueue tasks.

use serde::Serialize;
use tracing::info;

use bank_core::LedgerError;
use bank_store::Queries;

use super::store::{TaskStore, TaskStoreError};
use super::types::{Task, TaskInfo, TaskOptions};

/// Enqueue failure.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to marshal task payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("failed to enqueue task: {0}")]
    Store(#[from] TaskStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Lets an enqueue run inside a ledger scope's callback with `?`; the scope
/// then rolls back.
impl From<TaskError> for LedgerError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Ledger(err) => err,
            other => LedgerError::internal(other),
        }
    }
}

/// Serialize `payload` and stage it in the open ledger scope `q`. Workers
/// see the task only once that scope commits; a rollback discards it.
pub async fn enqueue_in<P>(
    q: &mut dyn Queries,
    task_type: &str,
    payload: &P,
    opts: TaskOptions,
) -> Result<TaskInfo, TaskError>
where
    P: Serialize + ?Sized,
{
    let task = Task::new(task_type, serde_json::to_value(payload)?, &opts);
    let info = task.info();
    q.enqueue_task(task.enqueue_params()).await?;

    info!(
        task_id = %info.id,
        task_type = %info.task_type,
        payload = %task.payload,
        queue = %info.queue,
        max_retry = info.max_retry,
        process_at = %info.process_at,
        "staged task in ledger scope"
    );
    Ok(info)
}

/// Hands tasks to a `TaskStore`. Cheap to clone when the store is.
#[derive(Debug, Clone)]
pub struct TaskDistributor<S> {
    store: S,
}

impl<S: TaskStore> TaskDistributor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Serialize `payload` as JSON and enqueue it under `task_type`.
    pub async fn enqueue<P>(
        &self,
        task_type: &str,
        payload: &P,
        opts: TaskOptions,
    ) -> Result<TaskInfo, TaskError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        let task = Task::new(task_type, payload, &opts);
        let info = task.info();

        info!(
            task_id = %info.id,
            task_type = %info.task_type,
            payload = %task.payload,
            queue = %info.queue,
            max_retry = info.max_retry,
            process_at = %info.process_at,
            "enqueued task"
        );

        self.store.enqueue(task).await?;
        Ok(info)
    }
}
