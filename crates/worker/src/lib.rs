//! `bank-worker` — background tasks with queue priorities, retry and backoff.
//!
//! ## Components
//!
//! - `Task`: payload plus delivery metadata (queue, retries, schedule)
//! - `TaskStore`: persistence for tasks (in-memory or Postgres)
//! - `TaskDistributor`: producer side, enqueues typed payloads;
//!   `enqueue_in` stages them inside an open ledger scope instead
//! - `TaskProcessor`: worker pool that runs registered handlers, retries
//!   failures with backoff and marks exhausted tasks dead
//! - `send_verify_email`: the verification email task for new users

pub mod distributor;
pub mod mail;
pub mod postgres;
pub mod processor;
pub mod send_verify_email;
pub mod store;
pub mod types;

pub use distributor::{TaskDistributor, TaskError, enqueue_in};
pub use mail::{Email, EmailSender, TracingEmailSender};
pub use postgres::{PostgresTaskStore, ensure_task_schema};
pub use processor::{
    ProcessError, ProcessorConfig, ProcessorStats, TaskHandler, TaskProcessor, TaskProcessorHandle,
};
pub use send_verify_email::{
    PayloadSendVerifyEmail, SendVerifyEmail, TASK_SEND_VERIFY_EMAIL, after_create_options,
    distribute_task_send_verify_email_in, enqueue_verify_email, verify_email_url,
};
pub use store::{InMemoryTaskStore, QueueStats, TaskStore, TaskStoreError};
pub use types::{
    BackoffStrategy, LEASE_EXPIRED, QUEUE_CRITICAL, QUEUE_DEFAULT, QueueConfig, RetryPolicy, Task, TaskId,
    TaskInfo, TaskOptions, TaskState,
};
