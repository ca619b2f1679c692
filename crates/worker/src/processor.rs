//! Task processor: pull tasks by queue priority, run handlers, retry with
//! backoff, kill tasks that exhaust their retries.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bank_core::LedgerError;

use super::store::{TaskStore, TaskStoreError};
use super::types::{QueueConfig, RetryPolicy, Task, TaskState};

/// Handler failure.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Transient failure; the task is retried while it has retries left.
    #[error("{0:#}")]
    Retry(anyhow::Error),
    /// Permanent failure; the task dies without consuming retries.
    #[error("skip retry: {0:#}")]
    SkipRetry(anyhow::Error),
}

impl ProcessError {
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Self::Retry(err.into())
    }

    pub fn skip_retry(err: impl Into<anyhow::Error>) -> Self {
        Self::SkipRetry(err.into())
    }
}

impl From<anyhow::Error> for ProcessError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retry(err)
    }
}

impl From<LedgerError> for ProcessError {
    fn from(err: LedgerError) -> Self {
        Self::Retry(err.into())
    }
}

/// Task handler function type.
pub type TaskHandler = Arc<dyn Fn(Task) -> BoxFuture<'static, Result<(), ProcessError>> + Send + Sync>;

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name for logging
    pub name: String,
    /// Workers spawned by `start`
    pub concurrency: usize,
    /// Sleep between polls when no task is due
    pub poll_interval: Duration,
    pub queues: QueueConfig,
    pub retry: RetryPolicy,
    /// How long a claimed task stays reserved for its worker. A task still
    /// active past its lease is assumed orphaned and handed out again, so
    /// this must exceed the slowest handler run.
    pub lease: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(100),
            queues: QueueConfig::default(),
            retry: RetryPolicy::default(),
            lease: Duration::from_secs(300),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_queues(mut self, queues: QueueConfig) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Processor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    /// Failed runs, including the final one of a task that died.
    pub failed: u64,
    pub dead: u64,
    pub running: usize,
    pub uptime_secs: u64,
}

/// Pulls tasks from a `TaskStore` and runs the registered handlers.
pub struct TaskProcessor<S> {
    store: S,
    handlers: HashMap<String, TaskHandler>,
    config: ProcessorConfig,
    stats: Arc<Mutex<ProcessorStats>>,
    started: Instant,
}

impl<S: TaskStore> TaskProcessor<S> {
    pub fn new(store: S, config: ProcessorConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            config,
            stats: Arc::new(Mutex::new(ProcessorStats::default())),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Register the handler for `task_type`, replacing any previous one.
    pub fn register_handler<F, Fut>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
    {
        // The call happens on first poll, inside `execute`'s unwind guard.
        let handler = Arc::new(handler);
        self.handlers.insert(
            task_type.into(),
            Arc::new(move |task: Task| {
                let handler = handler.clone();
                async move { handler(task).await }.boxed()
            }),
        );
    }

    pub fn stats(&self) -> ProcessorStats {
        snapshot(&self.stats, self.started)
    }

    /// Claim and run at most one due task.
    ///
    /// Returns the task as stored after the run, or `None` when no queue had
    /// a due task.
    pub async fn process_next(&self) -> Result<Option<Task>, TaskStoreError> {
        let queues = self.config.queues.poll_order(&mut rand::thread_rng());
        let Some(mut task) = self.store.dequeue(&queues, self.config.lease).await? else {
            return Ok(None);
        };

        debug!(
            processor = %self.config.name,
            task_id = %task.id,
            task_type = %task.task_type,
            queue = %task.queue,
            "claimed task"
        );

        self.update_stats(|s| s.running += 1);
        let succeeded = self.execute(&mut task).await;
        let stored = self.store.update(&task).await;
        self.update_stats(|s| {
            s.running = s.running.saturating_sub(1);
            s.processed += 1;
            if succeeded {
                s.succeeded += 1;
            } else {
                s.failed += 1;
                if task.state == TaskState::Dead {
                    s.dead += 1;
                }
            }
        });

        stored?;
        Ok(Some(task))
    }

    /// Poll until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A task already running when shutdown is requested is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(processor = %self.config.name, "task worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(processor = %self.config.name, error = %e, "failed to process task");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(processor = %self.config.name, "task worker stopped");
    }

    /// Spawn `concurrency` workers on the current tokio runtime.
    pub fn start(self) -> TaskProcessorHandle
    where
        S: 'static,
    {
        let workers = self.config.concurrency.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let started = self.started;

        info!(
            processor = %self.config.name,
            concurrency = workers,
            queues = ?self.config.queues.queues(),
            strict = self.config.queues.is_strict(),
            "task processor started"
        );

        let processor = Arc::new(self);
        let joins = (0..workers)
            .map(|_| {
                let processor = processor.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { processor.run(shutdown).await })
            })
            .collect();

        TaskProcessorHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started,
        }
    }

    /// Run the handler and record the outcome on `task`. Returns whether the
    /// handler succeeded.
    async fn execute(&self, task: &mut Task) -> bool {
        let result = match self.handlers.get(&task.task_type) {
            Some(handler) => {
                let run = handler(task.clone());
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(ProcessError::Retry(anyhow::anyhow!("handler panicked"))),
                }
            }
            None => Err(ProcessError::Retry(anyhow::anyhow!(
                "no handler registered for task type {}",
                task.task_type
            ))),
        };

        match result {
            Ok(()) => {
                task.mark_completed();
                debug!(task_id = %task.id, task_type = %task.task_type, "task completed");
                true
            }
            Err(ProcessError::SkipRetry(err)) => {
                task.mark_dead(format!("{err:#}"));
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    payload = %task.payload,
                    queue = %task.queue,
                    error = %format!("{err:#}"),
                    "task failed; not retrying"
                );
                false
            }
            Err(ProcessError::Retry(err)) => {
                task.mark_failed(format!("{err:#}"), &self.config.retry, Utc::now());
                if task.state == TaskState::Dead {
                    error!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        payload = %task.payload,
                        queue = %task.queue,
                        retried = task.retried,
                        error = %format!("{err:#}"),
                        "task failed; retries exhausted"
                    );
                } else {
                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        payload = %task.payload,
                        queue = %task.queue,
                        retried = task.retried,
                        max_retry = task.max_retry,
                        next_run_at = %task.process_at,
                        error = %format!("{err:#}"),
                        "task failed; retry scheduled"
                    );
                }
                false
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ProcessorStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }
}

/// Handle to a started processor.
#[derive(Debug)]
pub struct TaskProcessorHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ProcessorStats>>,
    started: Instant,
}

impl TaskProcessorHandle {
    /// Stop polling, let in-flight tasks finish, and wait for all workers.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "task worker terminated abnormally");
            }
        }
    }

    /// Current processor statistics.
    pub fn stats(&self) -> ProcessorStats {
        snapshot(&self.stats, self.started)
    }
}

fn snapshot(stats: &Mutex<ProcessorStats>, started: Instant) -> ProcessorStats {
    let mut s = stats.lock().unwrap_or_else(|p| p.into_inner()).clone();
    s.uptime_secs = started.elapsed().as_secs();
    s
}
