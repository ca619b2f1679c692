//! Task storage implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use bank_core::{LedgerError, LedgerResult};
use bank_store::{EnqueueTaskParams, TaskOutbox};

use super::types::{Task, TaskId, TaskState};

/// Task store abstraction.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task.
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError>;

    /// Claim the next ready task, trying `queues` in the given order.
    ///
    /// Within a queue the task due earliest wins. The claimed task is
    /// returned already marked `Active` and leased for `lease`; `None` when
    /// nothing is due. Active tasks in `queues` whose lease ran out are
    /// reclaimed first (see `Task::recover_expired_lease`).
    async fn dequeue(&self, queues: &[String], lease: Duration) -> Result<Option<Task>, TaskStoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// Overwrite a task's mutable fields.
    async fn update(&self, task: &Task) -> Result<(), TaskStoreError>;

    /// Tasks in `state` (all states when `None`), oldest first.
    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>, TaskStoreError>;

    /// Per-queue counts by state.
    async fn stats(&self) -> Result<Vec<QueueStats>, TaskStoreError>;
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        (**self).enqueue(task).await
    }

    async fn dequeue(&self, queues: &[String], lease: Duration) -> Result<Option<Task>, TaskStoreError> {
        (**self).dequeue(queues, lease).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(id).await
    }

    async fn update(&self, task: &Task) -> Result<(), TaskStoreError> {
        (**self).update(task).await
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list(state, limit).await
    }

    async fn stats(&self) -> Result<Vec<QueueStats>, TaskStoreError> {
        (**self).stats().await
    }
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: usize,
    pub active: usize,
    pub retry: usize,
    pub completed: usize,
    pub dead: usize,
}

impl QueueStats {
    pub(crate) fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub(crate) fn add(&mut self, state: TaskState, count: usize) {
        match state {
            TaskState::Pending => self.pending += count,
            TaskState::Active => self.active += count,
            TaskState::Retry => self.retry += count,
            TaskState::Completed => self.completed += count,
            TaskState::Dead => self.dead += count,
        }
    }
}

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TaskId, Task>>, TaskStoreError> {
        self.tasks
            .read()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TaskId, Task>>, TaskStoreError> {
        self.tasks
            .write()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        let mut tasks = self.write()?;
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    async fn dequeue(&self, queues: &[String], lease: Duration) -> Result<Option<Task>, TaskStoreError> {
        let mut tasks = self.write()?;
        let now = Utc::now();

        for task in tasks.values_mut().filter(|t| queues.contains(&t.queue)) {
            if task.recover_expired_lease(now) {
                warn!(task_id = %task.id, state = task.state.as_str(), "reclaimed task with expired lease");
            }
        }

        for queue in queues {
            let next = tasks
                .values()
                .filter(|t| t.queue == *queue && t.is_ready(now))
                .min_by_key(|t| (t.process_at, t.created_at, t.id.0))
                .map(|t| t.id);

            if let Some(task) = next.and_then(|id| tasks.get_mut(&id)) {
                task.mark_active(now, lease);
                return Ok(Some(task.clone()));
            }
        }

        Ok(None)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<(), TaskStoreError> {
        let mut tasks = self.write()?;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(TaskStoreError::NotFound(task.id)),
        }
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let tasks = self.read()?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| state.is_none_or(|s| t.state == s))
            .cloned()
            .collect();

        result.sort_by_key(|t| (t.created_at, t.id.0));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<Vec<QueueStats>, TaskStoreError> {
        let tasks = self.read()?;
        let mut by_queue: BTreeMap<&str, QueueStats> = BTreeMap::new();
        for task in tasks.values() {
            by_queue
                .entry(task.queue.as_str())
                .or_insert_with(|| QueueStats::new(task.queue.as_str()))
                .add(task.state, 1);
        }
        Ok(by_queue.into_values().collect())
    }
}

/// Tasks staged in an `InMemoryDatabase` scope land here on commit.
impl TaskOutbox for InMemoryTaskStore {
    fn publish(&self, tasks: Vec<EnqueueTaskParams>) -> LedgerResult<()> {
        let mut stored = self.write().map_err(LedgerError::internal)?;
        if let Some(dup) = tasks.iter().find(|t| stored.contains_key(&TaskId::from_uuid(t.id))) {
            return Err(LedgerError::conflict(format!("task already exists: {}", dup.id)));
        }
        for params in tasks {
            let task = Task::from(params);
            stored.insert(task.id, task);
        }
        Ok(())
    }
}
