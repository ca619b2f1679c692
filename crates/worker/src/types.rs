//! Core task types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bank_store::EnqueueTaskParams;

/// Queue for work that should run ahead of everything else.
pub const QUEUE_CRITICAL: &str = "critical";
/// Queue used when a task names none.
pub const QUEUE_DEFAULT: &str = "default";

/// `last_error` of a task reclaimed after its worker vanished.
pub const LEASE_EXPIRED: &str = "task lease expired";

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Enqueued, waiting for its first run
    Pending,
    /// Claimed by a worker
    Active,
    /// Failed, scheduled to run again
    Retry,
    /// Handler succeeded
    Completed,
    /// Retries exhausted or failure marked non-retryable
    Dead,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Completed => "completed",
            TaskState::Dead => "dead",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Dead)
    }

    /// Whether a worker may claim a task in this state.
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Retry)
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "active" => Ok(TaskState::Active),
            "retry" => Ok(TaskState::Retry),
            "completed" => Ok(TaskState::Completed),
            "dead" => Ok(TaskState::Dead),
            other => Err(format!("invalid task state: {other}")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Delay before each retry of a failed task.
///
/// How many retries a task gets is a property of the task (`max_retry`);
/// this only decides how long to wait between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Retry immediately. Mostly useful in tests.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(retry.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * retry as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the retry number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((retry as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Named queues with weights, fixed at processor construction.
///
/// Weighted mode orders the queues for each poll by a weighted random draw,
/// so a queue with weight 10 is tried first about twice as often as one with
/// weight 5. Strict mode always drains higher weights first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    queues: Vec<(String, u32)>,
    strict: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queues: vec![(QUEUE_CRITICAL.to_string(), 10), (QUEUE_DEFAULT.to_string(), 5)],
            strict: false,
        }
    }
}

impl QueueConfig {
    /// Empty configuration; add queues with `with_queue`.
    pub fn new() -> Self {
        Self {
            queues: Vec::new(),
            strict: false,
        }
    }

    /// Add (or re-weight) a queue. Weights below 1 are raised to 1.
    pub fn with_queue(mut self, name: impl Into<String>, weight: u32) -> Self {
        let name = name.into();
        let weight = weight.max(1);
        match self.queues.iter().position(|(n, _)| *n == name) {
            Some(i) => self.queues[i].1 = weight,
            None => self.queues.push((name, weight)),
        }
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn queues(&self) -> &[(String, u32)] {
        &self.queues
    }

    /// Queue names in the order one poll should try them.
    pub fn poll_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        let mut remaining: Vec<&(String, u32)> = self.queues.iter().collect();

        if self.strict {
            remaining.sort_by(|a, b| b.1.cmp(&a.1));
            return remaining.into_iter().map(|(name, _)| name.clone()).collect();
        }

        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
            let mut pick = rng.gen_range(0..total);
            let idx = remaining
                .iter()
                .position(|(_, w)| {
                    let w = u64::from(*w);
                    if pick < w {
                        true
                    } else {
                        pick -= w;
                        false
                    }
                })
                .unwrap_or(0);
            order.push(remaining.remove(idx).0.clone());
        }
        order
    }
}

/// Parse `name=weight` pairs separated by commas, e.g. `critical=10,default=5`.
impl FromStr for QueueConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = QueueConfig::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, weight) = part
                .split_once('=')
                .ok_or_else(|| format!("expected name=weight, got {part:?}"))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("empty queue name in {part:?}"));
            }
            let weight: u32 = weight
                .trim()
                .parse()
                .map_err(|_| format!("invalid weight in {part:?}"))?;
            if weight == 0 {
                return Err(format!("weight must be at least 1 in {part:?}"));
            }
            config = config.with_queue(name, weight);
        }
        if config.queues.is_empty() {
            return Err("at least one queue is required".to_string());
        }
        Ok(config)
    }
}

/// Delivery options for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: String,
    pub max_retry: u32,
    /// Minimum delay before the first run.
    pub process_in: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: QUEUE_DEFAULT.to_string(),
            max_retry: 25,
            process_in: Duration::ZERO,
        }
    }
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Routes the task to its handler, e.g. `task:send_verify_email`
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub state: TaskState,
    /// Retries consumed so far
    pub retried: u32,
    pub max_retry: u32,
    pub last_error: Option<String>,
    /// Not claimable before this instant
    pub process_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value, opts: &TaskOptions) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            queue: opts.queue.clone(),
            state: TaskState::Pending,
            retried: 0,
            max_retry: opts.max_retry,
            last_error: None,
            process_at: after(now, opts.process_in),
            created_at: now,
            updated_at: now,
        }
    }

    /// Claimable: runnable state and due.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state.is_runnable() && self.process_at <= now
    }

    /// Claim the task for `lease`. While active, `process_at` holds the
    /// lease deadline; past it the task counts as abandoned.
    pub fn mark_active(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.state = TaskState::Active;
        self.process_at = after(now, lease);
        self.updated_at = now;
    }

    /// Reclaim an active task whose lease ran out, as if its attempt had
    /// failed. Returns whether the task was reclaimed.
    pub fn recover_expired_lease(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Active || self.process_at > now {
            return false;
        }
        self.last_error = Some(LEASE_EXPIRED.to_string());
        self.updated_at = now;
        if self.retried < self.max_retry {
            self.retried += 1;
            self.process_at = now;
            self.state = TaskState::Retry;
        } else {
            self.state = TaskState::Dead;
        }
        true
    }

    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Record a retryable failure: schedule the next retry with `policy`'s
    /// backoff, or kill the task once `max_retry` retries are used up.
    pub fn mark_failed(&mut self, error: String, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.last_error = Some(error);
        self.updated_at = now;

        if self.retried < self.max_retry {
            self.retried += 1;
            self.process_at = after(now, policy.delay_for_retry(self.retried));
            self.state = TaskState::Retry;
        } else {
            self.state = TaskState::Dead;
        }
    }

    /// Kill the task without consuming a retry.
    pub fn mark_dead(&mut self, error: String) {
        self.last_error = Some(error);
        self.state = TaskState::Dead;
        self.updated_at = Utc::now();
    }

    /// The row that stages this task inside a ledger scope.
    pub fn enqueue_params(&self) -> EnqueueTaskParams {
        EnqueueTaskParams {
            id: self.id.0,
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            queue: self.queue.clone(),
            max_retry: self.max_retry,
            process_at: self.process_at,
            created_at: self.created_at,
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            task_type: self.task_type.clone(),
            queue: self.queue.clone(),
            state: self.state,
            max_retry: self.max_retry,
            process_at: self.process_at,
        }
    }
}

/// A task committed through a ledger scope starts out pending.
impl From<EnqueueTaskParams> for Task {
    fn from(params: EnqueueTaskParams) -> Self {
        Self {
            id: TaskId::from_uuid(params.id),
            task_type: params.task_type,
            payload: params.payload,
            queue: params.queue,
            state: TaskState::Pending,
            retried: 0,
            max_retry: params.max_retry,
            last_error: None,
            process_at: params.process_at,
            created_at: params.created_at,
            updated_at: params.created_at,
        }
    }
}

/// What the producer learns about an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub queue: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
