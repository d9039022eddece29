//! Queue frontend: validates submissions and turns them into durable
//! `pending` tasks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{DatabaseError, QueueError};
use crate::store::TaskStore;
use crate::worker::task::{ORIGIN_API, Task};

/// A request to run one task.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub logical_type: String,
    pub payload: serde_json::Value,
    /// `None` uses the configured default.
    pub priority: Option<i32>,
    /// Seconds to wait before the task becomes eligible.
    pub delay_secs: i64,
    pub requester_ref: Option<String>,
    /// `None` uses the configured default.
    pub max_retries: Option<u32>,
    /// `None` means `api`.
    pub origin: Option<String>,
}

impl EnqueueRequest {
    pub fn new(logical_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            logical_type: logical_type.into(),
            payload,
            priority: None,
            delay_secs: 0,
            requester_ref: None,
            max_retries: None,
            origin: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay_secs(mut self, delay_secs: i64) -> Self {
        self.delay_secs = delay_secs;
        self
    }

    pub fn with_requester(mut self, requester_ref: impl Into<String>) -> Self {
        self.requester_ref = Some(requester_ref.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// Anything that accepts task submissions. The schedule registrar only
/// depends on this.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Check a request without enqueueing it.
    fn validate(&self, request: &EnqueueRequest) -> Result<(), QueueError>;

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, QueueError>;
}

/// Check a request against the queue limits and return its effective
/// priority.
pub fn validate_request(config: &QueueConfig, request: &EnqueueRequest) -> Result<i32, QueueError> {
    if request.logical_type.trim().is_empty() {
        return Err(QueueError::EmptyLogicalType);
    }
    let priority = request.priority.unwrap_or(config.default_priority);
    if priority < config.min_priority || priority > config.max_priority {
        return Err(QueueError::InvalidPriority {
            value: priority,
            min: config.min_priority,
            max: config.max_priority,
        });
    }
    if request.delay_secs < 0 {
        return Err(QueueError::NegativeDelay(request.delay_secs));
    }
    if request.delay_secs > config.max_delay_secs {
        return Err(QueueError::DelayTooLarge {
            value: request.delay_secs,
            max: config.max_delay_secs,
        });
    }
    Ok(priority)
}

/// `now + delay_secs`, or `DelayTooLarge` when that is not a representable
/// instant.
fn eligible_at(
    now: DateTime<Utc>,
    delay_secs: i64,
    max_delay_secs: i64,
) -> Result<DateTime<Utc>, QueueError> {
    TimeDelta::try_seconds(delay_secs)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or(QueueError::DelayTooLarge {
            value: delay_secs,
            max: max_delay_secs,
        })
}

/// The enqueue entry point backed by a [`TaskStore`].
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    wake: Option<Arc<Notify>>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
            wake: None,
        }
    }

    /// Wake `notify` whenever an immediate high-priority task arrives.
    pub fn with_fast_path(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Validate and persist a task. Returns once the task is durable.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, QueueError> {
        let task = self.build_task(request)?;
        self.store.insert_task(&task).await?;

        tracing::info!(
            task_id = %task.id,
            logical_type = %task.logical_type,
            priority = task.priority,
            origin = %task.origin,
            delayed = task.scheduled_at.is_some(),
            "Task enqueued"
        );

        if task.scheduled_at.is_none()
            && task.priority >= self.config.fast_path_priority
            && let Some(ref wake) = self.wake
        {
            tracing::debug!(task_id = %task.id, "Fast-path wake");
            wake.notify_one();
        }

        Ok(task.id)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.store.get_task(id).await
    }

    fn build_task(&self, request: EnqueueRequest) -> Result<Task, QueueError> {
        let priority = validate_request(&self.config, &request)?;

        let now = self.clock.now();
        let mut task = Task::new(request.logical_type, request.payload, priority, now);
        if request.delay_secs > 0 {
            task.scheduled_at = Some(eligible_at(
                now,
                request.delay_secs,
                self.config.max_delay_secs,
            )?);
        }
        task.max_retries = request
            .max_retries
            .unwrap_or(self.config.default_max_retries);
        task.requester_ref = request.requester_ref;
        task.origin = request.origin.unwrap_or_else(|| ORIGIN_API.to_string());
        Ok(task)
    }
}

#[async_trait]
impl TaskSink for TaskQueue {
    fn validate(&self, request: &EnqueueRequest) -> Result<(), QueueError> {
        validate_request(&self.config, request).map(|_| ())
    }

    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, QueueError> {
        TaskQueue::enqueue(self, request).await
    }
}
