//! Task record and the context handed to handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::state::TaskStatus;

/// Origin tag for tasks submitted through the enqueue API.
pub const ORIGIN_API: &str = "api";

/// A unit of schedulable, retryable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Key resolved against the handler registry.
    pub logical_type: String,
    /// Handler-specific input; the engine never looks inside.
    pub payload: serde_json::Value,
    /// Higher is served first.
    pub priority: i32,
    pub status: TaskStatus,
    /// Not eligible for claim before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Opaque reference forwarded to the result notifier.
    pub requester_ref: Option<String>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Producer tag, e.g. `api` or `schedule:<name>`.
    pub origin: String,
    /// Token of the claim currently holding the task. Every post-claim write
    /// must present it.
    pub claim_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a fresh pending task.
    pub fn new(
        logical_type: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            logical_type: logical_type.into(),
            payload,
            priority,
            status: TaskStatus::Pending,
            scheduled_at: None,
            retry_count: 0,
            max_retries: 2,
            requester_ref: None,
            output: None,
            error_message: None,
            origin: ORIGIN_API.to_string(),
            claim_id: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the task may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Whether another failure would still be retried.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// What a handler sees about the task it is executing.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub logical_type: String,
    /// Zero on the first attempt.
    pub attempt: u32,
    pub max_retries: u32,
    pub requester_ref: Option<String>,
    pub origin: String,
}

impl TaskContext {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            logical_type: task.logical_type.clone(),
            attempt: task.retry_count,
            max_retries: task.max_retries,
            requester_ref: task.requester_ref.clone(),
            origin: task.origin.clone(),
        }
    }

    /// Whether this is the last attempt the engine will make.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    #[test]
    fn new_task_is_pending() {
        let now = Utc::now();
        let task = Task::new("summarize", serde_json::json!({"url": "x"}), 5, now);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.origin, ORIGIN_API);
        assert!(task.is_eligible(now));
    }

    #[test]
    fn scheduled_task_not_eligible_early() {
        let now = Utc::now();
        let mut task = Task::new("summarize", serde_json::Value::Null, 5, now);
        task.scheduled_at = Some(now + ChronoDuration::seconds(60));
        assert!(!task.is_eligible(now));
        assert!(!task.is_eligible(now + ChronoDuration::seconds(59)));
        assert!(task.is_eligible(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn ids_are_unique() {
        let now = Utc::now();
        let a = Task::new("t", serde_json::Value::Null, 5, now);
        let b = Task::new("t", serde_json::Value::Null, 5, now);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn retries_left() {
        let mut task = Task::new("t", serde_json::Value::Null, 5, Utc::now());
        task.max_retries = 1;
        assert!(task.has_retries_left());
        task.retry_count = 1;
        assert!(!task.has_retries_left());
    }

    #[test]
    fn context_marks_final_attempt() {
        let mut task = Task::new("t", serde_json::Value::Null, 5, Utc::now());
        task.max_retries = 2;
        task.retry_count = 2;
        let ctx = TaskContext::for_task(&task);
        assert!(ctx.is_final_attempt());
        assert_eq!(ctx.attempt, 2);
    }
}
