//! Result notifier: delivers the terminal outcome of a task to whoever
//! requested it.
//!
//! The engine calls the notifier exactly once per terminal transition. How the
//! message reaches the requester is the notifier's business; failures are
//! logged and never change task state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::error::NotifyError;
use crate::worker::task::Task;

/// Terminal status reported to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failure,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "completed"),
            Self::Failure => write!(f, "failed"),
        }
    }
}

/// What the requester learns about a finished task.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub task_id: Uuid,
    pub logical_type: String,
    pub status: OutcomeStatus,
    /// Short human-readable line.
    pub summary: String,
    /// Last error, on failure.
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    /// Duration of the final attempt.
    pub duration: Option<Duration>,
}

impl Outcome {
    pub fn success(task: &Task, summary: Option<String>, completed_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            logical_type: task.logical_type.clone(),
            status: OutcomeStatus::Success,
            summary: summary.unwrap_or_else(|| format!("{} completed", task.logical_type)),
            error: None,
            retry_count: task.retry_count,
            started_at: task.started_at,
            completed_at,
            duration: attempt_duration(task.started_at, completed_at),
        }
    }

    pub fn failure(task: &Task, error: &str, completed_at: DateTime<Utc>) -> Self {
        let summary = if task.retry_count > 0 {
            format!(
                "{} failed after {} retries: {error}",
                task.logical_type, task.retry_count
            )
        } else {
            format!("{} failed: {error}", task.logical_type)
        };
        Self {
            task_id: task.id,
            logical_type: task.logical_type.clone(),
            status: OutcomeStatus::Failure,
            summary,
            error: Some(error.to_string()),
            retry_count: task.retry_count,
            started_at: task.started_at,
            completed_at,
            duration: attempt_duration(task.started_at, completed_at),
        }
    }
}

fn attempt_duration(started_at: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Option<Duration> {
    started_at.and_then(|start| end.signed_duration_since(start).to_std().ok())
}

/// Delivers outcomes to requesters.
#[async_trait]
pub trait ResultNotifier: Send + Sync {
    async fn notify(&self, requester_ref: Option<&str>, outcome: &Outcome)
    -> Result<(), NotifyError>;
}

/// The single active notifier, swappable at runtime.
pub struct NotifierHandle {
    inner: RwLock<Arc<dyn ResultNotifier>>,
}

impl NotifierHandle {
    pub fn new(notifier: Arc<dyn ResultNotifier>) -> Self {
        Self {
            inner: RwLock::new(notifier),
        }
    }

    /// Replace the active notifier. In-flight deliveries finish on the old one.
    pub async fn set(&self, notifier: Arc<dyn ResultNotifier>) {
        *self.inner.write().await = notifier;
    }

    pub async fn current(&self) -> Arc<dyn ResultNotifier> {
        Arc::clone(&*self.inner.read().await)
    }

    /// Deliver an outcome within `timeout`. Failures are logged only.
    pub async fn deliver(&self, requester_ref: Option<&str>, outcome: &Outcome, timeout: Duration) {
        let notifier = self.current().await;
        let result = match tokio::time::timeout(timeout, notifier.notify(requester_ref, outcome))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(timeout)),
        };
        if let Err(e) = result {
            tracing::error!(
                task_id = %outcome.task_id,
                requester = requester_ref.unwrap_or("-"),
                "Failed to notify requester: {}", e
            );
        }
    }
}

impl Default for NotifierHandle {
    fn default() -> Self {
        Self::new(Arc::new(LogNotifier))
    }
}

/// Writes outcomes to the log. The default notifier.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl ResultNotifier for LogNotifier {
    async fn notify(
        &self,
        requester_ref: Option<&str>,
        outcome: &Outcome,
    ) -> Result<(), NotifyError> {
        match outcome.status {
            OutcomeStatus::Success => tracing::info!(
                task_id = %outcome.task_id,
                logical_type = %outcome.logical_type,
                requester = requester_ref.unwrap_or("-"),
                "{}", outcome.summary
            ),
            OutcomeStatus::Failure => tracing::warn!(
                task_id = %outcome.task_id,
                logical_type = %outcome.logical_type,
                requester = requester_ref.unwrap_or("-"),
                retries = outcome.retry_count,
                "{}", outcome.summary
            ),
        }
        Ok(())
    }
}

/// A formatted outcome ready for a delivery channel.
#[derive(Debug, Clone)]
pub struct Notification {
    pub requester_ref: Option<String>,
    pub task_id: Uuid,
    pub status: OutcomeStatus,
    pub content: String,
}

/// Forwards formatted outcomes to a channel consumer (chat bridge, mailer...).
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ResultNotifier for ChannelNotifier {
    async fn notify(
        &self,
        requester_ref: Option<&str>,
        outcome: &Outcome,
    ) -> Result<(), NotifyError> {
        let notification = Notification {
            requester_ref: requester_ref.map(String::from),
            task_id: outcome.task_id,
            status: outcome.status,
            content: format_outcome(outcome),
        };
        self.tx
            .send(notification)
            .await
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

/// Render an outcome as a short chat message.
pub fn format_outcome(outcome: &Outcome) -> String {
    let icon = match outcome.status {
        OutcomeStatus::Success => "✅",
        OutcomeStatus::Failure => "❌",
    };
    let mut message = format!(
        "{} *Task '{}'*: {}\n\n{}",
        icon, outcome.logical_type, outcome.status, outcome.summary
    );
    if let Some(duration) = outcome.duration {
        message.push_str(&format!("\n\n_took {:.1}s_", duration.as_secs_f64()));
    }
    message
}
