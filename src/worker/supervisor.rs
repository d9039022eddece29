//! Execution supervisor — runs one claimed task and applies the
//! retry/timeout/failure policy.
//!
//! | Result                                | Transition            | Notify |
//! |---------------------------------------|-----------------------|--------|
//! | handler Ok within timeout             | processing → completed | yes   |
//! | Err/timeout/panic, retries remain     | processing → pending   | no    |
//! | Err/timeout/panic, retries exhausted  | processing → failed    | yes   |
//! | missing handler or permanent error    | processing → failed    | yes   |
//!
//! Every write presents the task's `claim_id`; if it no longer matches the
//! outcome is `Lost` and nothing is written or notified.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinError;

use crate::clock::Clock;
use crate::config::ExecutionConfig;
use crate::error::{DatabaseError, HandlerError};
use crate::handlers::{HandlerOutput, HandlerRegistry};
use crate::notify::{NotifierHandle, Outcome};
use crate::store::TaskStore;
use crate::worker::task::{Task, TaskContext};

/// Error recorded when a handler exceeds its time budget.
pub const TIMEOUT_ERROR: &str = "timeout";

/// Error recorded when a claim is recovered after its worker disappeared.
pub const ABANDONED_ERROR: &str = "abandoned";

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Returned to `pending`; eligible again at `retry_at`.
    Retrying {
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    /// Another writer owns the task now; nothing was written.
    Lost,
}

/// How one handler invocation ended.
enum Attempt {
    Succeeded(HandlerOutput),
    Failed(HandlerError),
    TimedOut,
    Panicked(JoinError),
}

/// Runs claimed tasks to their next state.
pub struct Supervisor {
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    notifier: Arc<NotifierHandle>,
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        handlers: Arc<HandlerRegistry>,
        notifier: Arc<NotifierHandle>,
        clock: Arc<dyn Clock>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            notifier,
            clock,
            config,
        }
    }

    /// Execute a task that was just claimed.
    pub async fn execute(&self, task: Task) -> Result<TaskOutcome, DatabaseError> {
        if task.claim_id.is_none() {
            tracing::warn!(task_id = %task.id, "Refusing to execute unclaimed task");
            return Ok(TaskOutcome::Lost);
        }

        let Some(handler) = self.handlers.resolve(&task.logical_type).await else {
            let error = format!("no handler registered for '{}'", task.logical_type);
            tracing::error!(task_id = %task.id, logical_type = %task.logical_type, "{}", error);
            return self.fail(&task, &error).await;
        };

        let timeout = handler
            .execution_timeout()
            .unwrap_or(self.config.handler_timeout);
        let ctx = TaskContext::for_task(&task);
        let payload = task.payload.clone();

        tracing::info!(
            task_id = %task.id,
            logical_type = %task.logical_type,
            attempt = task.retry_count + 1,
            "Task started"
        );

        let start = Instant::now();
        let mut join = tokio::spawn(async move { handler.handle(&ctx, payload).await });
        let attempt = match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(Ok(output))) => Attempt::Succeeded(output),
            Ok(Ok(Err(e))) => Attempt::Failed(e),
            Ok(Err(join_err)) => Attempt::Panicked(join_err),
            Err(_) => {
                join.abort();
                Attempt::TimedOut
            }
        };
        let elapsed = start.elapsed();

        match attempt {
            Attempt::Succeeded(output) => self.complete(&task, output, elapsed).await,
            Attempt::Failed(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Handler failed"
                );
                if e.is_retryable() {
                    self.retry_or_fail(&task, &e.to_string()).await
                } else {
                    self.fail(&task, &e.to_string()).await
                }
            }
            Attempt::TimedOut => {
                tracing::warn!(
                    task_id = %task.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Handler timed out"
                );
                self.retry_or_fail(&task, TIMEOUT_ERROR).await
            }
            Attempt::Panicked(join_err) => {
                let error = format!("handler panicked: {join_err}");
                tracing::error!(task_id = %task.id, "{}", error);
                self.retry_or_fail(&task, &error).await
            }
        }
    }

    /// Put an abandoned claim back through the failure policy.
    pub async fn recover_abandoned(&self, task: &Task) -> Result<TaskOutcome, DatabaseError> {
        tracing::warn!(
            task_id = %task.id,
            started_at = ?task.started_at,
            "Recovering abandoned claim"
        );
        self.retry_or_fail(task, ABANDONED_ERROR).await
    }

    async fn complete(
        &self,
        task: &Task,
        output: HandlerOutput,
        elapsed: Duration,
    ) -> Result<TaskOutcome, DatabaseError> {
        let Some(claim_id) = task.claim_id else {
            return Ok(TaskOutcome::Lost);
        };
        let now = self.clock.now();
        if !self
            .store
            .complete_task(task.id, claim_id, &output.value, now)
            .await?
        {
            return Ok(self.lost(task));
        }

        tracing::info!(
            task_id = %task.id,
            logical_type = %task.logical_type,
            elapsed_ms = elapsed.as_millis() as u64,
            "Task completed"
        );
        let outcome = Outcome::success(task, output.summary, now);
        self.notify(task, &outcome).await;
        Ok(TaskOutcome::Completed)
    }

    async fn retry_or_fail(&self, task: &Task, error: &str) -> Result<TaskOutcome, DatabaseError> {
        if !task.has_retries_left() {
            return self.fail(task, error).await;
        }
        let Some(claim_id) = task.claim_id else {
            return Ok(TaskOutcome::Lost);
        };

        let delay = chrono::Duration::from_std(self.config.retry_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let retry_at = self
            .clock
            .now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if !self
            .store
            .retry_task(task.id, claim_id, error, retry_at)
            .await?
        {
            return Ok(self.lost(task));
        }

        let retry_count = task.retry_count + 1;
        tracing::warn!(
            task_id = %task.id,
            logical_type = %task.logical_type,
            retry_count,
            max_retries = task.max_retries,
            retry_at = %retry_at,
            "Task scheduled for retry"
        );
        Ok(TaskOutcome::Retrying {
            retry_count,
            retry_at,
        })
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<TaskOutcome, DatabaseError> {
        let Some(claim_id) = task.claim_id else {
            return Ok(TaskOutcome::Lost);
        };
        let now = self.clock.now();
        if !self.store.fail_task(task.id, claim_id, error, now).await? {
            return Ok(self.lost(task));
        }

        tracing::error!(
            task_id = %task.id,
            logical_type = %task.logical_type,
            retry_count = task.retry_count,
            error,
            "Task failed"
        );
        let outcome = Outcome::failure(task, error, now);
        self.notify(task, &outcome).await;
        Ok(TaskOutcome::Failed {
            error: error.to_string(),
        })
    }

    async fn notify(&self, task: &Task, outcome: &Outcome) {
        self.notifier
            .deliver(
                task.requester_ref.as_deref(),
                outcome,
                self.config.notify_timeout,
            )
            .await;
    }

    fn lost(&self, task: &Task) -> TaskOutcome {
        tracing::warn!(task_id = %task.id, "Claim lost before result was recorded");
        TaskOutcome::Lost
    }
}
