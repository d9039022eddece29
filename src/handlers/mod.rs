//! Task handlers: the executable work behind each logical type.

mod registry;

pub use registry::HandlerRegistry;

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::worker::task::TaskContext;

/// Result of a successful handler invocation.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    /// Stored as the task's `output`.
    pub value: serde_json::Value,
    /// One-line human summary forwarded to the notifier.
    pub summary: Option<String>,
}

impl HandlerOutput {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            value,
            summary: None,
        }
    }

    /// Plain text result; the text doubles as the summary.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            value: serde_json::Value::String(text.clone()),
            summary: Some(text),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Executable work for one logical type.
///
/// Handlers must tolerate being run more than once for the same task: a retry
/// re-invokes the handler with the same payload.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError>;

    /// Overrides the engine-wide handler timeout for this handler.
    fn execution_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F, Fut> {
    func: F,
    timeout: Option<Duration>,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            timeout: None,
            _marker: PhantomData,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &TaskContext,
        payload: serde_json::Value,
    ) -> Result<HandlerOutput, HandlerError> {
        (self.func)(ctx.clone(), payload).await
    }

    fn execution_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::worker::task::Task;

    #[tokio::test]
    async fn fn_handler_receives_payload_and_context() {
        let handler = FnHandler::new(|ctx: TaskContext, payload: serde_json::Value| async move {
            let n = payload["n"].as_i64().unwrap_or(0);
            Ok::<_, HandlerError>(HandlerOutput::json(serde_json::json!({
                "doubled": n * 2,
                "attempt": ctx.attempt,
            })))
        });

        let task = Task::new("double", serde_json::json!({"n": 21}), 5, Utc::now());
        let ctx = TaskContext::for_task(&task);
        let out = handler.handle(&ctx, task.payload.clone()).await.unwrap();
        assert_eq!(out.value["doubled"], 42);
        assert_eq!(out.value["attempt"], 0);
        assert!(handler.execution_timeout().is_none());
    }

    #[test]
    fn text_output_is_its_own_summary() {
        let out = HandlerOutput::text("done");
        assert_eq!(out.value, serde_json::json!("done"));
        assert_eq!(out.summary.as_deref(), Some("done"));
    }

    #[test]
    fn timeout_override() {
        let handler = FnHandler::new(|_ctx: TaskContext, _payload: serde_json::Value| async {
            Ok::<_, HandlerError>(HandlerOutput::default())
        })
        .with_timeout(Duration::from_secs(3));
        assert_eq!(handler.execution_timeout(), Some(Duration::from_secs(3)));
    }
}
