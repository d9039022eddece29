//! Registry mapping logical types to handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::HandlerError;
use crate::handlers::{FnHandler, HandlerOutput, TaskHandler};
use crate::worker::task::TaskContext;

/// Registry of task handlers, keyed by logical type.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for the same type.
    pub async fn register(&self, logical_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let logical_type = logical_type.into();
        let replaced = self
            .handlers
            .write()
            .await
            .insert(logical_type.clone(), handler)
            .is_some();
        if replaced {
            tracing::warn!(logical_type = %logical_type, "Replaced existing handler");
        } else {
            tracing::debug!("Registered handler: {}", logical_type);
        }
    }

    /// Register an async closure as a handler.
    pub async fn register_fn<F, Fut>(&self, logical_type: impl Into<String>, func: F)
    where
        F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
    {
        self.register(logical_type, Arc::new(FnHandler::new(func)))
            .await;
    }

    /// Unregister a handler.
    pub async fn unregister(&self, logical_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.write().await.remove(logical_type)
    }

    /// Look up the handler for a logical type.
    pub async fn resolve(&self, logical_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(logical_type).cloned()
    }

    /// Check if a handler exists.
    pub async fn has(&self, logical_type: &str) -> bool {
        self.handlers.read().await.contains_key(logical_type)
    }

    /// List all registered logical types.
    pub async fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
