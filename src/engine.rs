//! Engine facade: wires the store, queue, handlers, notifier, dispatcher and
//! schedule registrar together.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{ConfigError, DatabaseError, Error, HandlerError, QueueError, ScheduleError};
use crate::handlers::{HandlerOutput, HandlerRegistry, TaskHandler};
use crate::notify::{NotifierHandle, ResultNotifier};
use crate::queue::{EnqueueRequest, TaskQueue};
use crate::schedule::{ScheduleDefinition, ScheduleRegistrar, spawn_schedule_ticker};
use crate::store::{self, TaskStore};
use crate::worker::{
    Dispatcher, RoundReport, Supervisor, Task, TaskContext, TaskStatus, spawn_dispatch_loop,
};

/// The task engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    queue: Arc<TaskQueue>,
    handlers: Arc<HandlerRegistry>,
    notifier: Arc<NotifierHandle>,
    dispatcher: Arc<Dispatcher>,
    registrar: Arc<ScheduleRegistrar>,
}

impl Engine {
    /// Open the configured store and build an engine on the system clock.
    pub async fn open(config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;
        let store = store::open(&config.store).await?;
        Ok(Self::new(config, store, Arc::new(SystemClock))?)
    }

    /// Build an engine around an existing store and clock.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let handlers = Arc::new(HandlerRegistry::new());
        let notifier = Arc::new(NotifierHandle::default());
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            Arc::clone(&handlers),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.execution.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            supervisor,
            Arc::clone(&clock),
            config.dispatch.clone(),
        ));
        let queue = Arc::new(
            TaskQueue::new(Arc::clone(&store), Arc::clone(&clock), config.queue.clone())
                .with_fast_path(dispatcher.wake_handle()),
        );
        let registrar = Arc::new(ScheduleRegistrar::new(
            Arc::clone(&store),
            queue.clone(),
            clock,
        ));

        Ok(Self {
            config,
            store,
            queue,
            handlers,
            notifier,
            dispatcher,
            registrar,
        })
    }

    /// Spawn the dispatch loop and, if enabled, the schedule ticker.
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![spawn_dispatch_loop(
            Arc::clone(&self.dispatcher),
            shutdown_rx.clone(),
        )];
        if self.config.schedules.enabled {
            tasks.push(spawn_schedule_ticker(
                Arc::clone(&self.registrar),
                self.config.schedules.tick_interval,
                shutdown_rx,
            ));
        }
        tracing::info!(background_tasks = tasks.len(), "Engine started");
        EngineHandle { shutdown_tx, tasks }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Tasks ───────────────────────────────────────────────────────

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, QueueError> {
        self.queue.enqueue(request).await
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.store.get_task(id).await
    }

    pub async fn list_tasks(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.store.list_tasks(status, limit).await
    }

    pub async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, DatabaseError> {
        self.store.count_by_status().await
    }

    /// Run one dispatch round in the caller's task.
    pub async fn run_round(&self) -> Result<RoundReport, DatabaseError> {
        self.dispatcher.run_round().await
    }

    pub async fn recover_abandoned(&self) -> Result<RoundReport, DatabaseError> {
        self.dispatcher.recover_abandoned().await
    }

    // ── Handlers & notifier ─────────────────────────────────────────

    pub async fn register_handler(
        &self,
        logical_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.handlers.register(logical_type, handler).await;
    }

    pub async fn register_fn<F, Fut>(&self, logical_type: impl Into<String>, func: F)
    where
        F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
    {
        self.handlers.register_fn(logical_type, func).await;
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub async fn set_notifier(&self, notifier: Arc<dyn ResultNotifier>) {
        self.notifier.set(notifier).await;
    }

    // ── Schedules ───────────────────────────────────────────────────

    pub async fn add_schedule(
        &self,
        name: &str,
        spec: &str,
        logical_type: &str,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<ScheduleDefinition, ScheduleError> {
        self.registrar
            .add_schedule(name, spec, logical_type, payload, priority)
            .await
    }

    pub async fn add_schedule_definition(
        &self,
        definition: ScheduleDefinition,
    ) -> Result<ScheduleDefinition, ScheduleError> {
        self.registrar.add_definition(definition).await
    }

    pub async fn remove_schedule(&self, name: &str) -> Result<(), ScheduleError> {
        self.registrar.remove_schedule(name).await
    }

    pub async fn pause_schedule(&self, name: &str) -> Result<(), ScheduleError> {
        self.registrar.pause_schedule(name).await
    }

    pub async fn resume_schedule(&self, name: &str) -> Result<(), ScheduleError> {
        self.registrar.resume_schedule(name).await
    }

    pub async fn run_schedule_now(&self, name: &str) -> Result<Uuid, ScheduleError> {
        self.registrar.run_schedule_now(name).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, ScheduleError> {
        self.registrar.list_schedules().await
    }

    /// Fire due schedules in the caller's task.
    pub async fn tick_schedules(&self) -> Result<usize, ScheduleError> {
        self.registrar.tick().await
    }
}

/// Handle to the engine's background loops.
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop the loops after their current round and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Engine stopped");
    }
}
