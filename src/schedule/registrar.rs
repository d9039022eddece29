//! Schedule registrar — named schedules that enqueue tasks when they fire.
//!
//! Purely a producer: it only talks to the store (for its own definitions)
//! and to a [`TaskSink`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{DatabaseError, ScheduleError};
use crate::queue::TaskSink;
use crate::schedule::definition::ScheduleDefinition;
use crate::schedule::trigger::Trigger;
use crate::store::TaskStore;

pub struct ScheduleRegistrar {
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn TaskSink>,
    clock: Arc<dyn Clock>,
}

impl ScheduleRegistrar {
    pub fn new(store: Arc<dyn TaskStore>, sink: Arc<dyn TaskSink>, clock: Arc<dyn Clock>) -> Self {
        Self { store, sink, clock }
    }

    /// Register a schedule from a textual trigger spec.
    pub async fn add_schedule(
        &self,
        name: &str,
        spec: &str,
        logical_type: &str,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<ScheduleDefinition, ScheduleError> {
        let trigger = Trigger::parse(spec)?;
        let definition = ScheduleDefinition::new(
            name,
            trigger,
            logical_type,
            payload,
            priority,
            self.clock.now(),
        );
        self.add_definition(definition).await
    }

    /// Register a fully built definition. Its runtime fields are reset.
    ///
    /// The task it produces is checked against the queue up front, so every
    /// later fire can be enqueued.
    pub async fn add_definition(
        &self,
        mut definition: ScheduleDefinition,
    ) -> Result<ScheduleDefinition, ScheduleError> {
        if definition.name.trim().is_empty() {
            return Err(ScheduleError::EmptyName);
        }
        self.sink.validate(&definition.to_request())?;

        let now = self.clock.now();
        let first_fire = definition.trigger.first_fire(now);
        if first_fire.is_none() {
            return Err(ScheduleError::InvalidTrigger {
                spec: definition.trigger.spec(),
                reason: "trigger never fires".to_string(),
            });
        }
        definition.next_fire_at = if definition.paused { None } else { first_fire };
        definition.last_fired_at = None;
        definition.fire_count = 0;
        definition.created_at = now;
        definition.updated_at = now;

        self.store
            .insert_schedule(&definition)
            .await
            .map_err(|e| match e {
                DatabaseError::Constraint(_) => ScheduleError::AlreadyExists {
                    name: definition.name.clone(),
                },
                other => other.into(),
            })?;

        tracing::info!(
            schedule = %definition.name,
            trigger = %definition.trigger,
            logical_type = %definition.logical_type,
            next_fire_at = ?definition.next_fire_at,
            "Schedule added"
        );
        Ok(definition)
    }

    pub async fn remove_schedule(&self, name: &str) -> Result<(), ScheduleError> {
        if !self.store.delete_schedule(name).await? {
            return Err(not_found(name));
        }
        tracing::info!(schedule = %name, "Schedule removed");
        Ok(())
    }

    /// Stop firing. The definition is kept.
    pub async fn pause_schedule(&self, name: &str) -> Result<(), ScheduleError> {
        if !self
            .store
            .set_schedule_paused(name, true, None, self.clock.now())
            .await?
        {
            return Err(not_found(name));
        }
        tracing::info!(schedule = %name, "Schedule paused");
        Ok(())
    }

    /// Resume firing from now on. Instants missed while paused are skipped.
    pub async fn resume_schedule(&self, name: &str) -> Result<(), ScheduleError> {
        let definition = self.get_schedule(name).await?;
        let now = self.clock.now();
        let next = match definition.trigger {
            // a one-shot that already fired stays spent
            Trigger::Once { .. } if definition.fire_count > 0 => None,
            ref trigger => trigger.first_fire(now),
        };
        if !self.store.set_schedule_paused(name, false, next, now).await? {
            return Err(not_found(name));
        }
        tracing::info!(schedule = %name, next_fire_at = ?next, "Schedule resumed");
        Ok(())
    }

    /// Enqueue one task immediately. The timer is left untouched, and this
    /// works on paused schedules too.
    pub async fn run_schedule_now(&self, name: &str) -> Result<Uuid, ScheduleError> {
        let definition = self.get_schedule(name).await?;
        let task_id = self.sink.enqueue(definition.to_request()).await?;
        self.store
            .record_manual_fire(name, self.clock.now())
            .await?;
        tracing::info!(schedule = %name, task_id = %task_id, "Schedule run manually");
        Ok(task_id)
    }

    pub async fn get_schedule(&self, name: &str) -> Result<ScheduleDefinition, ScheduleError> {
        self.store
            .get_schedule(name)
            .await?
            .ok_or_else(|| not_found(name))
    }

    /// All schedules ordered by name, with their next fire time.
    pub async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, ScheduleError> {
        Ok(self.store.list_schedules().await?)
    }

    /// Fire every due schedule once. Returns the number of tasks enqueued.
    ///
    /// Each trigger instant is claimed with a conditional update before the
    /// enqueue, so concurrent registrars never fire the same instant twice.
    pub async fn tick(&self) -> Result<usize, ScheduleError> {
        let now = self.clock.now();
        let due = self.store.list_due_schedules(now).await?;

        let mut fired = 0;
        for definition in due {
            match self.fire(&definition, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(schedule = %definition.name, "Schedule fire failed: {}", e);
                }
            }
        }
        Ok(fired)
    }

    async fn fire(
        &self,
        definition: &ScheduleDefinition,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let Some(expected) = definition.next_fire_at else {
            return Ok(false);
        };
        let next = next_after_missed(&definition.trigger, expected, now);

        if !self
            .store
            .advance_schedule(&definition.name, expected, next, now)
            .await?
        {
            tracing::debug!(schedule = %definition.name, "Fire already claimed elsewhere");
            return Ok(false);
        }

        let task_id = self.sink.enqueue(definition.to_request()).await?;
        tracing::info!(
            schedule = %definition.name,
            task_id = %task_id,
            next_fire_at = ?next,
            "Schedule fired"
        );
        Ok(true)
    }
}

/// Next fire after `expected`, skipping any instants already in the past.
fn next_after_missed(
    trigger: &Trigger,
    expected: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match trigger.next_fire_after(expected) {
        Some(next) if next <= now => trigger.next_fire_after(now),
        other => other,
    }
}

fn not_found(name: &str) -> ScheduleError {
    ScheduleError::NotFound {
        name: name.to_string(),
    }
}

/// Spawn the schedule ticker.
pub fn spawn_schedule_ticker(
    registrar: Arc<ScheduleRegistrar>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = registrar.tick().await {
                tracing::error!("Schedule tick failed: {}", e);
            }
        }

        tracing::info!("Schedule ticker stopped");
    })
}
