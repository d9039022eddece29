//! `TaskStore` trait — the single async interface for task and schedule
//! persistence.
//!
//! Every state transition after a claim is conditional on the task still
//! being `processing` under the same `claim_id`. A write that loses that race
//! returns `false` and changes nothing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::schedule::ScheduleDefinition;
use crate::worker::state::TaskStatus;
use crate::worker::task::Task;

/// Backend-agnostic store covering tasks and schedule definitions.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task. Durable once this returns `Ok`.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Atomically claim up to `limit` eligible tasks (`pending`, not scheduled
    /// after `now`), highest priority first, oldest first within a priority.
    ///
    /// Claimed tasks move to `processing` with `started_at = now` and
    /// `claim_id` set. Returned in claim order.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_id: Uuid,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// `processing → completed`. Returns `false` if the claim was lost.
    async fn complete_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        output: &serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `processing → failed`. Returns `false` if the claim was lost.
    async fn fail_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `processing → pending` with `retry_count + 1`, the claim cleared and
    /// `scheduled_at = retry_at`. Returns `false` if the claim was lost.
    async fn retry_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Tasks stuck in `processing` with `started_at` before `cutoff`.
    async fn list_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks in a given status, oldest first.
    async fn list_tasks(&self, status: TaskStatus, limit: usize)
    -> Result<Vec<Task>, DatabaseError>;

    /// Number of tasks per status.
    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    /// Insert a schedule. Fails with `Constraint` if the name is taken.
    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<(), DatabaseError>;

    async fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>, DatabaseError>;

    /// All schedules ordered by name.
    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, DatabaseError>;

    /// Unpaused schedules whose `next_fire_at` is at or before `now`.
    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDefinition>, DatabaseError>;

    /// Returns `true` if a schedule was deleted.
    async fn delete_schedule(&self, name: &str) -> Result<bool, DatabaseError>;

    /// Set the paused flag and next fire time. Returns `false` if the
    /// schedule does not exist.
    async fn set_schedule_paused(
        &self,
        name: &str,
        paused: bool,
        next_fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Claim one trigger instant: move `next_fire_at` from `expected_next` to
    /// `new_next` and record the fire. Returns `false` if another registrar
    /// already advanced it, or if the schedule is paused or gone.
    async fn advance_schedule(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record an out-of-band fire without touching `next_fire_at`.
    async fn record_manual_fire(
        &self,
        name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}
