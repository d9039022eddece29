//! In-process `TaskStore` backed by a priority heap.
//!
//! Lowest-latency backend: a claim is one mutex-guarded heap pop. Nothing
//! survives a restart.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::schedule::ScheduleDefinition;
use crate::store::traits::TaskStore;
use crate::worker::state::TaskStatus;
use crate::worker::task::Task;

/// Heap entry for a task that is eligible now.
#[derive(Debug, PartialEq, Eq)]
struct QueueItem {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // older items win for same priority
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct StoredTask {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<Uuid, StoredTask>,
    ready: BinaryHeap<QueueItem>,
    /// Pending tasks waiting for `scheduled_at`, keyed by (time, seq).
    delayed: BTreeMap<(DateTime<Utc>, u64), Uuid>,
    next_seq: u64,
    schedules: BTreeMap<String, ScheduleDefinition>,
}

impl MemoryState {
    /// Put a pending task on the ready heap or the delayed map.
    fn enqueue(&mut self, id: Uuid) {
        let Some(stored) = self.tasks.get(&id) else {
            return;
        };
        match stored.task.scheduled_at {
            Some(at) => {
                self.delayed.insert((at, stored.seq), id);
            }
            None => self.ready.push(QueueItem {
                priority: stored.task.priority,
                created_at: stored.task.created_at,
                seq: stored.seq,
                task_id: id,
            }),
        }
    }

    /// Move delayed tasks that became eligible onto the ready heap.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            if let Some(stored) = self.tasks.get(&id) {
                self.ready.push(QueueItem {
                    priority: stored.task.priority,
                    created_at: stored.task.created_at,
                    seq: stored.seq,
                    task_id: id,
                });
            }
        }
    }

    /// Move a task held by `claim_id` to `target`. `None` if the claim is
    /// gone or the state machine forbids the edge.
    fn transition(&mut self, id: Uuid, claim_id: Uuid, target: TaskStatus) -> Option<&mut Task> {
        let task = &mut self.tasks.get_mut(&id)?.task;
        if task.claim_id != Some(claim_id) || !task.status.can_transition_to(target) {
            return None;
        }
        task.status = target;
        task.claim_id = None;
        Some(task)
    }
}

/// Heap-backed, non-durable task store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, DatabaseError> {
        self.state
            .lock()
            .map_err(|_| DatabaseError::Pool("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.id) {
            return Err(DatabaseError::Constraint(format!(
                "task {} already exists",
                task.id
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            task.id,
            StoredTask {
                seq,
                task: task.clone(),
            },
        );
        if task.status == TaskStatus::Pending {
            state.enqueue(task.id);
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        Ok(self.lock()?.tasks.get(&id).map(|s| s.task.clone()))
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_id: Uuid,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut state = self.lock()?;
        state.promote_due(now);

        let mut claimed = Vec::with_capacity(limit.min(state.ready.len()));
        while claimed.len() < limit {
            let Some(item) = state.ready.pop() else {
                break;
            };
            let Some(stored) = state.tasks.get_mut(&item.task_id) else {
                continue;
            };
            if !stored.task.is_eligible(now)
                || !stored.task.status.can_transition_to(TaskStatus::Processing)
            {
                continue;
            }
            stored.task.status = TaskStatus::Processing;
            stored.task.started_at = Some(now);
            stored.task.completed_at = None;
            stored.task.claim_id = Some(claim_id);
            claimed.push(stored.task.clone());
        }
        Ok(claimed)
    }

    async fn complete_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        output: &serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock()?;
        let Some(task) = state.transition(id, claim_id, TaskStatus::Completed) else {
            return Ok(false);
        };
        task.output = Some(output.clone());
        task.error_message = None;
        task.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn fail_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock()?;
        let Some(task) = state.transition(id, claim_id, TaskStatus::Failed) else {
            return Ok(false);
        };
        task.error_message = Some(error.to_string());
        task.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn retry_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock()?;
        let Some(task) = state.transition(id, claim_id, TaskStatus::Pending) else {
            return Ok(false);
        };
        task.retry_count += 1;
        task.error_message = Some(error.to_string());
        task.scheduled_at = Some(retry_at);
        state.enqueue(id);
        Ok(true)
    }

    async fn list_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        let state = self.lock()?;
        let mut stale: Vec<Task> = state
            .tasks
            .values()
            .map(|s| &s.task)
            .filter(|t| t.status == TaskStatus::Processing && t.started_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.started_at);
        Ok(stale)
    }

    async fn list_tasks(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let state = self.lock()?;
        let mut matching: Vec<&StoredTask> = state
            .tasks
            .values()
            .filter(|s| s.task.status == status)
            .collect();
        matching.sort_by_key(|s| (s.task.created_at, s.seq));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|s| s.task.clone())
            .collect())
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, DatabaseError> {
        let state = self.lock()?;
        let mut counts = HashMap::new();
        for stored in state.tasks.values() {
            *counts.entry(stored.task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<(), DatabaseError> {
        let mut state = self.lock()?;
        if state.schedules.contains_key(&schedule.name) {
            return Err(DatabaseError::Constraint(format!(
                "schedule '{}' already exists",
                schedule.name
            )));
        }
        state
            .schedules
            .insert(schedule.name.clone(), schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>, DatabaseError> {
        Ok(self.lock()?.schedules.get(name).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, DatabaseError> {
        Ok(self.lock()?.schedules.values().cloned().collect())
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDefinition>, DatabaseError> {
        let state = self.lock()?;
        let mut due: Vec<ScheduleDefinition> = state
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_fire_at);
        Ok(due)
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool, DatabaseError> {
        Ok(self.lock()?.schedules.remove(name).is_some())
    }

    async fn set_schedule_paused(
        &self,
        name: &str,
        paused: bool,
        next_fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock()?;
        let Some(schedule) = state.schedules.get_mut(name) else {
            return Ok(false);
        };
        schedule.paused = paused;
        schedule.next_fire_at = next_fire_at;
        schedule.updated_at = now;
        Ok(true)
    }

    async fn advance_schedule(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock()?;
        let Some(schedule) = state.schedules.get_mut(name) else {
            return Ok(false);
        };
        if schedule.paused || schedule.next_fire_at != Some(expected_next) {
            return Ok(false);
        }
        schedule.next_fire_at = new_next;
        schedule.last_fired_at = Some(fired_at);
        schedule.fire_count += 1;
        schedule.updated_at = fired_at;
        Ok(true)
    }

    async fn record_manual_fire(
        &self,
        name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.lock()?;
        let Some(schedule) = state.schedules.get_mut(name) else {
            return Ok(false);
        };
        schedule.last_fired_at = Some(fired_at);
        schedule.fire_count += 1;
        schedule.updated_at = fired_at;
        Ok(true)
    }
}
