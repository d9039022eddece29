//! libSQL backend — durable `TaskStore` implementation.
//!
//! Uses libsql's native async API against a local file or an in-memory
//! database. Timestamps are written as RFC 3339 with fixed microsecond
//! precision so that string comparison in SQL matches time order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::schedule::{ScheduleDefinition, Trigger};
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::worker::state::TaskStatus;
use crate::worker::task::Task;

/// Milliseconds a connection waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u64 = 5000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)] // keeps the database alive for the connection
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend
            .pragma(&format!("busy_timeout = {BUSY_TIMEOUT_MS}"))
            .await?;
        backend.pragma("journal_mode = WAL").await?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// PRAGMAs may return a row, so they go through `query`.
    async fn pragma(&self, pragma: &str) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("PRAGMA {pragma}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("PRAGMA {pragma}: {e}")))?;
        loop {
            match rows.next().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(e) => return Err(DatabaseError::Pool(format!("PRAGMA {pragma}: {e}"))),
            }
        }
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<(i64, Task)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(tasks)
    }

    async fn query_schedules(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ScheduleDefinition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut schedules = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => schedules.push(row_to_schedule(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(schedules)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "seq, id, logical_type, payload, priority, status, scheduled_at, \
     retry_count, max_retries, requester_ref, output, error_message, origin, claim_id, \
     created_at, started_at, completed_at";

const SCHEDULE_COLUMNS: &str = "name, trigger_type, trigger_config, logical_type, payload, \
     priority, max_retries, requester_ref, paused, next_fire_at, last_fired_at, fire_count, \
     created_at, updated_at";

/// Canonical timestamp format for every datetime column.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime() output with fractional seconds
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn parse_optional_datetime(s: &Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn opt_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(value: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text(value.map(fmt_datetime))
}

fn parse_json(op: &str, s: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{op}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

/// Map a libsql Row to `(seq, Task)`.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<(i64, Task), DatabaseError> {
    let err = row_err("task");
    let seq: i64 = row.get(0).map_err(&err)?;
    let id_str: String = row.get(1).map_err(&err)?;
    let payload_str: String = row.get(3).map_err(&err)?;
    let status_str: String = row.get(5).map_err(&err)?;
    let scheduled_str: Option<String> = row.get(6).ok();
    let output_str: Option<String> = row.get(10).ok();
    let claim_str: Option<String> = row.get(13).ok();
    let created_str: String = row.get(14).map_err(&err)?;
    let started_str: Option<String> = row.get(15).ok();
    let completed_str: Option<String> = row.get(16).ok();

    let status = status_str
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;
    let output = match output_str {
        Some(ref s) => Some(parse_json("task output", s)?),
        None => None,
    };
    let claim_id = match claim_str {
        Some(ref s) => Some(parse_uuid(s)?),
        None => None,
    };

    let task = Task {
        id: parse_uuid(&id_str)?,
        logical_type: row.get(2).map_err(&err)?,
        payload: parse_json("task payload", &payload_str)?,
        priority: row.get::<i64>(4).map_err(&err)? as i32,
        status,
        scheduled_at: parse_optional_datetime(&scheduled_str)?,
        retry_count: row.get::<i64>(7).map_err(&err)? as u32,
        max_retries: row.get::<i64>(8).map_err(&err)? as u32,
        requester_ref: row.get(9).ok(),
        output,
        error_message: row.get(11).ok(),
        origin: row.get(12).map_err(&err)?,
        claim_id,
        created_at: parse_datetime(&created_str)?,
        started_at: parse_optional_datetime(&started_str)?,
        completed_at: parse_optional_datetime(&completed_str)?,
    };
    Ok((seq, task))
}

/// Map a libsql Row to a ScheduleDefinition.
///
/// Column order matches SCHEDULE_COLUMNS.
fn row_to_schedule(row: &libsql::Row) -> Result<ScheduleDefinition, DatabaseError> {
    let err = row_err("schedule");
    let name: String = row.get(0).map_err(&err)?;
    let trigger_type: String = row.get(1).map_err(&err)?;
    let trigger_config: String = row.get(2).map_err(&err)?;
    let payload_str: String = row.get(4).map_err(&err)?;
    let next_fire_str: Option<String> = row.get(9).ok();
    let last_fired_str: Option<String> = row.get(10).ok();
    let created_str: String = row.get(12).map_err(&err)?;
    let updated_str: String = row.get(13).map_err(&err)?;

    let trigger = Trigger::from_db(&trigger_type, parse_json("trigger config", &trigger_config)?)
        .map_err(|e| DatabaseError::Serialization(format!("schedule '{name}': {e}")))?;

    Ok(ScheduleDefinition {
        trigger,
        logical_type: row.get(3).map_err(&err)?,
        payload: parse_json("schedule payload", &payload_str)?,
        priority: row.get::<i64>(5).map_err(&err)? as i32,
        max_retries: row.get::<i64>(6).ok().map(|n| n as u32),
        requester_ref: row.get(7).ok(),
        paused: row.get::<i64>(8).map_err(&err)? != 0,
        next_fire_at: parse_optional_datetime(&next_fire_str)?,
        last_fired_at: parse_optional_datetime(&last_fired_str)?,
        fire_count: row.get::<i64>(11).map_err(&err)? as u64,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        name,
    })
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let output = task.output.as_ref().map(|v| v.to_string());
        self.conn()
            .execute(
                "INSERT INTO tasks (id, logical_type, payload, priority, status, scheduled_at, \
                 retry_count, max_retries, requester_ref, output, error_message, origin, \
                 claim_id, created_at, started_at, completed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    task.id.to_string(),
                    task.logical_type.clone(),
                    task.payload.to_string(),
                    task.priority as i64,
                    task.status.as_str(),
                    opt_datetime(task.scheduled_at),
                    task.retry_count as i64,
                    task.max_retries as i64,
                    opt_text(task.requester_ref.clone()),
                    opt_text(output),
                    opt_text(task.error_message.clone()),
                    task.origin.clone(),
                    opt_text(task.claim_id.map(|c| c.to_string())),
                    fmt_datetime(task.created_at),
                    opt_datetime(task.started_at),
                    opt_datetime(task.completed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, "Task inserted");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(tasks.pop().map(|(_, task)| task))
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_id: Uuid,
    ) -> Result<Vec<Task>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = fmt_datetime(now);
        // One statement: selection and transition happen under the same write lock.
        let mut claimed = self
            .query_tasks(
                "claim_batch",
                &format!(
                    "UPDATE tasks SET status = 'processing', started_at = ?1, claim_id = ?2, \
                     completed_at = NULL \
                     WHERE id IN ( \
                         SELECT id FROM tasks \
                         WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?1) \
                         ORDER BY priority DESC, created_at ASC, seq ASC \
                         LIMIT ?3 \
                     ) AND status = 'pending' \
                     RETURNING {TASK_COLUMNS}"
                ),
                params![now, claim_id.to_string(), limit as i64],
            )
            .await?;

        // RETURNING order is unspecified
        claimed.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(seq_a.cmp(seq_b))
        });
        Ok(claimed.into_iter().map(|(_, task)| task).collect())
    }

    async fn complete_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        output: &serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', output = ?1, error_message = NULL, \
                 completed_at = ?2, claim_id = NULL \
                 WHERE id = ?3 AND status = 'processing' AND claim_id = ?4",
                params![
                    output.to_string(),
                    fmt_datetime(completed_at),
                    id.to_string(),
                    claim_id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;
        Ok(changed == 1)
    }

    async fn fail_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', error_message = ?1, completed_at = ?2, \
                 claim_id = NULL \
                 WHERE id = ?3 AND status = 'processing' AND claim_id = ?4",
                params![
                    error,
                    fmt_datetime(completed_at),
                    id.to_string(),
                    claim_id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;
        Ok(changed == 1)
    }

    async fn retry_task(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1, \
                 error_message = ?1, scheduled_at = ?2, claim_id = NULL \
                 WHERE id = ?3 AND status = 'processing' AND claim_id = ?4",
                params![
                    error,
                    fmt_datetime(retry_at),
                    id.to_string(),
                    claim_id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_task: {e}")))?;
        Ok(changed == 1)
    }

    async fn list_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        let tasks = self
            .query_tasks(
                "list_stale_claims",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'processing' AND started_at < ?1 \
                     ORDER BY started_at ASC"
                ),
                params![fmt_datetime(cutoff)],
            )
            .await?;
        Ok(tasks.into_iter().map(|(_, task)| task).collect())
    }

    async fn list_tasks(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let tasks = self
            .query_tasks(
                "list_tasks",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
                     ORDER BY created_at ASC, seq ASC LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await?;
        Ok(tasks.into_iter().map(|(_, task)| task).collect())
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        let mut counts = HashMap::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("count_by_status: {e}"))),
            };
            let status_str: String = row.get(0).map_err(row_err("count_by_status"))?;
            let count: i64 = row.get(1).map_err(row_err("count_by_status"))?;
            let status = status_str
                .parse::<TaskStatus>()
                .map_err(DatabaseError::Serialization)?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO schedules (name, trigger_type, trigger_config, logical_type, payload, \
                 priority, max_retries, requester_ref, paused, next_fire_at, last_fired_at, \
                 fire_count, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT(name) DO NOTHING",
                params![
                    schedule.name.clone(),
                    schedule.trigger.type_tag(),
                    schedule.trigger.to_config_json().to_string(),
                    schedule.logical_type.clone(),
                    schedule.payload.to_string(),
                    schedule.priority as i64,
                    match schedule.max_retries {
                        Some(n) => libsql::Value::Integer(n as i64),
                        None => libsql::Value::Null,
                    },
                    opt_text(schedule.requester_ref.clone()),
                    schedule.paused as i64,
                    opt_datetime(schedule.next_fire_at),
                    opt_datetime(schedule.last_fired_at),
                    schedule.fire_count as i64,
                    fmt_datetime(schedule.created_at),
                    fmt_datetime(schedule.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_schedule: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::Constraint(format!(
                "schedule '{}' already exists",
                schedule.name
            )));
        }
        debug!(schedule = %schedule.name, "Schedule inserted");
        Ok(())
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>, DatabaseError> {
        let mut schedules = self
            .query_schedules(
                "get_schedule",
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE name = ?1"),
                params![name],
            )
            .await?;
        Ok(schedules.pop())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>, DatabaseError> {
        self.query_schedules(
            "list_schedules",
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY name"),
            (),
        )
        .await
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleDefinition>, DatabaseError> {
        self.query_schedules(
            "list_due_schedules",
            &format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                 WHERE paused = 0 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1 \
                 ORDER BY next_fire_at, name"
            ),
            params![fmt_datetime(now)],
        )
        .await
    }

    async fn delete_schedule(&self, name: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM schedules WHERE name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_schedule: {e}")))?;
        Ok(changed > 0)
    }

    async fn set_schedule_paused(
        &self,
        name: &str,
        paused: bool,
        next_fire_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE schedules SET paused = ?1, next_fire_at = ?2, updated_at = ?3 \
                 WHERE name = ?4",
                params![
                    paused as i64,
                    opt_datetime(next_fire_at),
                    fmt_datetime(now),
                    name
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_schedule_paused: {e}")))?;
        Ok(changed > 0)
    }

    async fn advance_schedule(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE schedules SET next_fire_at = ?1, last_fired_at = ?2, \
                 fire_count = fire_count + 1, updated_at = ?2 \
                 WHERE name = ?3 AND paused = 0 AND next_fire_at = ?4",
                params![
                    opt_datetime(new_next),
                    fmt_datetime(fired_at),
                    name,
                    fmt_datetime(expected_next)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_schedule: {e}")))?;
        Ok(changed == 1)
    }

    async fn record_manual_fire(
        &self,
        name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE schedules SET last_fired_at = ?1, fire_count = fire_count + 1, \
                 updated_at = ?1 WHERE name = ?2",
                params![fmt_datetime(fired_at), name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_manual_fire: {e}")))?;
        Ok(changed > 0)
    }
}
