//! Named schedule definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::EnqueueRequest;
use crate::schedule::trigger::Trigger;

/// Origin prefix stamped on tasks produced by a schedule.
pub const SCHEDULE_ORIGIN_PREFIX: &str = "schedule:";

/// A named, persistent producer of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub trigger: Trigger,
    pub logical_type: String,
    /// Default payload copied into every produced task.
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: Option<u32>,
    pub requester_ref: Option<String>,
    pub paused: bool,

    // Runtime state (store-managed)
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub fire_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        trigger: Trigger,
        logical_type: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        let next_fire_at = trigger.first_fire(now);
        Self {
            name: name.into(),
            trigger,
            logical_type: logical_type.into(),
            payload,
            priority,
            max_retries: None,
            requester_ref: None,
            paused: false,
            next_fire_at,
            last_fired_at: None,
            fire_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_requester(mut self, requester_ref: impl Into<String>) -> Self {
        self.requester_ref = Some(requester_ref.into());
        self
    }

    /// Whether the schedule should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_fire_at.is_some_and(|at| at <= now)
    }

    /// The enqueue call this schedule makes each time it fires.
    pub fn to_request(&self) -> EnqueueRequest {
        let mut request = EnqueueRequest::new(self.logical_type.clone(), self.payload.clone())
            .with_priority(self.priority)
            .with_origin(format!("{SCHEDULE_ORIGIN_PREFIX}{}", self.name));
        if let Some(max_retries) = self.max_retries {
            request = request.with_max_retries(max_retries);
        }
        if let Some(ref requester) = self.requester_ref {
            request = request.with_requester(requester.clone());
        }
        request
    }
}
