//! Schedules: named, persistent producers of tasks.
//!
//! - `trigger` — interval / cron / one-shot triggers and the next-fire evaluator
//! - `definition` — the stored schedule record
//! - `registrar` — add/remove/pause/resume/run-now and the firing ticker

pub mod definition;
pub mod registrar;
pub mod trigger;

pub use definition::{SCHEDULE_ORIGIN_PREFIX, ScheduleDefinition};
pub use registrar::{ScheduleRegistrar, spawn_schedule_ticker};
pub use trigger::Trigger;
