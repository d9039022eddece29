//! Worker system — claiming and executing tasks.
//!
//! Core components:
//! - `task` — Task record and the context handed to handlers
//! - `state` — Task state machine (Pending → Processing → Completed/Failed)
//! - `supervisor` — Runs one claimed task with timeout, retry and notification
//! - `dispatcher` — Claim-and-dispatch rounds and the background loop

pub mod dispatcher;
pub mod state;
pub mod supervisor;
pub mod task;

pub use dispatcher::{Dispatcher, RoundReport, spawn_dispatch_loop};
pub use state::TaskStatus;
pub use supervisor::{Supervisor, TaskOutcome};
pub use task::{Task, TaskContext};
