//! Worker Engine — durable priority task queue with scheduled producers,
//! bounded concurrent execution, timeouts, retries and result notification.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod worker;

pub use engine::{Engine, EngineHandle};
pub use error::{Error, Result};
