//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Which task store backs the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Durable libSQL database file.
    LibSql { path: PathBuf },
    /// In-process priority heap. Fast, but tasks do not survive a restart.
    Memory,
}

/// Queue frontend settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lowest accepted priority (inclusive).
    pub min_priority: i32,
    /// Highest accepted priority (inclusive).
    pub max_priority: i32,
    /// Priority used when the caller does not supply one.
    pub default_priority: i32,
    /// Retries granted when the caller does not supply a value.
    pub default_max_retries: u32,
    /// Immediate tasks at or above this priority wake the dispatch loop
    /// instead of waiting for the next poll tick.
    pub fast_path_priority: i32,
    /// Longest accepted enqueue delay, in seconds.
    pub max_delay_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_priority: 1,
            max_priority: 10,
            default_priority: 5,
            default_max_retries: 2,
            fast_path_priority: 8,
            max_delay_secs: 10 * 366 * 86_400,
        }
    }
}

/// Claim-and-dispatch loop settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum tasks claimed per round.
    pub batch_size: usize,
    /// How often the loop polls the store when nothing wakes it.
    pub poll_interval: Duration,
    /// A `processing` claim older than this is considered abandoned.
    pub stale_after: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(180),
        }
    }
}

/// Execution supervisor settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Wall-clock budget for one handler invocation.
    pub handler_timeout: Duration,
    /// Fixed delay before a failed task becomes eligible again.
    pub retry_delay: Duration,
    /// Budget for a single notifier call.
    pub notify_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(120),
            retry_delay: Duration::from_secs(300), // 5 minutes
            notify_timeout: Duration::from_secs(30),
        }
    }
}

/// Schedule registrar settings.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub tick_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(30),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: StoreBackend,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub execution: ExecutionConfig,
    pub schedules: ScheduleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::LibSql {
                path: PathBuf::from("./data/worker-engine.db"),
            },
            queue: QueueConfig::default(),
            dispatch: DispatchConfig::default(),
            execution: ExecutionConfig::default(),
            schedules: ScheduleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build the configuration from `WORKER_ENGINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let store = match lookup("WORKER_ENGINE_STORE").as_deref() {
            None | Some("libsql") => StoreBackend::LibSql {
                path: lookup("WORKER_ENGINE_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/worker-engine.db")),
            },
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "WORKER_ENGINE_STORE".into(),
                    message: format!("expected 'libsql' or 'memory', got '{other}'"),
                });
            }
        };

        let batch_size = parse_or(&lookup, "WORKER_ENGINE_BATCH_SIZE", defaults.dispatch.batch_size)?;
        let poll_secs = parse_or(&lookup, "WORKER_ENGINE_POLL_INTERVAL_SECS", 5u64)?;
        let timeout_secs = parse_or(&lookup, "WORKER_ENGINE_HANDLER_TIMEOUT_SECS", 120u64)?;
        let retry_secs = parse_or(&lookup, "WORKER_ENGINE_RETRY_DELAY_SECS", 300u64)?;
        let notify_secs = parse_or(&lookup, "WORKER_ENGINE_NOTIFY_TIMEOUT_SECS", 30u64)?;
        let stale_secs = parse_or(&lookup, "WORKER_ENGINE_STALE_CLAIM_SECS", timeout_secs + 60)?;
        let fast_path_priority = parse_or(
            &lookup,
            "WORKER_ENGINE_FAST_PATH_PRIORITY",
            defaults.queue.fast_path_priority,
        )?;
        let max_delay_secs = parse_or(
            &lookup,
            "WORKER_ENGINE_MAX_DELAY_SECS",
            defaults.queue.max_delay_secs,
        )?;
        let schedules_enabled = parse_or(&lookup, "WORKER_ENGINE_SCHEDULES_ENABLED", true)?;
        let tick_secs = parse_or(&lookup, "WORKER_ENGINE_SCHEDULE_TICK_SECS", 30u64)?;

        let config = Self {
            store,
            queue: QueueConfig {
                fast_path_priority,
                max_delay_secs,
                ..defaults.queue
            },
            dispatch: DispatchConfig {
                batch_size,
                poll_interval: Duration::from_secs(poll_secs),
                stale_after: Duration::from_secs(stale_secs),
            },
            execution: ExecutionConfig {
                handler_timeout: Duration::from_secs(timeout_secs),
                retry_delay: Duration::from_secs(retry_secs),
                notify_timeout: Duration::from_secs(notify_secs),
            },
            schedules: ScheduleConfig {
                enabled: schedules_enabled,
                tick_interval: Duration::from_secs(tick_secs),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queue;
        if q.min_priority > q.max_priority {
            return Err(invalid(
                "queue.min_priority",
                format!("{} is greater than max_priority {}", q.min_priority, q.max_priority),
            ));
        }
        if !(q.min_priority..=q.max_priority).contains(&q.default_priority) {
            return Err(invalid(
                "queue.default_priority",
                format!("{} is outside {}..={}", q.default_priority, q.min_priority, q.max_priority),
            ));
        }
        if q.max_delay_secs < 0 {
            return Err(invalid("WORKER_ENGINE_MAX_DELAY_SECS", "must not be negative".into()));
        }
        if self.dispatch.batch_size == 0 {
            return Err(invalid("WORKER_ENGINE_BATCH_SIZE", "must be at least 1".into()));
        }
        if self.dispatch.poll_interval.is_zero() {
            return Err(invalid("WORKER_ENGINE_POLL_INTERVAL_SECS", "must be at least 1".into()));
        }
        if self.execution.handler_timeout.is_zero() {
            return Err(invalid("WORKER_ENGINE_HANDLER_TIMEOUT_SECS", "must be positive".into()));
        }
        if !i64::try_from(self.execution.retry_delay.as_secs())
            .is_ok_and(|secs| secs <= q.max_delay_secs)
        {
            return Err(invalid(
                "WORKER_ENGINE_RETRY_DELAY_SECS",
                format!("must not exceed the maximum delay of {}s", q.max_delay_secs),
            ));
        }
        // A live invocation must never look abandoned.
        if self.dispatch.stale_after <= self.execution.handler_timeout {
            return Err(invalid(
                "WORKER_ENGINE_STALE_CLAIM_SECS",
                format!(
                    "{:?} must exceed the handler timeout {:?}",
                    self.dispatch.stale_after, self.execution.handler_timeout
                ),
            ));
        }
        if self.schedules.enabled && self.schedules.tick_interval.is_zero() {
            return Err(invalid("WORKER_ENGINE_SCHEDULE_TICK_SECS", "must be at least 1".into()));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.execution.retry_delay.as_secs(), 300);
        assert_eq!(config.execution.handler_timeout.as_secs(), 120);
    }

    #[test]
    fn empty_env_gives_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(
            config.store,
            StoreBackend::LibSql {
                path: PathBuf::from("./data/worker-engine.db")
            }
        );
        assert_eq!(config.dispatch.stale_after.as_secs(), 180);
        assert!(config.schedules.enabled);
    }

    #[test]
    fn env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("WORKER_ENGINE_STORE", "memory"),
            ("WORKER_ENGINE_BATCH_SIZE", "3"),
            ("WORKER_ENGINE_HANDLER_TIMEOUT_SECS", "10"),
            ("WORKER_ENGINE_SCHEDULES_ENABLED", "false"),
        ]))
        .unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.dispatch.batch_size, 3);
        assert_eq!(config.execution.handler_timeout.as_secs(), 10);
        // stale threshold follows the timeout when not set explicitly
        assert_eq!(config.dispatch.stale_after.as_secs(), 70);
        assert!(!config.schedules.enabled);
    }

    #[test]
    fn rejects_unparseable_value() {
        let err = EngineConfig::from_lookup(lookup(&[("WORKER_ENGINE_BATCH_SIZE", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "WORKER_ENGINE_BATCH_SIZE"));
    }

    #[test]
    fn rejects_unknown_store() {
        let err = EngineConfig::from_lookup(lookup(&[("WORKER_ENGINE_STORE", "redis")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_negative_max_delay() {
        let err = EngineConfig::from_lookup(lookup(&[("WORKER_ENGINE_MAX_DELAY_SECS", "-5")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "WORKER_ENGINE_MAX_DELAY_SECS"));
    }

    #[test]
    fn retry_delay_bounded_by_max_delay() {
        let err = EngineConfig::from_lookup(lookup(&[
            ("WORKER_ENGINE_MAX_DELAY_SECS", "600"),
            ("WORKER_ENGINE_RETRY_DELAY_SECS", "601"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "WORKER_ENGINE_RETRY_DELAY_SECS"));
    }

    #[test]
    fn rejects_zero_batch() {
        let err = EngineConfig::from_lookup(lookup(&[("WORKER_ENGINE_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn stale_threshold_must_exceed_timeout() {
        let err = EngineConfig::from_lookup(lookup(&[
            ("WORKER_ENGINE_HANDLER_TIMEOUT_SECS", "120"),
            ("WORKER_ENGINE_STALE_CLAIM_SECS", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "WORKER_ENGINE_STALE_CLAIM_SECS"));
    }
}
