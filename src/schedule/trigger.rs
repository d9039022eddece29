//! Schedule triggers and the single next-fire evaluator.

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// Longest accepted `@every` interval (100 years).
const MAX_INTERVAL_SECS: u64 = 100 * 366 * 86_400;

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire every `every_secs` seconds, measured from the previous fire.
    Interval { every_secs: u64 },
    /// Fire on a calendar cron expression (6 or 7 fields, seconds first).
    Cron { expression: String },
    /// Fire exactly once.
    Once { at: DateTime<Utc> },
}

impl Trigger {
    /// Parse a textual schedule spec.
    ///
    /// Accepted forms:
    /// - `@every 90s`, `@every 5m`, `@every 2h`, `@every 1d`
    /// - `@once 2026-01-01T09:00:00Z`
    /// - cron: `0 9 * * MON-FRI` (5 fields, seconds assumed 0), 6/7-field
    ///   expressions and the `@daily`-style shorthands
    pub fn parse(spec: &str) -> Result<Self, ScheduleError> {
        let spec = spec.trim();
        let invalid = |reason: String| ScheduleError::InvalidTrigger {
            spec: spec.to_string(),
            reason,
        };

        if let Some(rest) = spec.strip_prefix("@every") {
            let every_secs = parse_interval(rest.trim()).map_err(invalid)?;
            return Ok(Trigger::Interval { every_secs });
        }

        if let Some(rest) = spec.strip_prefix("@once") {
            let at = DateTime::parse_from_rfc3339(rest.trim())
                .map_err(|e| invalid(format!("invalid timestamp: {e}")))?
                .with_timezone(&Utc);
            return Ok(Trigger::Once { at });
        }

        if spec.is_empty() {
            return Err(invalid("empty schedule spec".to_string()));
        }

        let expression = normalize_cron(spec);
        cron::Schedule::from_str(&expression).map_err(|e| invalid(format!("invalid cron: {e}")))?;
        Ok(Trigger::Cron { expression })
    }

    /// The string tag stored in the DB trigger_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Trigger::Interval { .. } => "interval",
            Trigger::Cron { .. } => "cron",
            Trigger::Once { .. } => "once",
        }
    }

    /// Canonical spec string; `Trigger::parse(t.spec())` yields `t` again.
    pub fn spec(&self) -> String {
        match self {
            Trigger::Interval { every_secs } => format!("@every {every_secs}s"),
            Trigger::Cron { expression } => expression.clone(),
            Trigger::Once { at } => format!("@once {}", at.to_rfc3339()),
        }
    }

    /// First fire time for a schedule registered (or resumed) at `now`.
    ///
    /// A one-shot trigger whose instant has already passed fires on the next
    /// tick rather than being silently dropped.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once { at } => Some(*at),
            _ => self.next_fire_after(now),
        }
    }

    /// Next fire strictly after `after`, or `None` when the trigger is spent.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { every_secs } => {
                let every = TimeDelta::try_seconds(i64::try_from(*every_secs).ok()?)?;
                after.checked_add_signed(every)
            }
            Trigger::Cron { expression } => cron::Schedule::from_str(expression)
                .ok()?
                .after(&after)
                .next(),
            Trigger::Once { at } => (*at > after).then_some(*at),
        }
    }

    /// Parse a trigger from its DB representation.
    pub fn from_db(trigger_type: &str, config: serde_json::Value) -> Result<Self, String> {
        match trigger_type {
            "interval" => {
                let every_secs = config
                    .get("every_secs")
                    .and_then(|v| v.as_u64())
                    .ok_or("interval trigger missing 'every_secs'")?;
                Ok(Trigger::Interval { every_secs })
            }
            "cron" => {
                let expression = config
                    .get("expression")
                    .and_then(|v| v.as_str())
                    .ok_or("cron trigger missing 'expression'")?
                    .to_string();
                Ok(Trigger::Cron { expression })
            }
            "once" => {
                let at = config
                    .get("at")
                    .and_then(|v| v.as_str())
                    .ok_or("once trigger missing 'at'")?;
                let at = DateTime::parse_from_rfc3339(at)
                    .map_err(|e| format!("once trigger has invalid 'at': {e}"))?
                    .with_timezone(&Utc);
                Ok(Trigger::Once { at })
            }
            other => Err(format!("unknown trigger type: {other}")),
        }
    }

    /// Serialize trigger-specific config to JSON for DB storage.
    pub fn to_config_json(&self) -> serde_json::Value {
        match self {
            Trigger::Interval { every_secs } => serde_json::json!({ "every_secs": every_secs }),
            Trigger::Cron { expression } => serde_json::json!({ "expression": expression }),
            Trigger::Once { at } => serde_json::json!({ "at": at.to_rfc3339() }),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.spec())
    }
}

/// Parse `90s`, `5m`, `2h`, `1d` or a bare number of seconds.
fn parse_interval(raw: &str) -> Result<u64, String> {
    if raw.is_empty() {
        return Err("missing interval".to_string());
    }
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid interval number in '{raw}'"))?;
    let multiplier = match unit.trim() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => return Err(format!("unknown interval unit '{other}'")),
    };
    let secs = value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("interval '{raw}' is too large"))?;
    if secs == 0 {
        return Err("interval must be positive".to_string());
    }
    if secs > MAX_INTERVAL_SECS {
        return Err(format!(
            "interval '{raw}' exceeds the maximum of {MAX_INTERVAL_SECS}s"
        ));
    }
    Ok(secs)
}

/// The cron crate wants a seconds field; classic 5-field expressions get one.
fn normalize_cron(spec: &str) -> String {
    if spec.starts_with('@') {
        return spec.to_string();
    }
    let fields: Vec<&str> = spec.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}
