pub mod runner;
pub mod store;

pub use runner::{OnFire, Scheduler};
pub use store::CronStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// One-shot at a specific time (ISO 8601)
    At { at: String },
    /// Standard 5-field cron expression, optionally in an IANA timezone
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
    /// Fixed interval in milliseconds, anchored at job creation
    Every { interval_ms: u64 },
}

/// What a firing delivers to the target session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// A system-framed event line
    SystemEvent { text: String },
    /// A full agent turn with this message
    AgentTurn { message: String },
}

impl JobPayload {
    pub fn text(&self) -> &str {
        match self {
            JobPayload::SystemEvent { text } => text,
            JobPayload::AgentTurn { message } => message,
        }
    }
}

/// Runtime-derived job state, persisted alongside the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at_ms: Option<i64>,
}

/// A durable scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub delete_after_run: bool,
    pub schedule: Schedule,
    pub payload: JobPayload,
    /// Delivery target
    pub session_key: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub state: JobState,
}

impl ScheduledJob {
    /// Create an enabled job. `At` schedules default to delete-after-run.
    pub fn new(
        name: impl Into<String>,
        schedule: Schedule,
        payload: JobPayload,
        session_key: impl Into<String>,
    ) -> Self {
        let delete_after_run = matches!(schedule, Schedule::At { .. });
        ScheduledJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            enabled: true,
            delete_after_run,
            schedule,
            payload,
            session_key: session_key.into(),
            created_at: Utc::now().to_rfc3339(),
            last_run_at: None,
            run_count: 0,
            last_error: None,
            state: JobState::default(),
        }
    }

    /// Compute the next occurrence after `now`, or `None` for one-shots in
    /// the past and unparseable cron expressions.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Schedule::At { at } => DateTime::parse_from_rfc3339(at)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
                .filter(|dt| *dt > now),
            Schedule::Cron { expr, tz } => {
                let schedule = parse_cron(expr)?;
                match tz.as_deref().and_then(|t| chrono_tz::Tz::from_str(t).ok()) {
                    Some(tz) => schedule
                        .after(&now.with_timezone(&tz))
                        .next()
                        .map(|dt| dt.with_timezone(&Utc)),
                    None => schedule.after(&now).next(),
                }
            }
            Schedule::Every { interval_ms } => {
                let interval = chrono::Duration::milliseconds((*interval_ms).max(1) as i64);
                let anchor = DateTime::parse_from_rfc3339(&self.created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(now);
                if anchor > now {
                    return Some(anchor);
                }
                let elapsed = now - anchor;
                let periods = elapsed.num_milliseconds() / interval.num_milliseconds() + 1;
                Some(anchor + interval * (periods as i32))
            }
        }
    }

    /// The `At` target time, if this is a one-shot job.
    pub fn at_target(&self) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Schedule::At { at } => DateTime::parse_from_rfc3339(at)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// Parse a cron expression. The standard 5-field form
/// (minute hour day-of-month month day-of-week) is accepted by prepending a
/// zero seconds field; 6/7-field forms pass through unchanged.
pub fn parse_cron(expr: &str) -> Option<cron::Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).ok()
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum jobs executing at once
    pub max_concurrency: usize,
    /// Retries per firing beyond the first attempt
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Failed firings before the job is auto-disabled
    pub max_consecutive_failures: u32,
    /// Per-firing timeout
    pub job_timeout_secs: u64,
    /// Re-check interval for `At` jobs whose arming was lost
    pub safety_tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrency: 3,
            max_retries: 2,
            retry_base_delay_ms: 5_000,
            max_consecutive_failures: 5,
            job_timeout_secs: 5 * 60,
            safety_tick_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_schedule_defaults_to_delete_after_run() {
        let job = ScheduledJob::new(
            "once",
            Schedule::At {
                at: "2030-01-01T00:00:00Z".to_string(),
            },
            JobPayload::AgentTurn {
                message: "do it".to_string(),
            },
            "cron:once",
        );
        assert!(job.delete_after_run);

        let recurring = ScheduledJob::new(
            "often",
            Schedule::Every { interval_ms: 1000 },
            JobPayload::SystemEvent {
                text: "tick".to_string(),
            },
            "cron:often",
        );
        assert!(!recurring.delete_after_run);
    }

    #[test]
    fn at_in_the_past_has_no_next_occurrence() {
        let job = ScheduledJob::new(
            "stale",
            Schedule::At {
                at: "2020-01-01T00:00:00Z".to_string(),
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:stale",
        );
        assert!(job.next_occurrence(Utc::now()).is_none());
        assert!(job.at_target().is_some());
    }

    #[test]
    fn every_schedule_steps_from_creation() {
        let mut job = ScheduledJob::new(
            "tick",
            Schedule::Every { interval_ms: 60_000 },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:tick",
        );
        job.created_at = "2026-01-01T00:00:00Z".to_string();
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:02:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = job.next_occurrence(now).unwrap();
        assert_eq!(next.to_rfc3339(), "2026-01-01T00:03:00+00:00");
    }

    #[test]
    fn invalid_cron_expression_yields_none() {
        let job = ScheduledJob::new(
            "broken",
            Schedule::Cron {
                expr: "not a cron expr".to_string(),
                tz: None,
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:broken",
        );
        assert!(job.next_occurrence(Utc::now()).is_none());
    }

    #[test]
    fn cron_expression_produces_future_occurrence() {
        let job = ScheduledJob::new(
            "hourly",
            Schedule::Cron {
                expr: "0 * * * *".to_string(),
                tz: None,
            },
            JobPayload::SystemEvent {
                text: "x".to_string(),
            },
            "cron:hourly",
        );
        let next = job.next_occurrence(Utc::now()).unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert!(parse_cron("*/5 * * * *").is_some());
        assert!(parse_cron("0 */5 * * * *").is_some());
        assert!(parse_cron("every day at noon").is_none());
    }
}
