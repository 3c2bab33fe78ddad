//! Scheduler management tool: the agent's own interface to cron.

use crate::scheduler::{JobPayload, Schedule, ScheduledJob};
use crate::tools::registry::Tool;
use crate::tools::types::{
    PropertySchema, ToolContext, ToolDefinition, ToolInputSchema, ToolOutput,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum JobAction {
    Create {
        name: String,
        /// "at" | "cron" | "every"
        schedule: String,
        /// ISO 8601 time for "at"
        #[serde(default)]
        at: Option<String>,
        /// 5-field cron expression for "cron"
        #[serde(default)]
        expr: Option<String>,
        #[serde(default)]
        tz: Option<String>,
        /// interval for "every"
        #[serde(default)]
        interval_ms: Option<u64>,
        message: String,
        #[serde(default)]
        delete_after_run: Option<bool>,
    },
    List {},
    Delete {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    RunNow {
        id: String,
    },
}

pub struct ScheduleTool;

#[async_trait]
impl Tool for ScheduleTool {
    fn definition(&self) -> ToolDefinition {
        let mut props = HashMap::new();
        props.insert(
            "action".to_string(),
            PropertySchema::string("What to do")
                .with_enum(&["create", "list", "delete", "enable", "disable", "run_now"]),
        );
        props.insert(
            "name".to_string(),
            PropertySchema::string("Job name (create)"),
        );
        props.insert(
            "schedule".to_string(),
            PropertySchema::string("Schedule kind (create)").with_enum(&["at", "cron", "every"]),
        );
        props.insert(
            "at".to_string(),
            PropertySchema::string("ISO 8601 target time for 'at' schedules"),
        );
        props.insert(
            "expr".to_string(),
            PropertySchema::string("5-field cron expression for 'cron' schedules"),
        );
        props.insert(
            "tz".to_string(),
            PropertySchema::string("IANA timezone for 'cron' schedules"),
        );
        props.insert(
            "interval_ms".to_string(),
            PropertySchema::integer("Interval in milliseconds for 'every' schedules"),
        );
        props.insert(
            "message".to_string(),
            PropertySchema::string("What the job should ask the agent to do (create)"),
        );
        props.insert(
            "delete_after_run".to_string(),
            PropertySchema::boolean("Remove the job after a successful run"),
        );
        props.insert("id".to_string(), PropertySchema::string("Job id"));
        ToolDefinition {
            name: "schedule".to_string(),
            label: "Scheduler".to_string(),
            description: "Create, list, enable/disable, delete, or trigger scheduled jobs"
                .to_string(),
            input_schema: ToolInputSchema::new(props, &["action"]),
        }
    }

    async fn execute(&self, _call_id: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(scheduler) = ctx.scheduler.as_ref() else {
            return ToolOutput::error("no scheduler is available in this context");
        };
        let action: JobAction = match serde_json::from_value(params) {
            Ok(action) => action,
            Err(e) => return ToolOutput::error(format!("unrecognized schedule action: {}", e)),
        };

        match action {
            JobAction::Create {
                name,
                schedule,
                at,
                expr,
                tz,
                interval_ms,
                message,
                delete_after_run,
            } => {
                let schedule = match schedule.as_str() {
                    "at" => match at {
                        Some(at) => Schedule::At { at },
                        None => return ToolOutput::error("'at' schedules need an 'at' time"),
                    },
                    "cron" => match expr {
                        Some(expr) => Schedule::Cron { expr, tz },
                        None => return ToolOutput::error("'cron' schedules need an 'expr'"),
                    },
                    "every" => match interval_ms {
                        Some(interval_ms) if interval_ms > 0 => Schedule::Every { interval_ms },
                        _ => {
                            return ToolOutput::error(
                                "'every' schedules need a positive 'interval_ms'",
                            )
                        }
                    },
                    other => return ToolOutput::error(format!("unknown schedule kind '{}'", other)),
                };

                let mut job = ScheduledJob::new(
                    name,
                    schedule,
                    JobPayload::AgentTurn { message },
                    format!("cron:{}:{}", ctx.session_key, uuid::Uuid::new_v4()),
                );
                if let Some(delete_after_run) = delete_after_run {
                    job.delete_after_run = delete_after_run;
                }
                match scheduler.add_job(job) {
                    Ok(job) => ToolOutput::text(format!(
                        "created job '{}' ({}), next run at {:?}",
                        job.name, job.id, job.state.next_run_at_ms
                    )),
                    Err(e) => ToolOutput::error(e),
                }
            }
            JobAction::List {} => {
                let jobs = scheduler.list_jobs();
                if jobs.is_empty() {
                    return ToolOutput::text("no scheduled jobs");
                }
                let lines: Vec<String> = jobs
                    .iter()
                    .map(|j| {
                        format!(
                            "{} '{}' [{}] runs: {}, failures: {}{}",
                            j.id,
                            j.name,
                            if j.enabled { "enabled" } else { "disabled" },
                            j.run_count,
                            j.state.consecutive_failures,
                            j.last_error
                                .as_deref()
                                .map(|e| format!(", last error: {}", e))
                                .unwrap_or_default(),
                        )
                    })
                    .collect();
                ToolOutput::text(lines.join("\n"))
            }
            JobAction::Delete { id } => match scheduler.remove_job(&id) {
                Ok(true) => ToolOutput::text(format!("deleted job {}", id)),
                Ok(false) => ToolOutput::error(format!("no job with id '{}'", id)),
                Err(e) => ToolOutput::error(e),
            },
            JobAction::Enable { id } => match scheduler.set_enabled(&id, true) {
                Ok(job) => ToolOutput::text(format!("enabled job '{}'", job.name)),
                Err(e) => ToolOutput::error(e),
            },
            JobAction::Disable { id } => match scheduler.set_enabled(&id, false) {
                Ok(job) => ToolOutput::text(format!("disabled job '{}'", job.name)),
                Err(e) => ToolOutput::error(e),
            },
            JobAction::RunNow { id } => match scheduler.run_now(&id).await {
                Ok(()) => ToolOutput::text(format!("ran job {}", id)),
                Err(e) => ToolOutput::error(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{CronStore, OnFire, Scheduler, SchedulerConfig};
    use serde_json::json;
    use std::sync::Arc;

    struct NoopFire;

    #[async_trait]
    impl OnFire for NoopFire {
        async fn fire(&self, _job: &ScheduledJob) -> Result<(), String> {
            Ok(())
        }
    }

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CronStore::load(dir.path().join("cron-store.json")));
        let scheduler = Scheduler::new(store, SchedulerConfig::default(), Arc::new(NoopFire));
        let ctx = ToolContext::new("t:dm:1", dir.path()).with_scheduler(scheduler);
        (dir, ctx)
    }

    #[tokio::test]
    async fn create_list_delete_lifecycle() {
        let (_dir, ctx) = ctx();
        let tool = ScheduleTool;

        let created = tool
            .execute(
                "c1",
                json!({
                    "action": "create",
                    "name": "water plants",
                    "schedule": "cron",
                    "expr": "0 9 * * *",
                    "message": "remind me to water the plants",
                }),
                &ctx,
            )
            .await;
        assert!(created.joined_text().contains("created job"));

        let listed = tool.execute("c2", json!({"action": "list"}), &ctx).await;
        let listing = listed.joined_text();
        assert!(listing.contains("water plants"));
        let id = listing.split_whitespace().next().unwrap().to_string();

        let deleted = tool
            .execute("c3", json!({"action": "delete", "id": id}), &ctx)
            .await;
        assert!(deleted.joined_text().contains("deleted"));
    }

    #[tokio::test]
    async fn create_without_required_fields_fails_cleanly() {
        let (_dir, ctx) = ctx();
        let out = ScheduleTool
            .execute(
                "c1",
                json!({"action": "create", "name": "x", "schedule": "at", "message": "m"}),
                &ctx,
            )
            .await;
        assert!(out.joined_text().starts_with("Error:"));
    }
}
