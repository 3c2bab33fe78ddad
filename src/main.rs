use dotenv::dotenv;
use std::sync::Arc;
use tokio::time::Duration;

use valet::agent::Orchestrator;
use valet::config::{self, Config};
use valet::heartbeat::Heartbeat;
use valet::model::{HttpModelClient, ModelClient};
use valet::sandbox::HostSandbox;
use valet::scheduler::{CronStore, JobPayload, OnFire, ScheduledJob, Scheduler, SchedulerConfig};
use valet::subagent::{Announcer, SubagentLimits, SubagentManager};
use valet::tools;
use valet::transport::{InboundMessage, OutboundMessage, TransportCommand};

/// Delivery hook for background replies (subagent announces, heartbeat).
/// With only the console attached, "the first available transport" is stdout.
struct ConsoleDelivery;

#[async_trait::async_trait]
impl Announcer for ConsoleDelivery {
    async fn deliver(&self, _channel_id: &str, message: &OutboundMessage) {
        println!("{}", message.text);
    }
}

/// Scheduler callback: run the job's payload as a turn on its target session.
struct JobFire {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait::async_trait]
impl OnFire for JobFire {
    async fn fire(&self, job: &ScheduledJob) -> Result<(), String> {
        let text = match &job.payload {
            JobPayload::SystemEvent { text } => format!("[system event] {}", text),
            JobPayload::AgentTurn { message } => message.clone(),
        };
        let inbound = InboundMessage {
            text,
            session_key: job.session_key.clone(),
            channel_id: "scheduler".to_string(),
            user_id: "system".to_string(),
            user_name: format!("cron: {}", job.name),
            is_group: false,
            images: Vec::new(),
        };
        match self.orchestrator.handle_message_safe(inbound).await {
            Ok(Some(response)) if !response.is_no_reply() => {
                log::info!("[CRON] Job '{}' replied: {}", job.name, response.text);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    config::initialize_directories(&config)?;
    log::info!(
        "Starting valet (state: {}, workspace: {})",
        config.state_dir,
        config.workspace_dir
    );

    let model = match HttpModelClient::new(
        &config.model_endpoint,
        &config.model_api_key,
        &config.model_name,
    ) {
        Ok(client) => ModelClient::Http(client),
        Err(e) => {
            eprintln!("Model client error: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(tools::create_default_registry());
    let orchestrator = Orchestrator::new(
        config.clone(),
        model,
        registry,
        Some(Arc::new(HostSandbox::new())),
    );

    let subagents = SubagentManager::load(
        config.subagent_registry_path(),
        SubagentLimits::default(),
    );
    subagents.set_entry(orchestrator.clone());
    subagents.set_announcer(Arc::new(ConsoleDelivery));
    orchestrator.set_subagents(subagents.clone());

    let cron_store = Arc::new(CronStore::load(config.cron_store_path()));
    let scheduler = Scheduler::new(
        cron_store,
        SchedulerConfig::default(),
        Arc::new(JobFire {
            orchestrator: orchestrator.clone(),
        }),
    );
    orchestrator.set_scheduler(scheduler.clone());
    scheduler.start();

    let heartbeat = Heartbeat::new(
        orchestrator.clone(),
        config.heartbeat_state_path(),
        &config.workspace_dir,
        "console",
        Duration::from_secs(config.heartbeat_interval_minutes * 60),
    );
    heartbeat.set_delivery(Arc::new(ConsoleDelivery));
    heartbeat.start();

    // Hourly registry cleanup
    {
        let subagents = subagents.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60 * 60));
            loop {
                tick.tick().await;
                subagents.cleanup();
            }
        });
    }

    console_loop(orchestrator.clone()).await;

    heartbeat.stop();
    scheduler.stop();
    log::info!("Shutting down");
    Ok(())
}

/// Minimal interactive console: one session, line in, response out.
async fn console_loop(orchestrator: Arc<Orchestrator>) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let session_key = "console:dm:local".to_string();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("valet ready. Type a message, /help for commands, ctrl-d to exit.");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Ok(Some(line)) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        if let Some(command) = TransportCommand::parse(text) {
            let response = orchestrator.handle_command(command, &session_key).await;
            println!("{}", response.text);
            continue;
        }

        let inbound = InboundMessage {
            text: text.to_string(),
            session_key: session_key.clone(),
            channel_id: "console".to_string(),
            user_id: "local".to_string(),
            user_name: "local".to_string(),
            is_group: false,
            images: Vec::new(),
        };
        match orchestrator.handle_message_safe(inbound).await {
            Ok(Some(response)) if !response.is_no_reply() => println!("{}", response.text),
            Ok(_) => {}
            Err(e) => eprintln!("error: {}", e),
        }
    }
}
