//! Agent Relay command line
//!
//! One binary for every role:
//! - `relay`: run the WebSocket hub other processes connect to
//! - `worker`: consume tasks for one agent type
//! - `dispatch`, `workflow`: submit work and print the outcome as JSON
//! - `status`, `sweep`, `cancel`: inspect and repair task state

use agent_relay_core::config::Settings;
use agent_relay_core::ledger::Reconciler;
use agent_relay_core::task::InputData;
use agent_relay_core::{TaskLedger, WorkerRuntime};
use agent_relay_prompts::PromptLibrary;
use agent_relay_server::capabilities::{self, AGENT_TYPES};
use agent_relay_server::{telemetry, workflows, AppContext, RelayHub};
use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(about = "Distributed task dispatch and workflow orchestration for analysis agents")]
#[command(version)]
struct Cli {
    /// Configuration file read on top of config/default and config/local
    #[arg(long, global = true, env = "AGENT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override broker.url (`memory` or `ws://host:port`)
    #[arg(long, global = true)]
    broker_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay hub
    Relay {
        /// Override broker.relay_bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a worker for one agent type
    Worker {
        #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(AGENT_TYPES.iter().copied()))]
        agent_type: String,
        /// JSON file of prompt templates
        #[arg(long)]
        prompts: Option<PathBuf>,
    },
    /// Dispatch one task and print its result
    Dispatch {
        #[arg(long)]
        agent_type: String,
        #[arg(long)]
        operation: String,
        /// Input object as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Seconds to wait for the result
        #[arg(long)]
        timeout: Option<u64>,
        /// Reuse a recent identical result
        #[arg(long)]
        cached: bool,
    },
    /// Run a predefined workflow and print its sections
    Workflow {
        #[arg(value_parser = clap::builder::PossibleValuesParser::new(workflows::WORKFLOW_NAMES.iter().copied()))]
        name: String,
        /// Input object as JSON, e.g. '{"ticker": "AAPL"}'
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Show a task record, or a workflow run with --run
    Status {
        id: Uuid,
        #[arg(long)]
        run: bool,
    },
    /// Fail tasks that never produced a result
    Sweep {
        /// Age in seconds after which a pending or running task is abandoned
        #[arg(long)]
        older_than: Option<u64>,
    },
    /// Ask workers to stop a task
    Cancel {
        #[arg(long)]
        agent_type: String,
        #[arg(long)]
        task_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(cli.config.as_deref())
        .map_err(|e| anyhow!("failed to load configuration: {}", e))?;
    if let Some(url) = &cli.broker_url {
        settings.broker.url = url.clone();
    }
    telemetry::init(&settings.logging)?;

    let outcome = run(cli.command, settings).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Command failed");
    }
    outcome
}

async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    match command {
        Command::Relay { bind } => {
            let bind = bind.unwrap_or_else(|| settings.broker.relay_bind.clone());
            let hub = RelayHub::bind(&bind, settings.broker.channel_capacity).await?;
            let shutdown = CancellationToken::new();
            let server = tokio::spawn(hub.run(shutdown.clone()));
            wait_for_shutdown().await;
            shutdown.cancel();
            server.await.context("relay hub task failed")??;
            Ok(())
        }
        Command::Worker {
            agent_type,
            prompts,
        } => {
            let ctx = AppContext::new(settings).await?;
            let mut library = PromptLibrary::new();
            if let Some(path) = prompts {
                library.load_file(&path)?;
            }
            let capabilities = capabilities::capability_set(
                &agent_type,
                Arc::new(library),
                ctx.generation_service()?,
            )?;
            info!(
                agent_type = %agent_type,
                operations = capabilities.registry().operations().len(),
                "Starting worker"
            );

            let handle = Arc::new(WorkerRuntime::new(&ctx.relay, capabilities))
                .spawn()
                .await?;
            wait_for_shutdown().await;
            handle.shutdown().await;
            ctx.close().await?;
            Ok(())
        }
        Command::Dispatch {
            agent_type,
            operation,
            input,
            timeout,
            cached,
        } => {
            let ctx = AppContext::new(settings).await?;
            let input = parse_input(&input)?;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.settings().task_timeout());
            let dispatcher = ctx.dispatcher();
            let result = if cached {
                dispatcher
                    .dispatch_cached(&agent_type, &operation, input, timeout)
                    .await?
            } else {
                dispatcher.dispatch(&agent_type, &operation, input, timeout).await?
            };
            print_json(&serde_json::to_value(&result)?)?;
            ctx.close().await?;
            Ok(())
        }
        Command::Workflow { name, input } => {
            let ctx = AppContext::new(settings).await?;
            let input = parse_input(&input)?;
            let plan = workflows::plan_by_name(&name, &input)?;
            let outcome = ctx.orchestrator().execute(&plan, Value::Object(input)).await;
            print_json(&json!({
                "run_id": outcome.run.run_id,
                "workflow": outcome.run.workflow_name,
                "status": outcome.run.status,
                "error": outcome.run.error,
                "summary": outcome.sections.summary(),
                "sections": outcome.sections.to_value(),
            }))?;
            ctx.close().await?;
            Ok(())
        }
        Command::Status { id, run } => {
            let ctx = AppContext::new(settings).await?;
            let ledger = require_ledger(&ctx)?;
            let found = if run {
                ledger.get_run(id).await?.map(serde_json::to_value).transpose()?
            } else {
                ledger.get(id).await?.map(serde_json::to_value).transpose()?
            };
            let value = found.ok_or_else(|| anyhow!("no record with id {}", id))?;
            print_json(&value)?;
            ctx.close().await?;
            Ok(())
        }
        Command::Sweep { older_than } => {
            let ctx = AppContext::new(settings).await?;
            let stale_after = Duration::from_secs(
                older_than.unwrap_or(ctx.settings().agent.stale_task_seconds),
            );
            let swept = Reconciler::new(require_ledger(&ctx)?)
                .sweep(stale_after)
                .await?;
            print_json(&json!({ "swept": swept }))?;
            ctx.close().await?;
            Ok(())
        }
        Command::Cancel {
            agent_type,
            task_id,
            reason,
        } => {
            let ctx = AppContext::new(settings).await?;
            let listeners = ctx.dispatcher().cancel(&agent_type, task_id, reason).await?;
            print_json(&json!({ "task_id": task_id, "listeners": listeners }))?;
            ctx.close().await?;
            Ok(())
        }
    }
}

fn require_ledger(ctx: &AppContext) -> anyhow::Result<Arc<dyn TaskLedger>> {
    ctx.ledger()
        .ok_or_else(|| anyhow!("the task ledger is disabled (ledger.enabled = false)"))
}

fn parse_input(raw: &str) -> anyhow::Result<InputData> {
    match serde_json::from_str::<Value>(raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--input must be a JSON object, got {}", other),
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}
