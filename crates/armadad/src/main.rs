//! armadad — drives the Armada engine from the command line.
//!
//! # Usage
//!
//! ```text
//! armadad plan --request rollout.json
//! armadad run --request rollout.json --config armada.toml --data-dir /var/lib/armada
//! armadad stats --data-dir /var/lib/armada --window-hours 24
//! ```
//!
//! `run` executes against in-memory collaborators: commands are
//! acknowledged locally, hosts report healthy and traffic changes are only
//! recorded. It is a dry run of the real workflow, phase timing included.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use armada_collab::memory::{
    MemoryBroker, MemoryKeyValueStore, MemoryTrafficController, StaticMetricsFeed,
};
use armada_collab::metrics::names;
use armada_core::{CreateWorkflowRequest, OrchestratorConfig, Phase};
use armada_engine::{Collaborators, Orchestrator};
use armada_state::WorkflowStore;
use armada_strategy::{PlanRequest, StrategyRegistry, verify_partition};

#[derive(Parser)]
#[command(name = "armadad", about = "Armada deployment orchestrator")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a request and print its phase plan.
    Plan {
        /// Rollout request (JSON).
        #[arg(long)]
        request: PathBuf,
    },

    /// Run a request end to end against simulated collaborators.
    Run {
        /// Rollout request (JSON).
        #[arg(long)]
        request: PathBuf,

        /// Orchestrator configuration (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Persist workflows here instead of in memory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print workflow statistics from a persisted repository.
    Stats {
        #[arg(long)]
        data_dir: PathBuf,

        /// Only count workflows created in the last N hours.
        #[arg(long)]
        window_hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Plan { request } => plan(&request),
        Command::Run {
            request,
            config,
            data_dir,
        } => run(&request, config.as_deref(), data_dir.as_deref()).await,
        Command::Stats {
            data_dir,
            window_hours,
        } => stats(&data_dir, window_hours),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,armada=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[derive(Serialize)]
struct PlanOutput {
    strategy: String,
    estimated_secs: u64,
    phases: Vec<Phase>,
}

fn plan(path: &Path) -> anyhow::Result<()> {
    let request = CreateWorkflowRequest::from_file(path)?;
    request.validate()?;

    let registry = StrategyRegistry::with_defaults();
    let planner = registry.resolve(request.strategy.kind())?;
    planner.validate_configuration(&request.strategy)?;

    let phases = planner.create_phases(&PlanRequest::from_request("plan", &request))?;
    verify_partition(&phases, &request.hosts)?;
    let estimate = planner.estimate_execution_time(&request.hosts, &request.strategy)?;
    info!(
        service = %request.service,
        phases = phases.len(),
        estimated_secs = estimate.as_secs(),
        "plan ready"
    );

    let output = PlanOutput {
        strategy: request.strategy.kind().to_string(),
        estimated_secs: estimate.as_secs(),
        phases,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    request_path: &Path,
    config_path: Option<&Path>,
    data_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let request = CreateWorkflowRequest::from_file(request_path)?;
    let config = match config_path {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    config.validate()?;
    let store = match data_dir {
        Some(dir) => open_store(dir)?,
        None => WorkflowStore::open_in_memory()?,
    };

    // Healthy hosts and a quiet error rate so monitoring windows have data.
    let metrics = Arc::new(StaticMetricsFeed::new());
    metrics.set_gauge(names::HEALTH_STATUS, None, 1.0).await;
    metrics.record(names::ERROR_RATE, None, &[0.0; 12]).await;
    let broker = Arc::new(MemoryBroker::new());

    let orchestrator = Orchestrator::new(
        config,
        StrategyRegistry::with_defaults(),
        store,
        Collaborators {
            dispatcher: broker.clone(),
            traffic: Arc::new(MemoryTrafficController::new()),
            metrics,
            kv: Arc::new(MemoryKeyValueStore::new()),
        },
    );

    let workflow = orchestrator.create_workflow(request).await?;
    // Room for the forward pass to time out and a rollback to follow.
    let limit = workflow.workflow_timeout() * 2 + Duration::from_secs(60);
    if !orchestrator.start_workflow(&workflow.id).await {
        anyhow::bail!("workflow {} was not admitted", workflow.id);
    }
    info!(workflow = %workflow.id, "simulation started");

    let status = tokio::select! {
        status = orchestrator.wait_for_completion(&workflow.id, limit) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling");
            orchestrator.cancel_workflow(&workflow.id, "interrupted").await;
            orchestrator.wait_for_completion(&workflow.id, limit).await?
        }
    };
    orchestrator.shutdown().await;

    let finished = orchestrator
        .get_workflow(&workflow.id)
        .await?
        .context("workflow vanished from the repository")?;
    info!(
        workflow = %finished.id,
        status = ?status,
        commands = broker.published().await.len(),
        "simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(())
}

fn stats(data_dir: &Path, window_hours: Option<u64>) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let orchestrator = Orchestrator::new(
        OrchestratorConfig::default(),
        StrategyRegistry::with_defaults(),
        store,
        Collaborators {
            dispatcher: Arc::new(MemoryBroker::new()),
            traffic: Arc::new(MemoryTrafficController::new()),
            metrics: Arc::new(StaticMetricsFeed::new()),
            kv: Arc::new(MemoryKeyValueStore::new()),
        },
    );
    let window = window_hours.map(|h| Duration::from_secs(h * 3_600));
    let statistics = orchestrator.get_statistics(window)?;
    println!("{}", serde_json::to_string_pretty(&statistics)?);
    Ok(())
}

fn open_store(dir: &Path) -> anyhow::Result<WorkflowStore> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating data directory {}", dir.display()))?;
    let path = dir.join("armada.redb");
    let store = WorkflowStore::open(&path)?;
    info!(path = ?path, "workflow store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_optional_config_and_data_dir() {
        let cli = Cli::try_parse_from([
            "armadad",
            "run",
            "--request",
            "rollout.toml",
            "--data-dir",
            "/tmp/armada",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                request,
                config,
                data_dir,
            } => {
                assert_eq!(request, PathBuf::from("rollout.toml"));
                assert!(config.is_none());
                assert_eq!(data_dir, Some(PathBuf::from("/tmp/armada")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn log_format_is_global() {
        let cli = Cli::try_parse_from([
            "armadad",
            "stats",
            "--data-dir",
            "/tmp/armada",
            "--log-format",
            "json",
            "--window-hours",
            "24",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(
            cli.command,
            Command::Stats {
                window_hours: Some(24),
                ..
            }
        ));
    }

    #[test]
    fn plan_requires_a_request() {
        assert!(Cli::try_parse_from(["armadad", "plan"]).is_err());
    }
}
