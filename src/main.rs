//! piloop ops CLI
//!
//! Filesystem-level inspection and management of the coordinator runtime.
//! Runs are started by the host extension through [`piloop::LoopManager`];
//! this binary only reads and maintains the shared runtime state.

use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::debug;

use piloop::cli::{Cli, Command, OutputFormat};
use piloop::config::Config;
use piloop::coordinator::{CoordinatorConfig, LockManager, RuntimePaths, fsio};
use piloop::domain::{InstanceRecord, QueueStateBroadcast};
use piloop::r#loop::StopSignal;

fn setup_logging(level: Option<&str>) -> Result<()> {
    let level = match level.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            other => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to WARN", other);
                tracing::Level::WARN
            }
        },
        None => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let paths = cli
        .runtime_root
        .clone()
        .map(RuntimePaths::new)
        .unwrap_or_default();

    debug!(root = %paths.root().display(), "using runtime root");

    match cli.command {
        Command::Status { format } => cmd_status(&paths, &config, format).await,
        Command::Instances { format } => cmd_instances(&paths, &config, format).await,
        Command::Stop { project } => cmd_stop(project).await,
        Command::Cleanup => cmd_cleanup(&paths, &config).await,
        Command::Config { format } => cmd_config(&paths, &config, format).await,
    }
}

/// Alive instance records on disk, oldest first
async fn read_instances(paths: &RuntimePaths, config: &CoordinatorConfig) -> Vec<InstanceRecord> {
    let now = Utc::now();
    let timeout = config.heartbeat_timeout_chrono();
    let mut records = Vec::new();
    for path in fsio::list_files(&paths.instances_dir()).await {
        if let Some(record) = fsio::read_json::<InstanceRecord>(&path).await
            && record.is_alive(now, timeout)
        {
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    records
}

async fn cmd_status(paths: &RuntimePaths, config: &Config, format: OutputFormat) -> Result<()> {
    let coordinator_config = CoordinatorConfig::load(paths, Some(config.coordinator.clone())).await;
    let instances = read_instances(paths, &coordinator_config).await;
    let count = instances.len().max(1);
    let share = (coordinator_config.total_max_llm / count).max(1);

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "runtime_root": paths.root().to_string_lossy(),
                "active_instances": instances.len(),
                "total_max_llm": coordinator_config.total_max_llm,
                "per_instance_share": share,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("Coordinator status");
            println!("------------------");
            println!("Runtime root: {}", paths.root().display());
            if instances.is_empty() {
                println!("Active instances: {}", "none".yellow());
            } else {
                let count = instances.len().to_string();
                println!("Active instances: {}", count.as_str().green());
            }
            println!("Shared LLM budget: {}", coordinator_config.total_max_llm);
            println!("Per-instance share: {}", share);
        }
    }

    Ok(())
}

async fn cmd_instances(paths: &RuntimePaths, config: &Config, format: OutputFormat) -> Result<()> {
    let coordinator_config = CoordinatorConfig::load(paths, Some(config.coordinator.clone())).await;
    let instances = read_instances(paths, &coordinator_config).await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&instances)?);
        }
        OutputFormat::Text => {
            if instances.is_empty() {
                println!("No live instances.");
                return Ok(());
            }
            println!("{:<44} {:<8} {:<9} {:<10}", "INSTANCE", "PID", "PENDING", "HEARTBEAT");
            println!("{}", "-".repeat(75));
            let now = Utc::now();
            for record in instances {
                let age = (now - record.last_heartbeat_at).num_seconds();
                println!(
                    "{:<44} {:<8} {:<9} {:>6}s ago",
                    record.instance_id,
                    record.process_id,
                    record.pending_task_count,
                    age
                );
            }
        }
    }

    Ok(())
}

async fn cmd_stop(project: Option<PathBuf>) -> Result<()> {
    let project = match project {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let signal = StopSignal::for_project(&project);
    signal.request_stop().await?;
    println!("Stop signal written: {}", signal.path().display());
    Ok(())
}

async fn cmd_cleanup(paths: &RuntimePaths, config: &Config) -> Result<()> {
    let coordinator_config = CoordinatorConfig::load(paths, Some(config.coordinator.clone())).await;
    let now = Utc::now();
    let timeout = coordinator_config.heartbeat_timeout_chrono();

    // Dead and corrupt instance records
    let mut instances_removed = 0;
    for path in fsio::list_files(&paths.instances_dir()).await {
        let dead = match fsio::read_json::<InstanceRecord>(&path).await {
            Some(record) => !record.is_alive(now, timeout),
            None => true,
        };
        if dead && fsio::remove_if_exists(&path).await? {
            instances_removed += 1;
        }
    }

    // Stale and corrupt queue-state files
    let mut queues_removed = 0;
    for path in fsio::list_files(&paths.queue_states_dir()).await {
        let stale = match fsio::read_json::<QueueStateBroadcast>(&path).await {
            Some(state) => (now - state.timestamp) > timeout,
            None => true,
        };
        if stale && fsio::remove_if_exists(&path).await? {
            queues_removed += 1;
        }
    }

    let locks_removed = LockManager::new(paths.clone()).cleanup_expired().await?;

    println!(
        "Removed {} instance record(s), {} queue state(s), {} lock(s)",
        instances_removed, queues_removed, locks_removed
    );
    Ok(())
}

async fn cmd_config(paths: &RuntimePaths, config: &Config, format: OutputFormat) -> Result<()> {
    let coordinator_config = CoordinatorConfig::load(paths, Some(config.coordinator.clone())).await;
    let resolved = serde_json::json!({
        "coordinator": coordinator_config,
        "loop": config.loop_settings,
        "retry": config.retry,
        "rate": config.rate,
    });

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resolved)?),
        OutputFormat::Text => println!("{}", serde_yaml::to_string(&resolved)?),
    }
    Ok(())
}
