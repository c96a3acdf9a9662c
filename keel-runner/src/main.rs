//! Keel Runner
//!
//! Runs one CI job description inside containers and exits with its result.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Backend: podman/docker CLI client
//! - Services: Build lifecycle, stage scripts, job trace
//! - Scheduler: Job slots, executor selection, orphan reconciliation
//!
//! Ctrl-C cancels the running job; its containers are removed before exit.

use anyhow::{Context, Result};
use keel_core::domain::job::JobSpec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_runner::backend::{CliBackend, ContainerBackend};
use keel_runner::config::AgentConfig;
use keel_runner::scheduler::Agent;
use keel_runner::service::ConsoleTrace;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Keel Runner");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: runner={}, executor={}, max_parallel_jobs={}",
        config.runner.name, config.runner.executor, config.max_parallel_jobs
    );

    let docker = config.runner.docker.clone().unwrap_or_default();
    let cli = CliBackend::new(docker.backend, docker.host.clone());
    wait_for_backend(&cli).await?;

    let backend: Arc<dyn ContainerBackend> = Arc::new(cli);
    let agent = Agent::new(backend, config.max_parallel_jobs, config.job_timeout);

    match agent.reconcile_orphans(&config.runner).await {
        Ok(0) => {}
        Ok(removed) => info!("Reconciled {} orphaned resource(s)", removed),
        Err(e) => warn!("Failed to reconcile orphaned resources: {}", e),
    }

    let job_file = config
        .job_file
        .clone()
        .context("JOB_FILE environment variable not set")?;
    let job = load_job(&job_file)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, canceling job");
            on_interrupt.cancel();
        }
    });

    let result = agent
        .run(&job, &config.runner, cancel, Arc::new(ConsoleTrace))
        .await;

    if !result.is_success() {
        error!(
            "Job {} {}: {}",
            job.id,
            result.status,
            result.message.as_deref().unwrap_or("no details")
        );
        std::process::exit(1);
    }

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<AgentConfig> {
    match AgentConfig::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let mut config = AgentConfig::default();
            config.job_file = std::env::var("JOB_FILE").ok().map(Into::into);
            config.validate()?;
            Ok(config)
        }
    }
}

fn load_job(path: &Path) -> Result<JobSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse job file {}", path.display()))
}

/// Waits for the container runtime with exponential backoff
///
/// The runtime socket may come up after the agent in container environments.
async fn wait_for_backend(backend: &CliBackend) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match backend.check_available().await {
            Ok(_) => {
                if attempt > 1 {
                    info!("Container runtime available after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Container runtime unavailable after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Container runtime unavailable: {}", e));
                }

                warn!(
                    "Container runtime unavailable (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
