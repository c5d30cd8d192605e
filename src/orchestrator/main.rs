use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use uuid::Uuid;

use skiff::orchestrator::config::{create_sample_config, load_config, CliOverrides};
use skiff::orchestrator::job::{Job, LogNotifier, MemoryJobStore, MemoryLogSink};
use skiff::orchestrator::provider::CliCloudProvider;
use skiff::orchestrator::readiness::HttpReadinessProbe;
use skiff::orchestrator::Engine;

#[derive(Parser)]
#[command(name = "skiff-orchestrator", about = "Provisioning orchestrator")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "skiff.toml")]
    config: String,

    /// Override the configured region
    #[arg(long)]
    region: Option<String>,

    /// Override the configured stack app directory
    #[arg(long)]
    app_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a deployment from a job definition file (JSON)
    Provision {
        /// Path to the job definition
        job_file: String,
    },
    /// Destroy the resources deployed for a job
    Destroy {
        /// Id of the job to tear down
        job_id: Uuid,
        /// Path to the job definition the deployment was created from
        job_file: String,
    },
    /// Write a sample configuration file and exit
    SampleConfig {
        #[arg(default_value = "skiff.toml")]
        path: String,
    },
}

fn load_job(path: &str) -> Result<Job> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job definition: {path}"))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job definition: {path}"))
}

async fn wait_until_settled(engine: &Engine, job_id: Uuid) -> Result<()> {
    loop {
        match engine.store().get(job_id).await? {
            Some(job) if job.status.is_terminal() => {
                info!(
                    "Job {job_id} finished with status {}",
                    job.status.as_str()
                );
                return Ok(());
            }
            Some(_) => tokio::time::sleep(Duration::from_secs(2)).await,
            None => anyhow::bail!("job {job_id} disappeared from the store"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Commands::SampleConfig { path } = &cli.command {
        return create_sample_config(path);
    }

    let overrides = CliOverrides {
        region: cli.region.clone(),
        app_dir: cli.app_dir.clone(),
    };
    let settings = load_config(Some(&cli.config), &overrides)?;
    let engine = Engine::new(
        settings.clone(),
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryLogSink::new()),
        Arc::new(LogNotifier),
        Arc::new(CliCloudProvider::new(settings.cloud.clone())),
        Arc::new(HttpReadinessProbe::new(&settings.readiness)?),
    );

    let outcome = match cli.command {
        Commands::Provision { job_file } => {
            let job = load_job(&job_file)?;
            let job_id = engine.submit(job).await?;
            info!("Submitted job {job_id}");

            tokio::select! {
                result = wait_until_settled(&engine, job_id) => result,
                _ = shutdown_signal() => {
                    info!("Interrupted, shutting down");
                    Ok(())
                }
            }
        }
        Commands::Destroy { job_id, job_file } => {
            // Re-register the definition so destroy can resolve credentials
            let mut job = load_job(&job_file)?;
            job.id = job_id;
            engine.store().insert(job).await?;
            engine.destroy_job(job_id).await
        }
        Commands::SampleConfig { .. } => unreachable!(),
    };

    engine.shutdown();
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
