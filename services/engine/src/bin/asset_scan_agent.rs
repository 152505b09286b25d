//! Asset Scan Agent - Standalone Binary
//!
//! Discovers scannable assets and drives the scan infrastructure of one job
//! up (`run`) or down (`remove`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use asset_scan_engine::agents::asset_scan::{
    build_provider, discover_all, ProviderKind, RetryPolicy, ScanDriver, ScanError,
    ScanJobDescriptor, ScanPhase,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Azure,
    Docker,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Azure => ProviderKind::Azure,
            ProviderArg::Docker => ProviderKind::Docker,
        }
    }
}

/// Asset Scan Agent - provisions and removes ephemeral scan infrastructure
#[derive(Parser, Debug)]
#[command(name = "asset-scan-agent", version, about)]
struct Args {
    /// Provider the assets live on
    #[arg(long, value_enum, default_value = "azure", env = "ASSET_SCAN_PROVIDER", global = true)]
    provider: ProviderArg,

    /// Make a single reconcile call and print its outcome
    #[arg(long, default_value = "false", global = true)]
    once: bool,

    /// Reconcile calls before giving up
    #[arg(long, default_value = "360", env = "ASSET_SCAN_MAX_ATTEMPTS", global = true)]
    max_attempts: u32,

    /// Wall-clock budget in seconds
    #[arg(long, default_value = "10800", env = "ASSET_SCAN_MAX_ELAPSED", global = true)]
    max_elapsed: u64,

    /// Deadline of a single reconcile call in seconds
    #[arg(long, default_value = "120", env = "ASSET_SCAN_CALL_TIMEOUT", global = true)]
    call_timeout: u64,

    /// Delay after a call hit its deadline, in seconds
    #[arg(long, default_value = "30", env = "ASSET_SCAN_TIMEOUT_DELAY", global = true)]
    timeout_delay: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List scannable assets
    Discover,

    /// Bring up the scan infrastructure of a job
    Run {
        /// Job descriptor (JSON)
        #[arg(long, env = "ASSET_SCAN_JOB")]
        job: PathBuf,
    },

    /// Tear down the scan infrastructure of a job
    Remove {
        /// Job descriptor (JSON)
        #[arg(long, env = "ASSET_SCAN_JOB")]
        job: PathBuf,
    },
}

impl Args {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_elapsed: Duration::from_secs(self.max_elapsed),
            call_timeout: Duration::from_secs(self.call_timeout),
            timeout_delay: Duration::from_secs(self.timeout_delay),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .json()
        .init();

    let args = Args::parse();
    let kind = ProviderKind::from(args.provider);

    info!(provider = %kind, "Starting Asset Scan Agent");

    let provider = build_provider(kind).context("Failed to configure provider")?;

    let (phase, job_path) = match &args.command {
        Command::Discover => {
            let assets = discover_all(&[provider]).await;
            println!("{}", serde_json::to_string_pretty(&assets)?);
            return Ok(());
        }
        Command::Run { job } => (ScanPhase::Run, job),
        Command::Remove { job } => (ScanPhase::Remove, job),
    };

    let job = ScanJobDescriptor::from_file(job_path)?;
    let driver = ScanDriver::new(provider, args.retry_policy());

    info!(
        asset_scan_id = %job.asset_scan_id,
        phase = %phase,
        source_region = %job.source_region,
        destination_region = %job.destination_region,
        "Processing asset scan job"
    );

    if args.once {
        return run_once(&driver, phase, &job).await;
    }

    let outcome = match phase {
        ScanPhase::Run => driver.run(&job).await,
        ScanPhase::Remove => driver.remove(&job).await,
    };

    match outcome {
        Ok(outcome) => {
            println!(
                "{}",
                json!({
                    "asset_scan_id": job.asset_scan_id,
                    "phase": phase.to_string(),
                    "outcome": "done",
                    "attempts": outcome.attempts,
                    "elapsed_secs": outcome.elapsed.as_secs(),
                })
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Asset scan job failed");
            Err(e.into())
        }
    }
}

/// Single reconcile call, for callers that schedule retries themselves
async fn run_once(driver: &ScanDriver, phase: ScanPhase, job: &ScanJobDescriptor) -> Result<()> {
    let result = driver.invoke(phase, job).await;

    let report = match &result {
        Ok(()) => json!({ "outcome": "done" }),
        Err(ScanError::Retryable { delay, reason }) => json!({
            "outcome": "retry",
            "delay_secs": delay.as_secs(),
            "reason": reason,
        }),
        Err(ScanError::Fatal { reason }) => json!({
            "outcome": "fatal",
            "reason": reason,
        }),
    };
    println!("{}", report);

    match result {
        Err(e) if e.is_fatal() => Err(e.into()),
        _ => Ok(()),
    }
}
