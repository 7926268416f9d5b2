//! Beacon: recurring page probes on a bounded worker pool
//!
//! Main binary with subcommands:
//! - `serve`: HTTP API, scheduler loop and state autosave
//! - `probe`: run one job read from stdin (used by the process worker mode)

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beacon_scheduler::SchedulerConfig;
use beacon_web::{ApiConfig, RateLimitConfig};
use beacon_worker::HttpExecutor;

mod daemon;

use daemon::DaemonConfig;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Recurring page probes with bounded, isolated workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// How each job is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerMode {
    /// Spawn `beacon probe` per job
    Process,
    /// Run the HTTP probe in a task inside the server process
    Inline,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and scheduler
    Serve {
        /// HTTP server port
        #[arg(long, env = "BEACON_PORT", default_value = "3000")]
        port: u16,

        /// Maximum jobs running at once
        #[arg(long, env = "BEACON_CONCURRENCY", default_value = "2")]
        concurrency: usize,

        /// Scheduler tick interval in milliseconds
        #[arg(long, env = "BEACON_TICK_INTERVAL_MS", default_value = "200",
              value_parser = clap::value_parser!(u64).range(1..))]
        tick_interval_ms: u64,

        /// State autosave interval in milliseconds
        #[arg(long, env = "BEACON_AUTOSAVE_MS", default_value = "5000",
              value_parser = clap::value_parser!(u64).range(1..))]
        autosave_ms: u64,

        /// Retries after a failed attempt
        #[arg(long, env = "BEACON_MAX_RETRIES", default_value = "2")]
        max_retries: u32,

        /// Backoff before the first retry in milliseconds; doubles per retry
        #[arg(long, env = "BEACON_BASE_DELAY_MS", default_value = "1000")]
        base_delay_ms: u64,

        /// Comma-separated host suffixes that may not be probed
        #[arg(long, env = "BEACON_BLOCKED_HOSTS", value_delimiter = ',')]
        blocked_hosts: Vec<String>,

        /// Path of the JSON state file
        #[arg(long, env = "BEACON_STATE_FILE", default_value = "data/state.json")]
        state_file: PathBuf,

        /// Static files directory served for unmatched paths
        #[arg(long, env = "BEACON_STATIC_DIR")]
        static_dir: Option<PathBuf>,

        /// Worker isolation mode
        #[arg(long, env = "BEACON_WORKER_MODE", value_enum, default_value = "process")]
        worker_mode: WorkerMode,

        /// Custom worker command (program and arguments); overrides the worker mode
        #[arg(long, env = "BEACON_WORKER_COMMAND")]
        worker_command: Option<String>,

        /// Probe timeout in milliseconds for tasks that do not set one
        #[arg(long, env = "BEACON_PROBE_TIMEOUT_MS", default_value = "30000")]
        probe_timeout_ms: u64,

        /// Requests allowed per client per window; 0 disables limiting
        #[arg(long, env = "BEACON_RATE_LIMIT", default_value = "120")]
        rate_limit: u32,

        /// Rate limit window in milliseconds
        #[arg(long, env = "BEACON_RATE_LIMIT_WINDOW_MS", default_value = "60000",
              value_parser = clap::value_parser!(u64).range(1..))]
        rate_limit_window_ms: u64,
    },

    /// Run a single job read as JSON from stdin and print the result
    Probe {
        /// Probe timeout in milliseconds when the job does not set one
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the probe result
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "beacon=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            concurrency,
            tick_interval_ms,
            autosave_ms,
            max_retries,
            base_delay_ms,
            blocked_hosts,
            state_file,
            static_dir,
            worker_mode,
            worker_command,
            probe_timeout_ms,
            rate_limit,
            rate_limit_window_ms,
        } => {
            let config = DaemonConfig {
                port,
                state_file,
                api: ApiConfig {
                    static_dir,
                    rate_limit: (rate_limit > 0).then(|| RateLimitConfig {
                        max_requests: rate_limit,
                        window: Duration::from_millis(rate_limit_window_ms),
                    }),
                },
                autosave_interval: Duration::from_millis(autosave_ms),
                worker_mode,
                worker_command,
                probe_timeout: Duration::from_millis(probe_timeout_ms),
                scheduler: SchedulerConfig {
                    tick_interval: Duration::from_millis(tick_interval_ms),
                    concurrency,
                    max_retries,
                    base_delay: Duration::from_millis(base_delay_ms),
                    blocked_hosts,
                },
            };
            daemon::run(config).await
        }
        Commands::Probe { timeout_ms } => run_probe(timeout_ms).await,
    }
}

async fn run_probe(timeout_ms: u64) -> Result<()> {
    let executor = HttpExecutor::new(Duration::from_millis(timeout_ms));
    let message = beacon_worker::serve_stdio(&executor)
        .await
        .map_err(|e| miette::miette!("probe failed: {}", e))?;
    tracing::debug!(ok = message.ok, "probe finished");
    Ok(())
}
