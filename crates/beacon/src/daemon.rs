//! Serve command: wires the store, scheduler, autosave and API together.
//!
//! Three long-running tasks share one shutdown channel:
//! - The scheduler loop (ticks and run outcomes)
//! - The autosave loop (periodic snapshots, final save on shutdown)
//! - The axum server (graceful shutdown on the same signal)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use beacon_scheduler::snapshot::run_autosave;
use beacon_scheduler::{JobExecutor, Scheduler, SchedulerConfig, StateFile, TaskStore};
use beacon_web::{ApiConfig, create_router};
use beacon_worker::{HttpExecutor, ProcessExecutor};

use crate::WorkerMode;

/// Configuration for the serve command.
pub struct DaemonConfig {
    pub port: u16,
    pub state_file: PathBuf,
    pub api: ApiConfig,
    pub autosave_interval: Duration,
    pub worker_mode: WorkerMode,
    pub worker_command: Option<String>,
    pub probe_timeout: Duration,
    pub scheduler: SchedulerConfig,
}

/// Run until ctrl-c.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let store = TaskStore::new();
    let state_file = StateFile::new(&config.state_file);
    match state_file.load(&store).await {
        Ok(count) => info!(count, path = %config.state_file.display(), "state restored"),
        Err(e) => warn!(error = %e, path = %config.state_file.display(), "failed to load state, starting empty"),
    }

    let executor = build_executor(
        config.worker_mode,
        config.worker_command.as_deref(),
        config.probe_timeout,
    )?;
    let scheduler = Arc::new(Scheduler::new(store.clone(), executor, config.scheduler));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let autosave_handle = tokio::spawn(run_autosave(
        state_file,
        store,
        config.autosave_interval,
        shutdown_rx.clone(),
    ));

    let router = create_router(Arc::clone(&scheduler), &config.api)
        .map_err(|e| miette::miette!("failed to build API router: {}", e))?;

    let served = async {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
            .await
            .map_err(|e| miette::miette!("failed to bind port {}: {}", config.port, e))?;

        info!("API listening on http://0.0.0.0:{}", config.port);

        let mut server_shutdown = shutdown_rx.clone();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
            .with_graceful_shutdown(async move { wait_for_shutdown(&mut server_shutdown).await })
            .await
            .map_err(|e| miette::miette!("HTTP server error: {}", e))
    }
    .await;

    // Stop the other loops even if the server failed
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = autosave_handle.await;

    served?;
    info!("beacon shut down gracefully");
    Ok(())
}

/// Resolve when the shutdown flag is set or its sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Pick the executor for the configured worker mode.
fn build_executor(
    mode: WorkerMode,
    command: Option<&str>,
    probe_timeout: Duration,
) -> Result<Arc<dyn JobExecutor>> {
    if let Some(command) = command.filter(|c| !c.trim().is_empty()) {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| miette::miette!("worker command is empty"))?;
        let executor = ProcessExecutor::new(program, parts).with_default_timeout(probe_timeout);
        info!(program = %executor.program().display(), "using custom worker command");
        return Ok(Arc::new(executor));
    }

    match mode {
        WorkerMode::Process => {
            let exe = std::env::current_exe()
                .map_err(|e| miette::miette!("failed to locate beacon executable: {}", e))?;
            let args = [
                "probe".to_string(),
                "--timeout-ms".to_string(),
                probe_timeout.as_millis().to_string(),
            ];
            let executor = ProcessExecutor::new(exe, args).with_default_timeout(probe_timeout);
            info!(program = %executor.program().display(), "running each job in a probe process");
            Ok(Arc::new(executor))
        }
        WorkerMode::Inline => {
            info!("running jobs inline");
            Ok(Arc::new(HttpExecutor::new(probe_timeout)))
        }
    }
}
