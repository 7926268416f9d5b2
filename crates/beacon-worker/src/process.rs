//! Run each job in its own child process.
//!
//! The child receives the job as JSON on stdin and must print one
//! [`WorkerMessage`] on stdout before exiting with status 0. A timeout,
//! a non-zero exit or unreadable output means the unit crashed; the run is
//! retried like any other failure.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use beacon_scheduler::{JobExecutor, JobPayload, RunReport, UnitError};

use crate::error::WorkerError;
use crate::http::DEFAULT_TIMEOUT;
use crate::message::WorkerMessage;

/// Extra time a child gets on top of the job's own timeout.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Environment variables passed through to the child.
const PRESERVED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

/// Executor that spawns `program args...` once per job.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    default_timeout: Duration,
    grace_period: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            default_timeout: DEFAULT_TIMEOUT,
            grace_period: GRACE_PERIOD,
        }
    }

    /// Set the job timeout used when a task does not carry one.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set how long past the job timeout the child may run before it is killed.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// How long the child may live for `job`.
    fn deadline(&self, job: &JobPayload) -> Duration {
        job.options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
            + self.grace_period
    }

    /// Spawn the child, feed it `job` and collect its message.
    pub async fn run(&self, job: &JobPayload) -> Result<WorkerMessage, WorkerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        // Clear inherited environment for isolation, then add only what's needed
        cmd.env_clear();
        for key in PRESERVED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(
            task_id = %job.task_id,
            run_index = job.run_index,
            program = %self.program.display(),
            "spawning worker process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorkerError::CommandNotFound(self.program.display().to_string())
            } else {
                WorkerError::Io(e)
            }
        })?;

        let input = serde_json::to_vec(job)?;
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };

        // Feeding stdin and collecting output share the deadline; dropping
        // the child on timeout kills it.
        let deadline = self.deadline(job);
        let (fed, output) =
            tokio::time::timeout(deadline, async { tokio::join!(feed, child.wait_with_output()) })
                .await
                .map_err(|_| WorkerError::Timeout(deadline.as_millis() as u64))?;
        let output = output?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "a signal".to_string(), |c| format!("status {c}"));
            warn!(
                task_id = %job.task_id,
                run_index = job.run_index,
                code = %code,
                stderr = %stderr.trim(),
                "worker process failed"
            );
            return Err(WorkerError::Exited {
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        // A child that answered without reading all of its input is fine
        if let Err(e) = fed {
            debug!(task_id = %job.task_id, error = %e, "worker process closed stdin early");
        }

        WorkerMessage::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, job: JobPayload) -> Result<RunReport, UnitError> {
        match self.run(&job).await {
            Ok(message) => message.into_unit_result(),
            // Anything short of a message means the unit itself went wrong
            Err(e) => Err(UnitError::Crashed(e.to_string())),
        }
    }
}
