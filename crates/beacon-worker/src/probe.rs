//! The child side of [`ProcessExecutor`](crate::ProcessExecutor).
//!
//! Reads one job from the input, runs it, and writes one [`WorkerMessage`]
//! line to the output.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use beacon_scheduler::{JobExecutor, JobPayload};

use crate::error::WorkerError;
use crate::message::WorkerMessage;

/// Serve a single job over the given streams.
///
/// A job that fails still produces a message; only unreadable input or a
/// broken output stream return an error.
pub async fn serve<R, W>(
    executor: &dyn JobExecutor,
    mut input: R,
    mut output: W,
) -> Result<WorkerMessage, WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    input.read_to_end(&mut buf).await?;
    let job: JobPayload = serde_json::from_slice(&buf)?;

    debug!(task_id = %job.task_id, run_index = job.run_index, "probe received job");

    let message = WorkerMessage::from_result(executor.execute(job).await)?;

    let mut line = serde_json::to_vec(&message)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;

    Ok(message)
}

/// Serve a single job over stdin/stdout.
pub async fn serve_stdio(executor: &dyn JobExecutor) -> Result<WorkerMessage, WorkerError> {
    serve(executor, tokio::io::stdin(), tokio::io::stdout()).await
}
