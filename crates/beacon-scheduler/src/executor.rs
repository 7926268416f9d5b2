//! The contract between the worker pool and whatever performs a job.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{JobPayload, RunFailure, RunReport};

/// Why a single attempt produced no report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    /// The job ran and reported an application-level failure.
    #[error("job failed: {0}")]
    Reported(RunFailure),

    /// The execution unit terminated abnormally before reporting.
    #[error("worker unit crashed: {0}")]
    Crashed(String),
}

impl UnitError {
    /// Convert into the failure recorded on a run.
    pub fn into_failure(self) -> RunFailure {
        match self {
            Self::Reported(failure) => failure,
            Self::Crashed(message) => RunFailure::new(format!("worker unit crashed: {message}")),
        }
    }
}

/// Performs one job inside an isolated execution unit.
///
/// Implementations must not share mutable state with the scheduler; everything
/// they need arrives in the payload and everything they produce goes back in the
/// return value.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: JobPayload) -> Result<RunReport, UnitError>;
}

/// A [`JobExecutor`] backed by an async closure.
pub struct ExecutorFn<F> {
    f: F,
}

/// Wrap an async closure as a [`JobExecutor`].
pub fn executor_fn<F, Fut>(f: F) -> ExecutorFn<F>
where
    F: Fn(JobPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunReport, UnitError>> + Send + 'static,
{
    ExecutorFn { f }
}

#[async_trait]
impl<F, Fut> JobExecutor for ExecutorFn<F>
where
    F: Fn(JobPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunReport, UnitError>> + Send + 'static,
{
    async fn execute(&self, job: JobPayload) -> Result<RunReport, UnitError> {
        (self.f)(job).await
    }
}
