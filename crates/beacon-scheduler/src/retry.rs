//! Bounded retries with exponential backoff around one pool submission.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::pool::WorkerPool;
use crate::types::{JobPayload, RunFailure, RunReport};

/// Cap on the backoff exponent so delays cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// How many times to try a run and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each subsequent one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Total attempts allowed per run.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (0-based): `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(factor)
    }
}

/// Final result of a run after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// An attempt succeeded.
    Succeeded { report: RunReport, attempts: u32 },
    /// Every allowed attempt failed; carries the last failure.
    Exhausted { failure: RunFailure, attempts: u32 },
}

impl RetryOutcome {
    /// Attempts actually made, 1-based.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Submits jobs to a [`WorkerPool`], retrying failed attempts.
#[derive(Clone)]
pub struct RetryExecutor {
    pool: WorkerPool,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(pool: WorkerPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `job` until it succeeds or the attempt budget is spent.
    ///
    /// Backoff is a timer await, so it only suspends the caller.
    pub async fn submit(&self, job: JobPayload) -> RetryOutcome {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            match self.pool.run(job.clone()).await {
                Ok(report) => {
                    return RetryOutcome::Succeeded {
                        report,
                        attempts: attempt + 1,
                    };
                }
                Err(error) => {
                    if attempt + 1 >= max_attempts {
                        warn!(
                            task_id = %job.task_id,
                            run_index = job.run_index,
                            attempts = attempt + 1,
                            error = %error,
                            "run failed, retries exhausted"
                        );
                        return RetryOutcome::Exhausted {
                            failure: error.into_failure(),
                            attempts: attempt + 1,
                        };
                    }

                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        task_id = %job.task_id,
                        run_index = job.run_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, backing off"
                    );
                    sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }
}
