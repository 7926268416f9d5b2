//! Recurring task scheduler for Beacon.
//!
//! This crate provides the scheduling core:
//! - A task store owning every task record
//! - A bounded worker pool running one isolated unit per job
//! - A retry executor with exponential backoff between attempts
//! - A tick-driven scheduler that dispatches due tasks and applies results
//! - Whole-map JSON snapshots for persistence across restarts

mod config;
mod error;
mod executor;
mod pool;
mod retry;
mod scheduler;
pub mod snapshot;
mod store;
mod types;
pub mod validate;

pub use config::{MIN_PERIOD, SchedulerConfig};
pub use error::{SchedulerError, ValidationError};
pub use executor::{ExecutorFn, JobExecutor, UnitError, executor_fn};
pub use pool::WorkerPool;
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
pub use scheduler::{RunOutcome, Scheduler};
pub use snapshot::StateFile;
pub use store::TaskStore;
pub use types::{
    JobPayload, NavigationWait, NewTask, Run, RunFailure, RunReport, RunStatus, Task, TaskOptions,
    TaskStatus, Viewport,
};
