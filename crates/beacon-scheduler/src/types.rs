//! Task types and the task lifecycle.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest error message kept on a failed run.
const ERROR_SNIPPET_MAX_CHARS: usize = 500;

/// Length of the random part of a task id.
const TASK_ID_LEN: usize = 10;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet seen by the scheduler.
    #[default]
    Queued,
    /// Eligible for dispatch.
    Running,
    /// Held by an operator; no dispatch until resumed.
    Paused,
    /// Stopped by an operator.
    Canceled,
    /// Every run finished and none failed.
    Done,
    /// Every run finished and at least one failed.
    Failed,
}

impl TaskStatus {
    /// Whether the task can never be dispatched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the executor considers a navigation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationWait {
    Load,
    DomContentLoaded,
    NetworkIdle0,
    NetworkIdle2,
}

/// Browser viewport size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Per-task executor options. Opaque to the scheduler, forwarded with every job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_wait: Option<NavigationWait>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<bool>,
}

/// A request to create a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub url: String,
    pub repeat: u32,
    pub interval_ms: u64,
    #[serde(flatten)]
    pub options: TaskOptions,
}

impl NewTask {
    pub fn new(url: impl Into<String>, repeat: u32, interval_ms: u64) -> Self {
        Self {
            url: url.into(),
            repeat,
            interval_ms,
            options: TaskOptions::default(),
        }
    }
}

/// The unit of work handed to an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub task_id: String,
    pub run_index: u32,
    pub url: String,
    #[serde(default)]
    pub options: TaskOptions,
}

/// What an executor returns for a successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
}

/// What an executor returns for a job it could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub error_snippet: String,
}

impl RunFailure {
    /// A failure without timing information.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            started_at: None,
            ended_at: None,
            error_snippet: message.into(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error_snippet)
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

/// One finished run of a task, including its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// 1-based run index within the task.
    pub n: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_snippet: Option<String>,
    /// Tries made for this run, including the final one.
    pub attempts: u32,
}

impl Run {
    /// Build the record for a run whose last attempt succeeded.
    pub fn succeeded(n: u32, report: RunReport, attempts: u32) -> Self {
        Self {
            n,
            started_at: report.started_at,
            ended_at: report.ended_at,
            status: RunStatus::Ok,
            title: report.title,
            final_url: report.final_url,
            http_status: report.http_status,
            screenshot_path: report.screenshot_path,
            error_snippet: None,
            attempts,
        }
    }

    /// Build the record for a run that exhausted its attempts.
    ///
    /// Timestamps missing from the failure (a crashed unit reports none) fall back to `now`.
    pub fn failed(n: u32, failure: RunFailure, attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            n,
            started_at: failure.started_at.unwrap_or(now),
            ended_at: failure.ended_at.unwrap_or(now),
            status: RunStatus::Error,
            title: None,
            final_url: None,
            http_status: None,
            screenshot_path: None,
            error_snippet: Some(snippet(&failure.error_snippet)),
            attempts,
        }
    }
}

fn snippet(message: &str) -> String {
    message.chars().take(ERROR_SNIPPET_MAX_CHARS).collect()
}

/// Generate a fresh task id of the form `t_xxxxxxxxxx`.
pub fn generate_task_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("t_{}", &random[..TASK_ID_LEN])
}

/// A recurring job definition and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub url: String,
    /// Target number of runs.
    pub repeat: u32,
    /// Minimum spacing between run starts.
    pub interval_ms: u64,
    #[serde(default)]
    pub options: TaskOptions,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub done_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    /// 1 while a run is dispatched and not yet applied.
    #[serde(default)]
    pub in_flight: u32,
    /// When the next run may start. Absent once terminal.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl Task {
    /// Create a queued task that is due immediately.
    pub fn new(id: String, spec: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            url: spec.url,
            repeat: spec.repeat,
            interval_ms: spec.interval_ms,
            options: spec.options,
            created_at: now,
            status: TaskStatus::Queued,
            done_count: 0,
            failed_count: 0,
            in_flight: 0,
            next_run_at: Some(now),
            runs: Vec::new(),
        }
    }

    /// Runs that have finished, successfully or not.
    pub fn settled(&self) -> u32 {
        self.done_count + self.failed_count
    }

    /// Check if this task should be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running
            && self.in_flight == 0
            && self.settled() < self.repeat
            && self.next_run_at.is_none_or(|at| at <= now)
    }

    /// Advance this task by one scheduler tick.
    ///
    /// Promotes a queued task, finalizes a completed one, and when the task is due
    /// marks a run in flight and returns the job to submit.
    pub fn poll_dispatch(&mut self, now: DateTime<Utc>) -> Option<JobPayload> {
        if self.status == TaskStatus::Queued {
            self.status = TaskStatus::Running;
        }

        let total = self.settled() + self.in_flight;
        if total >= self.repeat {
            // A run still in flight finalizes the task when it is applied.
            if self.in_flight == 0 {
                self.finalize_if_complete();
            }
            return None;
        }

        if !self.is_due(now) {
            return None;
        }

        self.in_flight = 1;
        self.next_run_at = Some(offset(now, self.interval_ms));

        Some(JobPayload {
            task_id: self.id.clone(),
            run_index: total + 1,
            url: self.url.clone(),
            options: self.options.clone(),
        })
    }

    /// Apply a finished run.
    ///
    /// Returns `false` and leaves the task untouched when no run was in flight.
    /// Terminal statuses are never changed; a late run on a canceled task is
    /// still recorded.
    pub fn record_run(&mut self, run: Run) -> bool {
        if self.in_flight == 0 {
            return false;
        }

        self.in_flight -= 1;
        match run.status {
            RunStatus::Ok => self.done_count += 1,
            RunStatus::Error => self.failed_count += 1,
        }
        self.runs.push(run);
        self.finalize_if_complete();
        true
    }

    /// `running`/`queued` -> `paused`. Returns whether the status changed.
    pub fn pause(&mut self) -> bool {
        if matches!(self.status, TaskStatus::Running | TaskStatus::Queued) {
            self.status = TaskStatus::Paused;
            true
        } else {
            false
        }
    }

    /// `paused` -> `running`, due immediately. Returns whether the status changed.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == TaskStatus::Paused {
            self.status = TaskStatus::Running;
            self.next_run_at = Some(now);
            true
        } else {
            false
        }
    }

    /// Any non-terminal status -> `canceled`. Returns whether the status changed.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Canceled;
        self.next_run_at = None;
        true
    }

    fn finalize_if_complete(&mut self) {
        if self.status == TaskStatus::Running
            && self.in_flight == 0
            && self.settled() >= self.repeat
        {
            self.status = if self.failed_count > 0 {
                TaskStatus::Failed
            } else {
                TaskStatus::Done
            };
            self.next_run_at = None;
        }
    }
}

/// `at + ms`, saturating at the latest representable instant.
fn offset(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
