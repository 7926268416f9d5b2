//! Tick-driven scheduler.
//!
//! The scheduler owns the only loop that mutates task progress. Each tick walks
//! the store, promotes and finalizes tasks, and dispatches the due ones. A
//! dispatch runs in its own spawned task and sends its outcome back over a
//! channel; the same loop applies outcomes, so ticks and result application are
//! serialized.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{MIN_PERIOD, SchedulerConfig};
use crate::error::SchedulerError;
use crate::executor::JobExecutor;
use crate::pool::WorkerPool;
use crate::retry::{RetryExecutor, RetryOutcome, RetryPolicy};
use crate::store::TaskStore;
use crate::types::{JobPayload, NewTask, Run, Task, TaskStatus, generate_task_id};
use crate::validate::validate_new_task;

/// Buffer size of the outcome channel.
const OUTCOME_CHANNEL_SIZE: usize = 100;

/// The result of one dispatched run, on its way back to the scheduler.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task_id: String,
    pub run_index: u32,
    pub result: RetryOutcome,
}

/// The task scheduler.
pub struct Scheduler {
    store: TaskStore,
    retry: RetryExecutor,
    config: SchedulerConfig,
    outcome_tx: mpsc::Sender<RunOutcome>,
    outcome_rx: Mutex<mpsc::Receiver<RunOutcome>>,
}

impl Scheduler {
    /// Create a scheduler over `store`, running jobs with `executor`.
    pub fn new(store: TaskStore, executor: Arc<dyn JobExecutor>, mut config: SchedulerConfig) -> Self {
        if config.tick_interval < MIN_PERIOD {
            warn!(tick_ms = config.tick_interval.as_millis() as u64, "tick interval too short, clamping");
            config.tick_interval = MIN_PERIOD;
        }
        let pool = WorkerPool::new(executor, config.concurrency);
        let retry = RetryExecutor::new(
            pool,
            RetryPolicy::new(config.max_retries, config.base_delay),
        );
        let (outcome_tx, outcome_rx) = mpsc::channel(OUTCOME_CHANNEL_SIZE);

        Self {
            store,
            retry,
            config,
            outcome_tx,
            outcome_rx: Mutex::new(outcome_rx),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool {
        self.retry.pool()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate and store a new task in `queued` state.
    #[tracing::instrument(skip(self, spec), fields(url = %spec.url))]
    pub async fn create_task(&self, spec: NewTask) -> Result<Task, SchedulerError> {
        validate_new_task(&spec, &self.config.blocked_hosts)?;

        let task = Task::new(generate_task_id(), spec, Utc::now());
        self.store.insert(task.clone()).await?;

        info!(
            task_id = %task.id,
            repeat = task.repeat,
            interval_ms = task.interval_ms,
            "created task"
        );
        Ok(task)
    }

    /// Create several tasks. The whole batch is validated first; nothing is
    /// stored if any request is invalid.
    pub async fn create_tasks(&self, specs: Vec<NewTask>) -> Result<Vec<Task>, SchedulerError> {
        for spec in &specs {
            validate_new_task(spec, &self.config.blocked_hosts)?;
        }

        let now = Utc::now();
        let tasks: Vec<Task> = specs
            .into_iter()
            .map(|spec| Task::new(generate_task_id(), spec, now))
            .collect();
        self.store.insert_all(tasks.clone()).await?;

        info!(count = tasks.len(), "created task batch");
        Ok(tasks)
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: &str) -> Result<Task, SchedulerError> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))
    }

    /// List tasks, optionally only those with `status`.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.store.list(status).await
    }

    /// Pause a queued or running task. Returns the resulting status.
    #[tracing::instrument(skip(self))]
    pub async fn pause_task(&self, id: &str) -> Result<TaskStatus, SchedulerError> {
        self.command(id, "paused task", |t| t.pause()).await
    }

    /// Resume a paused task; it becomes due immediately.
    #[tracing::instrument(skip(self))]
    pub async fn resume_task(&self, id: &str) -> Result<TaskStatus, SchedulerError> {
        let now = Utc::now();
        self.command(id, "resumed task", |t| t.resume(now)).await
    }

    /// Cancel a task. A run already in flight is not aborted.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_task(&self, id: &str) -> Result<TaskStatus, SchedulerError> {
        self.command(id, "canceled task", |t| t.cancel()).await
    }

    /// Remove a task. Returns whether it existed.
    #[tracing::instrument(skip(self))]
    pub async fn remove_task(&self, id: &str) -> bool {
        let removed = self.store.remove(id).await.is_some();
        if removed {
            info!(task_id = %id, "removed task");
        }
        removed
    }

    async fn command(
        &self,
        id: &str,
        action: &'static str,
        f: impl FnOnce(&mut Task) -> bool,
    ) -> Result<TaskStatus, SchedulerError> {
        let (changed, status) = self
            .store
            .update(id, |t| (f(t), t.status))
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if changed {
            info!(task_id = %id, status = %status, "{}", action);
        } else {
            debug!(task_id = %id, status = %status, "command left task unchanged");
        }
        Ok(status)
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            concurrency = self.pool().max(),
            "scheduler starting"
        );

        let mut outcomes = self.outcome_rx.lock().await;
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }

                Some(outcome) = outcomes.recv() => {
                    self.apply(outcome).await;
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("scheduler shut down gracefully");
    }

    /// Run one tick at the current time.
    pub async fn tick(&self) -> usize {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`. Returns how many runs were dispatched.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = Vec::new();
        self.store
            .update_all(|task| {
                let before = task.status;
                if let Some(job) = task.poll_dispatch(now) {
                    jobs.push(job);
                }
                if before != task.status && task.status.is_terminal() {
                    info!(task_id = %task.id, status = %task.status, "task finished");
                }
            })
            .await;

        let dispatched = jobs.len();
        for job in jobs {
            self.dispatch(job);
        }
        dispatched
    }

    /// Hand a job to the retry executor without waiting for it.
    fn dispatch(&self, job: JobPayload) {
        debug!(task_id = %job.task_id, run_index = job.run_index, "dispatching run");

        let retry = self.retry.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let task_id = job.task_id.clone();
            let run_index = job.run_index;
            let result = retry.submit(job).await;

            let outcome = RunOutcome {
                task_id,
                run_index,
                result,
            };
            if outcome_tx.send(outcome).await.is_err() {
                debug!("scheduler stopped, dropping run outcome");
            }
        });
    }

    /// Wait for the next run outcome without applying it.
    ///
    /// Only useful when the scheduler loop is not running.
    pub async fn next_outcome(&self) -> Option<RunOutcome> {
        self.outcome_rx.lock().await.recv().await
    }

    /// Apply a run outcome to its task.
    pub async fn apply(&self, outcome: RunOutcome) {
        let RunOutcome {
            task_id,
            run_index,
            result,
        } = outcome;

        let attempts = result.attempts();
        let run = match result {
            RetryOutcome::Succeeded { report, attempts } => {
                Run::succeeded(run_index, report, attempts)
            }
            RetryOutcome::Exhausted { failure, attempts } => {
                Run::failed(run_index, failure, attempts, Utc::now())
            }
        };
        let run_status = run.status;

        let applied = self
            .store
            .update(&task_id, |t| {
                let before = t.status;
                (t.record_run(run), before, t.status)
            })
            .await;

        match applied {
            None => {
                debug!(task_id = %task_id, run_index, "task removed, dropping run outcome");
            }
            Some((false, _, _)) => {
                warn!(task_id = %task_id, run_index, "no run in flight, dropping run outcome");
            }
            Some((true, before, after)) => {
                debug!(
                    task_id = %task_id,
                    run_index,
                    attempts,
                    status = ?run_status,
                    "applied run outcome"
                );
                if before != after {
                    info!(task_id = %task_id, status = %after, "task finished");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::executor::{UnitError, executor_fn};
    use crate::types::{RunFailure, RunReport, RunStatus};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn report() -> RunReport {
        let now = Utc::now();
        RunReport {
            started_at: now,
            ended_at: now,
            title: Some("Example Domain".to_string()),
            final_url: Some("https://example.com/".to_string()),
            http_status: Some(200),
            screenshot_path: None,
        }
    }

    fn succeeding() -> Arc<dyn JobExecutor> {
        Arc::new(executor_fn(|_job| async { Ok(report()) }))
    }

    fn failing() -> Arc<dyn JobExecutor> {
        Arc::new(executor_fn(|_job| async {
            Err(UnitError::Reported(RunFailure::new("timeout of 30000 ms exceeded")))
        }))
    }

    fn scheduler(executor: Arc<dyn JobExecutor>) -> Scheduler {
        let config = SchedulerConfig {
            blocked_hosts: vec!["blocked.test".to_string()],
            ..SchedulerConfig::default()
        };
        Scheduler::new(TaskStore::new(), executor, config)
    }

    fn assert_invariants(t: &Task) {
        assert!(t.settled() + t.in_flight <= t.repeat);
        assert!(t.in_flight <= 1);
        assert_eq!(t.runs.len() as u32, t.settled());
        assert!(t.runs.windows(2).all(|w| w[0].n < w[1].n));
    }

    /// Tick, wait for the dispatched run and apply it.
    async fn step(s: &Scheduler, now: DateTime<Utc>) -> usize {
        let dispatched = s.tick_at(now).await;
        for _ in 0..dispatched {
            let outcome = s.next_outcome().await.unwrap();
            s.apply(outcome).await;
        }
        dispatched
    }

    #[tokio::test]
    async fn test_all_runs_succeed() {
        let s = scheduler(succeeding());
        let task = s
            .create_task(NewTask::new("https://example.com", 3, 100))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);

        let mut now = Utc::now();
        for _ in 0..3 {
            assert_eq!(step(&s, now).await, 1);
            assert_invariants(&s.get_task(&task.id).await.unwrap());
            now += ChronoDuration::milliseconds(100);
        }

        let t = s.get_task(&task.id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Done);
        assert_eq!(t.done_count, 3);
        assert_eq!(t.failed_count, 0);
        assert!(t.next_run_at.is_none());
        assert!(t.runs.iter().all(|r| r.attempts == 1 && r.status == RunStatus::Ok));
        assert_eq!(
            t.runs.iter().map(|r| r.n).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // Terminal tasks are never dispatched again.
        assert_eq!(s.tick_at(now + ChronoDuration::hours(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_runs_fail_after_retries() {
        let s = scheduler(failing());
        let task = s
            .create_task(NewTask::new("https://example.com", 3, 100))
            .await
            .unwrap();

        let mut now = Utc::now();
        for _ in 0..3 {
            assert_eq!(step(&s, now).await, 1);
            now += ChronoDuration::milliseconds(100);
        }

        let t = s.get_task(&task.id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.failed_count, 3);
        assert_eq!(t.done_count, 0);
        for run in &t.runs {
            assert_eq!(run.status, RunStatus::Error);
            assert_eq!(run.attempts, 3);
            assert_eq!(
                run.error_snippet.as_deref(),
                Some("timeout of 30000 ms exceeded")
            );
        }
        assert_invariants(&t);
    }

    #[tokio::test]
    async fn test_pause_blocks_dispatch_until_resume() {
        let s = scheduler(succeeding());
        let task = s
            .create_task(NewTask::new("https://example.com", 3, 100))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(step(&s, now).await, 1);

        assert_eq!(s.pause_task(&task.id).await.unwrap(), TaskStatus::Paused);
        let paused_next = s.get_task(&task.id).await.unwrap().next_run_at;

        for minutes in 1..5 {
            assert_eq!(s.tick_at(now + ChronoDuration::minutes(minutes)).await, 0);
        }
        let t = s.get_task(&task.id).await.unwrap();
        assert_eq!(t.next_run_at, paused_next);
        assert_eq!(t.done_count, 1);

        let before_resume = Utc::now();
        assert_eq!(s.resume_task(&task.id).await.unwrap(), TaskStatus::Running);
        let resumed_next = s.get_task(&task.id).await.unwrap().next_run_at.unwrap();
        assert!(resumed_next >= before_resume);
        assert!(resumed_next <= Utc::now());

        assert_eq!(step(&s, Utc::now()).await, 1);
        assert_eq!(s.get_task(&task.id).await.unwrap().done_count, 2);
    }

    #[tokio::test]
    async fn test_blocked_host_is_rejected() {
        let s = scheduler(succeeding());
        let result = s
            .create_task(NewTask::new("https://api.blocked.test/health", 1, 100))
            .await;

        assert!(matches!(
            result,
            Err(SchedulerError::Invalid(ValidationError::BlockedHost(_)))
        ));
        assert!(s.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_batch_creates_nothing() {
        let s = scheduler(succeeding());
        let result = s
            .create_tasks(vec![
                NewTask::new("https://example.com", 1, 100),
                NewTask::new("https://example.com", 1, 50),
            ])
            .await;

        assert!(result.is_err());
        assert!(s.store().is_empty().await);

        let created = s
            .create_tasks(vec![
                NewTask::new("https://example.com", 1, 100),
                NewTask::new("https://example.org", 2, 200),
            ])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_ne!(created[0].id, created[1].id);
        assert_eq!(s.store().len().await, 2);
    }

    #[tokio::test]
    async fn test_commands_on_missing_task() {
        let s = scheduler(succeeding());
        assert!(matches!(
            s.pause_task("t_nope").await,
            Err(SchedulerError::TaskNotFound(id)) if id == "t_nope"
        ));
        assert!(s.resume_task("t_nope").await.is_err());
        assert!(s.cancel_task("t_nope").await.is_err());
        assert!(s.get_task("t_nope").await.is_err());
        assert!(!s.remove_task("t_nope").await);
    }

    #[tokio::test]
    async fn test_cancel_with_run_in_flight() {
        let s = scheduler(succeeding());
        let task = s
            .create_task(NewTask::new("https://example.com", 2, 100))
            .await
            .unwrap();

        assert_eq!(s.tick_at(Utc::now()).await, 1);
        assert_eq!(s.cancel_task(&task.id).await.unwrap(), TaskStatus::Canceled);

        let outcome = s.next_outcome().await.unwrap();
        s.apply(outcome).await;

        let t = s.get_task(&task.id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Canceled);
        assert_eq!(t.done_count, 1);
        assert_eq!(t.in_flight, 0);
        assert_invariants(&t);
        assert_eq!(s.tick_at(Utc::now() + ChronoDuration::hours(1)).await, 0);
    }

    #[tokio::test]
    async fn test_outcome_for_removed_task_is_dropped() {
        let s = scheduler(succeeding());
        let task = s
            .create_task(NewTask::new("https://example.com", 1, 100))
            .await
            .unwrap();

        assert_eq!(s.tick_at(Utc::now()).await, 1);
        assert!(s.remove_task(&task.id).await);

        let outcome = s.next_outcome().await.unwrap();
        s.apply(outcome).await;
        assert!(s.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_tick_dispatches_each_due_task_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = {
            let calls = Arc::clone(&calls);
            Arc::new(executor_fn(move |_job| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(report()) }
            }))
        };
        let s = scheduler(executor);
        for url in ["https://a.example", "https://b.example", "https://c.example"] {
            s.create_task(NewTask::new(url, 5, 100)).await.unwrap();
        }

        let now = Utc::now();
        assert_eq!(s.tick_at(now).await, 3);
        // Every task is in flight now.
        assert_eq!(s.tick_at(now + ChronoDuration::seconds(1)).await, 0);

        for _ in 0..3 {
            let outcome = s.next_outcome().await.unwrap();
            s.apply(outcome).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        for t in s.list_tasks(None).await {
            assert_eq!(t.done_count, 1);
            assert_eq!(t.in_flight, 0);
        }
    }

    #[tokio::test]
    async fn test_run_loop_completes_tasks() {
        let config = SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        };
        let s = Arc::new(Scheduler::new(TaskStore::new(), succeeding(), config));
        let task = s
            .create_task(NewTask::new("https://example.com", 3, 100))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.run(shutdown_rx).await })
        };

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let t = s.get_task(&task.id).await.unwrap();
                assert_invariants(&t);
                if t.status.is_terminal() {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task should finish");

        assert_eq!(finished.status, TaskStatus::Done);
        assert_eq!(finished.done_count, 3);
        for pair in finished.runs.windows(2) {
            let spacing = pair[1].started_at - pair[0].started_at;
            assert!(spacing >= ChronoDuration::milliseconds(90), "spacing {spacing}");
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_tick_interval_is_clamped() {
        let config = SchedulerConfig {
            tick_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        let s = Arc::new(Scheduler::new(TaskStore::new(), succeeding(), config));
        assert_eq!(s.config().tick_interval, MIN_PERIOD);

        let task = s
            .create_task(NewTask::new("https://example.com", 1, 100))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.run(shutdown_rx).await })
        };

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let t = s.get_task(&task.id).await.unwrap();
                if t.status.is_terminal() {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task should finish");
        assert_eq!(finished.status, TaskStatus::Done);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
