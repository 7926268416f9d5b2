//! Bounded pool of isolated execution units.
//!
//! Every job runs in its own spawned unit that owns nothing but the payload.
//! A semaphore caps how many units run at once; callers beyond the cap wait in
//! FIFO order and start as soon as a slot frees up.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::executor::{JobExecutor, UnitError};
use crate::types::{JobPayload, RunReport};

/// Bounded-concurrency executor for jobs.
#[derive(Clone)]
pub struct WorkerPool {
    executor: Arc<dyn JobExecutor>,
    slots: Arc<Semaphore>,
    max: usize,
    waiting: Arc<AtomicUsize>,
}

/// Counts a caller as queued until it gets a slot or gives up.
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// Create a pool running at most `max` units at once (at least one).
    pub fn new(executor: Arc<dyn JobExecutor>, max: usize) -> Self {
        let max = max.max(1);
        Self {
            executor,
            slots: Arc::new(Semaphore::new(max)),
            max,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Maximum number of concurrent units.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Units currently running.
    pub fn active(&self) -> usize {
        self.max - self.slots.available_permits()
    }

    /// Callers waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Run one job in a fresh unit, waiting for a slot if the pool is full.
    ///
    /// A unit that panics is reported as [`UnitError::Crashed`]; its slot is
    /// released like any other.
    pub async fn run(&self, job: JobPayload) -> Result<RunReport, UnitError> {
        let task_id = job.task_id.clone();
        let run_index = job.run_index;

        let permit = {
            let _queued = WaitGuard::enter(&self.waiting);
            Arc::clone(&self.slots)
                .acquire_owned()
                .await
                .map_err(|_| UnitError::Crashed("worker pool closed".to_string()))?
        };

        debug!(task_id = %task_id, run_index, active = self.active(), "starting worker unit");

        let executor = Arc::clone(&self.executor);
        let unit = tokio::spawn(async move {
            // Held until the unit finishes, however it finishes.
            let _permit = permit;
            executor.execute(job).await
        });

        match unit.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(task_id = %task_id, run_index, error = %message, "worker unit panicked");
                Err(UnitError::Crashed(message))
            }
            Err(e) => {
                warn!(task_id = %task_id, run_index, error = %e, "worker unit aborted");
                Err(UnitError::Crashed(e.to_string()))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::executor_fn;
    use crate::types::{RunFailure, TaskOptions};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::{Instant, sleep};

    fn job(task_id: &str) -> JobPayload {
        JobPayload {
            task_id: task_id.to_string(),
            run_index: 1,
            url: "https://example.com".to_string(),
            options: TaskOptions::default(),
        }
    }

    fn report() -> RunReport {
        let now = Utc::now();
        RunReport {
            started_at: now,
            ended_at: now,
            title: None,
            final_url: None,
            http_status: Some(200),
            screenshot_path: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_caps_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let executor = {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            executor_fn(move |_job| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_secs(1)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(report())
                }
            })
        };
        let pool = WorkerPool::new(Arc::new(executor), 2);

        let start = Instant::now();
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.run(job(&format!("t_{i}"))).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let elapsed = start.elapsed();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "elapsed {elapsed:?}");
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_is_served_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let executor = {
            let order = Arc::clone(&order);
            executor_fn(move |job: JobPayload| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(job.task_id);
                    sleep(Duration::from_millis(10)).await;
                    Ok(report())
                }
            })
        };
        let pool = WorkerPool::new(Arc::new(executor), 1);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.run(job(&format!("t_{i}"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["t_0", "t_1", "t_2", "t_3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_track_active_and_queued() {
        let executor = executor_fn(|_job| async {
            sleep(Duration::from_secs(10)).await;
            Ok(report())
        });
        let pool = WorkerPool::new(Arc::new(executor), 1);

        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(job("t_a")).await }
        });
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(job("t_b")).await }
        });

        sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.active(), 1);
        assert_eq!(pool.queued(), 1);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_panicking_unit_is_isolated() {
        let executor = executor_fn(|job: JobPayload| async move {
            if job.task_id == "t_bad" {
                panic!("renderer exploded");
            }
            Ok(report())
        });
        let pool = WorkerPool::new(Arc::new(executor), 2);

        let bad = pool.run(job("t_bad")).await;
        assert_eq!(
            bad,
            Err(UnitError::Crashed("renderer exploded".to_string()))
        );

        // The slot came back and other units are unaffected.
        assert_eq!(pool.active(), 0);
        for _ in 0..3 {
            assert!(pool.run(job("t_good")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_reported_failure_passes_through() {
        let executor = executor_fn(|_job| async {
            Err(UnitError::Reported(RunFailure::new("net::ERR_NAME_NOT_RESOLVED")))
        });
        let pool = WorkerPool::new(Arc::new(executor), 1);

        let result = pool.run(job("t_x")).await;
        assert!(matches!(
            result,
            Err(UnitError::Reported(ref f)) if f.error_snippet == "net::ERR_NAME_NOT_RESOLVED"
        ));
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let executor = executor_fn(|_job| async { Ok(report()) });
        let pool = WorkerPool::new(Arc::new(executor), 0);
        assert_eq!(pool.max(), 1);
    }
}
