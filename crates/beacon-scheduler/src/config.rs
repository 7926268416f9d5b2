//! Scheduler configuration.

use std::time::Duration;

/// Default scheduler tick period.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);

/// Default number of concurrently running worker units.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default retries after the first attempt of a run.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Shortest tick or autosave period; `tokio::time::interval` rejects zero.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Knobs for the scheduling core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler inspects the task store.
    pub tick_interval: Duration,
    /// Maximum number of worker units running at once.
    pub concurrency: usize,
    /// Retries per run after the first attempt fails.
    pub max_retries: u32,
    /// Backoff before retry `n` is `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Host suffixes that tasks may not target.
    pub blocked_hosts: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            blocked_hosts: Vec::new(),
        }
    }
}
