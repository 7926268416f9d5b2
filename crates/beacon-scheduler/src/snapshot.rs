//! Whole-map JSON snapshots of the task store.
//!
//! The state file is a single document `{"tasks": {id: task}}`, rewritten in
//! full on every save. Loading is lenient: entries that fail to decode are
//! skipped, missing counters default to zero, and `inFlight` is always reset
//! since no run survives a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::MIN_PERIOD;
use crate::error::SchedulerError;
use crate::store::TaskStore;
use crate::types::Task;

/// On-disk layout of the state file.
#[derive(Serialize)]
struct StateDocument<'a> {
    tasks: &'a HashMap<String, Task>,
}

/// A JSON state file on disk.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot of `store`, replacing the file atomically.
    pub async fn save(&self, store: &TaskStore) -> Result<usize, SchedulerError> {
        let tasks = store.snapshot().await;
        let json = serde_json::to_vec_pretty(&StateDocument { tasks: &tasks })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), count = tasks.len(), "saved state");
        Ok(tasks.len())
    }

    /// Read the file and merge its tasks into `store`.
    ///
    /// A missing file loads nothing. Returns the number of tasks merged.
    pub async fn load(&self, store: &TaskStore) -> Result<usize, SchedulerError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file, starting empty");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let tasks = decode_tasks(&bytes)?;
        let count = store.merge(tasks).await;
        info!(path = %self.path.display(), count, "loaded state");
        Ok(count)
    }
}

/// Decode the tasks in a state document, skipping entries that do not parse.
fn decode_tasks(bytes: &[u8]) -> Result<Vec<Task>, SchedulerError> {
    let document: Value = serde_json::from_slice(bytes)?;
    let Some(entries) = document.get("tasks").and_then(Value::as_object) else {
        warn!("state file has no tasks object, ignoring");
        return Ok(Vec::new());
    };

    let mut tasks = Vec::with_capacity(entries.len());
    for (key, entry) in entries {
        match serde_json::from_value::<Task>(entry.clone()) {
            Ok(mut task) => {
                if task.id.is_empty() {
                    task.id = key.clone();
                }
                task.in_flight = 0;
                tasks.push(task);
            }
            Err(e) => {
                warn!(task_id = %key, error = %e, "skipping malformed task in state file");
            }
        }
    }
    Ok(tasks)
}

/// Save `store` every `every` until shutdown, then once more.
///
/// Failures are logged and never stop the loop.
pub async fn run_autosave(
    file: StateFile,
    store: TaskStore,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(every.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = file.save(&store).await {
                    error!(path = %file.path().display(), error = %e, "failed to save state");
                }
            }
        }
    }

    if let Err(e) = file.save(&store).await {
        error!(path = %file.path().display(), error = %e, "failed to save state on shutdown");
    }
    info!("autosave stopped");
}
