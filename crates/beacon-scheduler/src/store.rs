//! Ownership of task records.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::SchedulerError;
use crate::types::{Task, TaskStatus};

/// Shared, lock-protected map of tasks keyed by id.
///
/// Every mutation happens under the write lock, so readers (including
/// snapshots) never observe a task halfway through an update.
#[derive(Clone, Default)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new task. Fails if the id is taken.
    pub async fn insert(&self, task: Task) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(SchedulerError::TaskExists(task.id));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Add several tasks atomically. Nothing is inserted if any id is taken.
    pub async fn insert_all(&self, batch: Vec<Task>) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.write().await;
        for (i, task) in batch.iter().enumerate() {
            if tasks.contains_key(&task.id) || batch[..i].iter().any(|t| t.id == task.id) {
                return Err(SchedulerError::TaskExists(task.id.clone()));
            }
        }
        for task in batch {
            tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    /// Get a copy of a task by id.
    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// List tasks, optionally filtered by status, oldest first.
    pub async fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Number of stored tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Remove a task. Returns the removed record, if any.
    pub async fn remove(&self, id: &str) -> Option<Task> {
        self.tasks.write().await.remove(id)
    }

    /// Mutate one task under the write lock.
    pub async fn update<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.tasks.write().await.get_mut(id).map(f)
    }

    /// Mutate every task under a single write lock.
    pub async fn update_all(&self, mut f: impl FnMut(&mut Task)) {
        let mut tasks = self.tasks.write().await;
        for task in tasks.values_mut() {
            f(task);
        }
    }

    /// Consistent copy of the whole map.
    pub async fn snapshot(&self) -> HashMap<String, Task> {
        self.tasks.read().await.clone()
    }

    /// Merge records into the store, replacing any with the same id.
    pub async fn merge(&self, records: impl IntoIterator<Item = Task>) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut count = 0;
        for task in records {
            tasks.insert(task.id.clone(), task);
            count += 1;
        }
        count
    }
}
