//! In-memory task store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::query::{fifo_order, is_stale};
use crate::domain::{ListQuery, Owner, Page, ScanTask, TaskId, TaskStatus, VigilError};
use crate::ports::TaskStore;

/// Volatile `TaskStore`. Nothing survives the process; used by tests and by
/// callers that do not need durability.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, ScanTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: &ScanTask) -> Result<(), VigilError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(VigilError::AlreadyExists(task.id));
        }
        let mut record = task.clone();
        record.queue_position = None;
        tasks.insert(task.id, record);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<ScanTask>, VigilError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update(&self, task: &ScanTask) -> Result<(), VigilError> {
        let mut tasks = self.tasks.write().await;
        let current = tasks.get_mut(&task.id).ok_or(VigilError::NotFound(task.id))?;
        let output = std::mem::take(&mut current.output);
        *current = task.clone();
        current.output = output;
        current.queue_position = None;
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> Result<(), VigilError> {
        self.tasks
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(VigilError::NotFound(id))
    }

    async fn append_log(&self, id: TaskId, line: &str) -> Result<(), VigilError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(VigilError::NotFound(id))?;
        task.output.push_str(line);
        task.output.push('\n');
        Ok(())
    }

    async fn list(&self, owner: &Owner, query: &ListQuery) -> Result<Page<ScanTask>, VigilError> {
        let tasks = self.tasks.read().await;
        Ok(query.apply(owner, tasks.values()))
    }

    async fn list_queued(&self, owner: &Owner) -> Result<Vec<ScanTask>, VigilError> {
        let tasks = self.tasks.read().await;
        let mut queued: Vec<ScanTask> = tasks
            .values()
            .filter(|t| &t.owner == owner && t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(fifo_order);
        Ok(queued)
    }

    async fn next_queued(&self) -> Result<Option<ScanTask>, VigilError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .min_by(|a, b| fifo_order(a, b))
            .cloned())
    }

    async fn list_running(&self) -> Result<Vec<ScanTask>, VigilError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanTask>, VigilError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| is_stale(t, cutoff))
            .cloned()
            .collect())
    }

    async fn owner_storage_size(&self, owner: &Owner) -> Result<u64, VigilError> {
        let tasks = self.tasks.read().await;
        let mut total = 0u64;
        for task in tasks.values().filter(|t| &t.owner == owner) {
            let record = serde_json::to_vec(task)?;
            let result = task.result.as_ref().map_or(0, |r| r.data.len());
            total += (record.len() + task.output.len() + result) as u64;
        }
        Ok(total)
    }
}
