//! ScanService - 外部に公開する操作
//!
//! HTTP ハンドラや CLI はここだけを呼ぶ。所有者の解決（認証）は呼び出し側の責務。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::log_hub::{LogHub, LogListener};
use super::scheduler::Scheduler;
use super::status::{FALLBACK_SCAN_DURATION, QueueStatus, estimate_wait, mean_scan_duration};
use crate::domain::{
    ListQuery, Owner, Page, ScanRequest, ScanTask, TaskId, TaskStatus, TaskSummary, VigilError,
};
use crate::observability::QueueCounts;
use crate::ports::TaskStore;

/// How long `stream_log` waits for the transcript to catch up with the hub.
const BACKFILL_WAIT: Duration = Duration::from_secs(5);
const BACKFILL_POLL: Duration = Duration::from_millis(10);

/// Result of `delete_all_tasks`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: usize,
    pub skipped_running: usize,
}

/// History first, then live lines until the task finishes.
///
/// Dropping the stream unsubscribes it.
pub struct LogStream {
    history: VecDeque<String>,
    live: Option<LogListener>,
    hub: Arc<LogHub>,
}

impl LogStream {
    fn finished(hub: Arc<LogHub>, output: &str) -> Self {
        Self {
            history: output.lines().map(str::to_string).collect(),
            live: None,
            hub,
        }
    }

    /// Next line, or `None` once the history is exhausted and the task has
    /// completed.
    pub async fn next_line(&mut self) -> Option<String> {
        if let Some(line) = self.history.pop_front() {
            return Some(line);
        }
        match self.live.as_mut() {
            Some(listener) => listener.recv().await,
            None => None,
        }
    }

    /// Whether live lines may still arrive.
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        if let Some(listener) = &self.live {
            self.hub.unsubscribe(listener);
        }
    }
}

pub struct ScanService {
    store: Arc<dyn TaskStore>,
    hub: Arc<LogHub>,
    scheduler: Arc<Scheduler>,
}

impl ScanService {
    pub fn new(store: Arc<dyn TaskStore>, hub: Arc<LogHub>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            store,
            hub,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub async fn create_task(
        &self,
        owner: Owner,
        request: ScanRequest,
    ) -> Result<ScanTask, VigilError> {
        self.scheduler.submit(owner, request).await
    }

    /// 1-based positions of the owner's queued tasks.
    async fn queue_positions(&self, owner: &Owner) -> Result<HashMap<TaskId, usize>, VigilError> {
        Ok(self
            .store
            .list_queued(owner)
            .await?
            .into_iter()
            .enumerate()
            .map(|(i, t)| (t.id, i + 1))
            .collect())
    }

    pub async fn get_task(&self, id: TaskId) -> Result<ScanTask, VigilError> {
        let mut task = self.store.get(id).await?.ok_or(VigilError::NotFound(id))?;
        if task.status == TaskStatus::Queued {
            task.queue_position = self.queue_positions(&task.owner).await?.get(&id).copied();
        }
        Ok(task)
    }

    pub async fn list_tasks(
        &self,
        owner: &Owner,
        query: ListQuery,
    ) -> Result<Page<TaskSummary>, VigilError> {
        let query = query.normalized();
        let page = self.store.list(owner, &query).await?;
        let positions = self.queue_positions(owner).await?;
        Ok(page.map(|mut task| {
            task.queue_position = positions.get(&task.id).copied();
            TaskSummary::from(&task)
        }))
    }

    /// Replay what the task has printed so far, then follow it live.
    ///
    /// Lines already evicted from the hub's ring are read back from the
    /// stored transcript, which may trail the hub by a few lines.
    pub async fn stream_log(&self, id: TaskId) -> Result<LogStream, VigilError> {
        let task = self.store.get(id).await?.ok_or(VigilError::NotFound(id))?;
        if task.status.is_terminal() {
            return Ok(LogStream::finished(self.hub.clone(), &task.output));
        }

        let (replay, listener) = self.hub.subscribe_with_replay(id);
        // drop で購読解除されるよう、先に stream にしておく
        let mut stream = LogStream {
            history: VecDeque::new(),
            live: Some(listener),
            hub: self.hub.clone(),
        };
        let deadline = Instant::now() + BACKFILL_WAIT;
        loop {
            // 購読前に終わっていたら close_all を取り逃しているので、保存済みの出力を返す
            let task = self.store.get(id).await?.ok_or(VigilError::NotFound(id))?;
            if task.status.is_terminal() {
                return Ok(LogStream::finished(self.hub.clone(), &task.output));
            }
            let stored = task.output_lines().count();
            if stored >= replay.skipped || Instant::now() >= deadline {
                if stored < replay.skipped {
                    tracing::warn!(
                        task_id = %id,
                        missing = replay.skipped - stored,
                        "transcript behind live output, replay has a gap"
                    );
                }
                stream.history = task
                    .output_lines()
                    .take(replay.skipped)
                    .map(str::to_string)
                    .chain(replay.lines)
                    .collect();
                return Ok(stream);
            }
            tokio::time::sleep(BACKFILL_POLL).await;
        }
    }

    pub async fn cancel_task(&self, id: TaskId) -> Result<ScanTask, VigilError> {
        self.scheduler.cancel(id).await
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<(), VigilError> {
        self.scheduler.delete(id).await
    }

    /// Delete everything the owner has that is not running.
    pub async fn delete_all_tasks(&self, owner: &Owner) -> Result<DeleteSummary, VigilError> {
        let mut summary = DeleteSummary::default();
        for task in self.all_tasks(owner).await? {
            match self.scheduler.delete(task.id).await {
                Ok(()) => summary.deleted += 1,
                Err(VigilError::InvalidState { .. }) => summary.skipped_running += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            owner = %owner,
            deleted = summary.deleted,
            skipped_running = summary.skipped_running,
            "bulk delete finished"
        );
        Ok(summary)
    }

    pub async fn queue_status(&self, owner: &Owner) -> Result<QueueStatus, VigilError> {
        let queue_length = self.store.list_queued(owner).await?.len();
        let completed = self
            .store
            .list(
                owner,
                &ListQuery::default()
                    .with_status(TaskStatus::Completed)
                    .page(1, usize::MAX),
            )
            .await?;
        let per_task = mean_scan_duration(&completed.items).unwrap_or(FALLBACK_SCAN_DURATION);
        let max_workers = self.scheduler.max_workers();
        Ok(QueueStatus {
            queue_length,
            estimated_average_wait: estimate_wait(queue_length, per_task, max_workers),
            running: self.scheduler.running(),
            max_workers,
        })
    }

    pub async fn counts(&self, owner: &Owner) -> Result<QueueCounts, VigilError> {
        Ok(self.all_tasks(owner).await?.iter().collect())
    }

    pub async fn storage_usage(&self, owner: &Owner) -> Result<u64, VigilError> {
        self.store.owner_storage_size(owner).await
    }

    async fn all_tasks(&self, owner: &Owner) -> Result<Vec<ScanTask>, VigilError> {
        let everything = ListQuery::default().page(1, usize::MAX);
        Ok(self.store.list(owner, &everything).await?.items)
    }
}
