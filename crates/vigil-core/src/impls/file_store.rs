//! File-backed task store.
//!
//! Layout:
//!
//! ```text
//! <data_dir>/scans/users/<owner-segment>/<task-id>/
//!     metadata.json   record (temp file + rename)
//!     output.log      append-only transcript
//!     result.<ext>    raw engine output, once a result exists
//! ```
//!
//! The whole tree is read once in `open`; afterwards every read is served
//! from the in-memory index.
//!
//! Disk writes for one task are serialized by that task's own lock. The index
//! lock is only held to read or publish records, never across file I/O.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::domain::query::{fifo_order, is_stale};
use crate::domain::{ListQuery, Owner, Page, ScanTask, TaskId, TaskStatus, VigilError};
use crate::ports::TaskStore;

const METADATA_FILE: &str = "metadata.json";
const METADATA_TMP: &str = "metadata.json.tmp";
const OUTPUT_FILE: &str = "output.log";
const TOMBSTONE_SUFFIX: &str = ".deleting";

/// Durable `TaskStore`: one directory per task, indexed in memory.
pub struct FileTaskStore {
    root: PathBuf,
    index: RwLock<HashMap<TaskId, ScanTask>>,
    task_locks: StdMutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

/// What `open` found on disk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
    pub tombstones_removed: usize,
}

impl FileTaskStore {
    /// Open (or create) the store under `data_dir` and rebuild the index.
    ///
    /// Unreadable records are logged and skipped. Leftover tombstones from an
    /// interrupted delete are removed.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, VigilError> {
        let root = data_dir.as_ref().join("scans").join("users");
        fs::create_dir_all(&root).await?;

        let (index, report) = load_index(&root).await?;
        tracing::info!(
            root = %root.display(),
            loaded = report.loaded,
            skipped = report.skipped,
            tombstones_removed = report.tombstones_removed,
            "task store opened"
        );
        Ok(Self {
            root,
            index: RwLock::new(index),
            task_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &Owner) -> PathBuf {
        self.root.join(owner.storage_segment())
    }

    fn task_dir(&self, task: &ScanTask) -> PathBuf {
        self.owner_dir(&task.owner).join(task.id.to_string())
    }

    async fn lock_task(&self, id: TaskId) -> OwnedMutexGuard<()> {
        let lock = self
            .task_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    fn forget_task_lock(&self, id: TaskId) {
        self.task_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Directory and current record of `id`, read under the index lock.
    async fn current(&self, id: TaskId) -> Result<(PathBuf, ScanTask), VigilError> {
        let index = self.index.read().await;
        let task = index.get(&id).ok_or(VigilError::NotFound(id))?;
        Ok((self.task_dir(task), task.clone()))
    }
}

async fn write_metadata(dir: &Path, task: &ScanTask) -> Result<(), VigilError> {
    let bytes = serde_json::to_vec_pretty(task)?;
    let tmp = dir.join(METADATA_TMP);
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, dir.join(METADATA_FILE)).await?;
    Ok(())
}

fn result_path(dir: &Path, task: &ScanTask) -> Option<PathBuf> {
    task.result
        .as_ref()
        .map(|result| dir.join(format!("result.{}", result.artifact_extension())))
}

async fn write_result(dir: &Path, task: &ScanTask) -> Result<(), VigilError> {
    if let (Some(path), Some(result)) = (result_path(dir, task), &task.result) {
        fs::write(path, result.data.as_bytes()).await?;
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "could not remove file");
    }
}

async fn write_new_task(dir: &Path, task: &ScanTask) -> Result<(), VigilError> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::create_dir(dir).await?;
    fs::write(dir.join(OUTPUT_FILE), task.output.as_bytes()).await?;
    write_result(dir, task).await?;
    write_metadata(dir, task).await
}

async fn load_index(root: &Path) -> Result<(HashMap<TaskId, ScanTask>, LoadReport), VigilError> {
    let mut index = HashMap::new();
    let mut report = LoadReport::default();

    let mut owners = fs::read_dir(root).await?;
    while let Some(owner_entry) = owners.next_entry().await? {
        if !owner_entry.file_type().await?.is_dir() {
            continue;
        }
        let mut tasks = fs::read_dir(owner_entry.path()).await?;
        while let Some(entry) = tasks.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(TOMBSTONE_SUFFIX) {
                match fs::remove_dir_all(&path).await {
                    Ok(()) => report.tombstones_removed += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "could not remove tombstone")
                    }
                }
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            match load_task(&path).await {
                Ok(task) => {
                    index.insert(task.id, task);
                    report.loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task record");
                    report.skipped += 1;
                }
            }
        }
    }
    Ok((index, report))
}

async fn load_task(dir: &Path) -> Result<ScanTask, VigilError> {
    let raw = fs::read(dir.join(METADATA_FILE)).await?;
    let mut task: ScanTask = serde_json::from_slice(&raw)?;

    task.output = match fs::read(dir.join(OUTPUT_FILE)).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    if let Some(result) = task.result.as_mut() {
        let path = dir.join(format!("result.{}", result.artifact_extension()));
        match fs::read(&path).await {
            Ok(bytes) => result.data = String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(task_id = %task.id, path = %path.display(), error = %e, "result artifact missing")
            }
        }
    }
    Ok(task)
}

async fn dir_size(dir: PathBuf) -> Result<u64, VigilError> {
    let mut total = 0u64;
    let mut pending = vec![dir];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn create(&self, task: &ScanTask) -> Result<(), VigilError> {
        let _task_guard = self.lock_task(task.id).await;
        if self.index.read().await.contains_key(&task.id) {
            return Err(VigilError::AlreadyExists(task.id));
        }

        let dir = self.task_dir(task);
        if let Err(e) = write_new_task(&dir, task).await {
            // 途中まで書いたものは残さない
            if let Err(cleanup) = fs::remove_dir_all(&dir).await
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(task_id = %task.id, error = %cleanup, "could not clean up partial task directory");
            }
            return Err(e);
        }

        let mut record = task.clone();
        record.queue_position = None;
        self.index.write().await.insert(task.id, record);
        tracing::debug!(task_id = %task.id, owner = %task.owner, "task created");
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<ScanTask>, VigilError> {
        Ok(self.index.read().await.get(&id).cloned())
    }

    async fn update(&self, task: &ScanTask) -> Result<(), VigilError> {
        let _task_guard = self.lock_task(task.id).await;
        let (dir, current) = self.current(task.id).await?;

        let new_result = if current.result.is_none() { result_path(&dir, task) } else { None };
        if new_result.is_some() {
            write_result(&dir, task).await?;
        }
        if let Err(e) = write_metadata(&dir, task).await {
            if let Some(path) = &new_result {
                remove_quietly(path).await;
            }
            return Err(e);
        }

        let mut index = self.index.write().await;
        let mut record = task.clone();
        record.output = index
            .get(&task.id)
            .map_or(current.output, |t| t.output.clone());
        record.queue_position = None;
        index.insert(task.id, record);
        Ok(())
    }

    async fn delete(&self, id: TaskId) -> Result<(), VigilError> {
        let task_guard = self.lock_task(id).await;
        let (dir, task) = self.current(id).await?;

        let tombstone = self
            .owner_dir(&task.owner)
            .join(format!(".{id}{TOMBSTONE_SUFFIX}"));
        fs::rename(&dir, &tombstone).await?;
        self.index.write().await.remove(&id);
        self.forget_task_lock(id);
        drop(task_guard);

        if let Err(e) = fs::remove_dir_all(&tombstone).await {
            // 次回起動時に掃除される
            tracing::warn!(task_id = %id, error = %e, "could not remove tombstone");
        }
        tracing::debug!(task_id = %id, "task deleted");
        Ok(())
    }

    async fn append_log(&self, id: TaskId, line: &str) -> Result<(), VigilError> {
        let _task_guard = self.lock_task(id).await;
        let dir = {
            let index = self.index.read().await;
            let task = index.get(&id).ok_or(VigilError::NotFound(id))?;
            self.task_dir(task)
        };

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(OUTPUT_FILE))
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        if let Some(task) = self.index.write().await.get_mut(&id) {
            task.output.push_str(&buf);
        }
        Ok(())
    }

    async fn list(&self, owner: &Owner, query: &ListQuery) -> Result<Page<ScanTask>, VigilError> {
        let index = self.index.read().await;
        Ok(query.apply(owner, index.values()))
    }

    async fn list_queued(&self, owner: &Owner) -> Result<Vec<ScanTask>, VigilError> {
        let index = self.index.read().await;
        let mut queued: Vec<ScanTask> = index
            .values()
            .filter(|t| &t.owner == owner && t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(fifo_order);
        Ok(queued)
    }

    async fn next_queued(&self) -> Result<Option<ScanTask>, VigilError> {
        let index = self.index.read().await;
        Ok(index
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .min_by(|a, b| fifo_order(a, b))
            .cloned())
    }

    async fn list_running(&self) -> Result<Vec<ScanTask>, VigilError> {
        let index = self.index.read().await;
        Ok(index
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanTask>, VigilError> {
        let index = self.index.read().await;
        Ok(index
            .values()
            .filter(|t| is_stale(t, cutoff))
            .cloned()
            .collect())
    }

    async fn owner_storage_size(&self, owner: &Owner) -> Result<u64, VigilError> {
        dir_size(self.owner_dir(owner)).await
    }
}
