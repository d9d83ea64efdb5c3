//! TaskStore port - タスクレコードの正本（source of truth）
//!
//! # 実装
//! - `impls::file_store::FileTaskStore`: タスクごとのディレクトリに永続化
//! - `impls::memory_store::InMemoryTaskStore`: テスト・一時利用向け

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ListQuery, Owner, Page, ScanTask, TaskId, VigilError};

/// TaskStore はタスクの状態・出力・結果を保持する
///
/// # 設計原則
/// - 書き込みは「永続化してから索引に公開」の順。永続化に失敗したら索引は変わらない
/// - `update` は出力ログを書き換えない（伸ばせるのは `append_log` だけ）
/// - 読み出しは索引から返す（ディスクは起動時にだけ走査する）
/// - エラーは呼び出し側へそのまま返す。リトライはしない
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// `AlreadyExists` if the id is taken.
    async fn create(&self, task: &ScanTask) -> Result<(), VigilError>;

    /// Absence is `Ok(None)`, not an error.
    async fn get(&self, id: TaskId) -> Result<Option<ScanTask>, VigilError>;

    /// Replace the record. The stored output is kept as is.
    async fn update(&self, task: &ScanTask) -> Result<(), VigilError>;

    async fn delete(&self, id: TaskId) -> Result<(), VigilError>;

    /// Append one line to the task's transcript.
    async fn append_log(&self, id: TaskId, line: &str) -> Result<(), VigilError>;

    async fn list(&self, owner: &Owner, query: &ListQuery) -> Result<Page<ScanTask>, VigilError>;

    /// Queued tasks of one owner, oldest first.
    async fn list_queued(&self, owner: &Owner) -> Result<Vec<ScanTask>, VigilError>;

    /// Oldest queued task across every owner.
    async fn next_queued(&self) -> Result<Option<ScanTask>, VigilError>;

    async fn list_running(&self) -> Result<Vec<ScanTask>, VigilError>;

    /// Terminal tasks whose effective timestamp is strictly before `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanTask>, VigilError>;

    /// Bytes used by one owner's records, transcripts and artifacts.
    async fn owner_storage_size(&self, owner: &Owner) -> Result<u64, VigilError>;
}
