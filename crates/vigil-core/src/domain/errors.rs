//! Errors - エラー型と分類
//!
//! `ErrorKind` は運用上の分類、`VigilError` は実際に返すエラー。
//! 呼び出し側は `kind()` で分岐し、メッセージは `Display` に任せる。

use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskStatus;

/// ErrorKind はエラーの分類
///
/// - NotFound: 正常な「無い」結果（失敗ではない）
/// - AlreadyExists: ID 生成が正しければ起きない
/// - InvalidState: 現在のライフサイクルでは許されない操作
/// - InvalidInput: 受け付け前の検証エラー
/// - Timeout / ExecutionFailed: 外部エンジンの実行結果
/// - Storage: 永続化レイヤーの I/O エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    InvalidInput,
    Timeout,
    ExecutionFailed,
    Storage,
}

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("profile {0:?} not found")]
    ProfileNotFound(String),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("task {id} is {status}: {reason}")]
    InvalidState {
        id: TaskId,
        status: TaskStatus,
        reason: &'static str,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("storage failure: malformed record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VigilError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VigilError::NotFound(_) | VigilError::ProfileNotFound(_) => ErrorKind::NotFound,
            VigilError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            VigilError::InvalidState { .. } => ErrorKind::InvalidState,
            VigilError::InvalidInput(_) => ErrorKind::InvalidInput,
            VigilError::Timeout(_) => ErrorKind::Timeout,
            VigilError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            VigilError::Storage(_) | VigilError::Serialization(_) => ErrorKind::Storage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
