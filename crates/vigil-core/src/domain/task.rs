//! Scan task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::engine::EngineVersion;
use super::errors::VigilError;
use super::ids::TaskId;
use super::owner::Owner;
use super::result::ScanResult;
use super::scan_config::ScanConfig;
use super::state::TaskStatus;

/// One unit of scan work.
///
/// Design:
/// - State transitions happen through the `mark_*` methods, which refuse
///   anything `TaskStatus::can_transition_to` does not allow.
/// - `queue_position` is computed on read and never persisted.
/// - `output` is owned by the store's append-only log; it is skipped when the
///   record itself is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTask {
    pub id: TaskId,
    pub owner: Owner,
    pub image: String,
    pub status: TaskStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub config: ScanConfig,

    #[serde(skip)]
    pub queue_position: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    #[serde(skip)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<EngineVersion>,
}

impl ScanTask {
    pub fn new(
        id: TaskId,
        owner: Owner,
        image: impl Into<String>,
        config: ScanConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner,
            image: image.into(),
            status: TaskStatus::Queued,
            message: "Task created and queued".to_string(),
            created_at: now,
            started_at: None,
            completed_at: None,
            config,
            queue_position: None,
            result: None,
            output: String::new(),
            error_output: None,
            engine_version: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), VigilError> {
        if !self.status.can_transition_to(next) {
            return Err(VigilError::InvalidState {
                id: self.id,
                status: self.status,
                reason: "illegal status transition",
            });
        }
        self.status = next;
        Ok(())
    }

    /// Queued -> Running.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), VigilError> {
        self.transition(TaskStatus::Running)?;
        self.message = "Scan in progress".to_string();
        self.started_at = Some(now);
        self.queue_position = None;
        Ok(())
    }

    /// Running -> Completed.
    pub fn mark_completed(
        &mut self,
        now: DateTime<Utc>,
        result: ScanResult,
    ) -> Result<(), VigilError> {
        self.transition(TaskStatus::Completed)?;
        self.message = "Scan completed successfully".to_string();
        self.completed_at = Some(now);
        self.result = Some(result);
        Ok(())
    }

    /// Queued/Running -> Failed.
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<(), VigilError> {
        self.transition(TaskStatus::Failed)?;
        self.message = message.into();
        self.completed_at = Some(now);
        self.error_output = Some(error.into());
        self.queue_position = None;
        Ok(())
    }

    /// Completion time if finished, creation time otherwise. Retention uses this.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    /// Wall-clock time between admission and completion.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }

    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }
}
