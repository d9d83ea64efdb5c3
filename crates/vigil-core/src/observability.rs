//! Observability helpers (status counts).

use serde::{Deserialize, Serialize};

use crate::domain::{ScanTask, TaskStatus};

/// Task counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.completed + self.failed
    }
}

impl<'a> FromIterator<&'a ScanTask> for QueueCounts {
    fn from_iter<I: IntoIterator<Item = &'a ScanTask>>(iter: I) -> Self {
        let mut counts = Self::default();
        for task in iter {
            counts.record(task.status);
        }
        counts
    }
}
