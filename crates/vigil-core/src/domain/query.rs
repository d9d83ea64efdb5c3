//! List queries: filtering, sorting and pagination shared by every store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

use super::ids::TaskId;
use super::owner::Owner;
use super::result::VulnerabilitySummary;
use super::state::TaskStatus;
use super::task::ScanTask;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    CreatedAt,
    CompletedAt,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "createdAt" | "created_at" | "startTime" => Ok(SortField::CreatedAt),
            "completedAt" | "completed_at" | "endTime" => Ok(SortField::CompletedAt),
            other => Err(format!("unknown sort field: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// Filter + page selection for `TaskStore::list`. Pages are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub page: usize,
    pub page_size: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl ListQuery {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Clamp caller-supplied paging: page below 1 becomes 1, a page size
    /// outside `1..=MAX_PAGE_SIZE` falls back to the default.
    pub fn normalized(mut self) -> Self {
        if self.page < 1 {
            self.page = 1;
        }
        if self.page_size < 1 || self.page_size > MAX_PAGE_SIZE {
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        self
    }

    fn matches(&self, owner: &Owner, task: &ScanTask) -> bool {
        &task.owner == owner && self.status.is_none_or(|s| s == task.status)
    }

    fn compare(&self, a: &ScanTask, b: &ScanTask) -> Ordering {
        let ord = match self.sort_by {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            // 未完了のものは昇順で末尾
            SortField::CompletedAt => match (a.completed_at, b.completed_at) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        }
        .then_with(|| a.id.cmp(&b.id));
        match self.sort_order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }

    /// Filter, sort and cut one page out of `tasks`.
    ///
    /// An out-of-range page is empty but still reports the full match count.
    pub fn apply<'a, I>(&self, owner: &Owner, tasks: I) -> Page<ScanTask>
    where
        I: IntoIterator<Item = &'a ScanTask>,
    {
        let mut matched: Vec<&ScanTask> = tasks
            .into_iter()
            .filter(|t| self.matches(owner, t))
            .collect();
        let total = matched.len();
        matched.sort_by(|a, b| self.compare(a, b));

        let start = self.page.max(1).saturating_sub(1).saturating_mul(self.page_size);
        let items = matched
            .into_iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect();

        Page {
            items,
            total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

/// FIFO order for queued tasks: creation time, then id.
pub fn fifo_order(a: &ScanTask, b: &ScanTask) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Is `task` eligible for the retention sweep at `cutoff`?
pub fn is_stale(task: &ScanTask, cutoff: DateTime<Utc>) -> bool {
    task.status.is_terminal() && task.effective_timestamp() < cutoff
}

/// List view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub image: String,
    pub status: TaskStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<VulnerabilitySummary>,
}

impl From<&ScanTask> for TaskSummary {
    fn from(task: &ScanTask) -> Self {
        Self {
            id: task.id,
            image: task.image.clone(),
            status: task.status,
            message: task.message.clone(),
            created_at: task.created_at,
            completed_at: task.completed_at,
            queue_position: task.queue_position,
            summary: task.result.as_ref().and_then(|r| r.summary),
        }
    }
}
