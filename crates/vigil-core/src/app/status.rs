//! Status - キュー状況の見積もり

use std::time::Duration;

use crate::domain::ScanTask;

/// Used per task when an owner has no completed scans to average over.
pub const FALLBACK_SCAN_DURATION: Duration = Duration::from_secs(30);

/// Queue length and expected wait for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub estimated_average_wait: Duration,
    pub running: usize,
    pub max_workers: usize,
}

/// Mean run time of the completed scans in `history`, if any have one.
pub fn mean_scan_duration<'a>(history: impl IntoIterator<Item = &'a ScanTask>) -> Option<Duration> {
    let (total, count) = history
        .into_iter()
        .filter_map(|t| t.run_duration()?.to_std().ok())
        .fold((Duration::ZERO, 0u32), |(sum, n), d| (sum.saturating_add(d), n + 1));
    (count > 0).then(|| total / count)
}

/// `queue_length` tasks of `per_task` each, spread over `workers` slots.
pub fn estimate_wait(queue_length: usize, per_task: Duration, workers: usize) -> Duration {
    let queued = u32::try_from(queue_length).unwrap_or(u32::MAX);
    let workers = u32::try_from(workers.max(1)).unwrap_or(u32::MAX);
    per_task.saturating_mul(queued) / workers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Owner, ScanConfig, ScanResult, TaskId};
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    fn completed_after(secs: i64) -> ScanTask {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut t = ScanTask::new(
            TaskId::from_ulid(Ulid::new()),
            Owner::anonymous(),
            "alpine",
            ScanConfig::default(),
            start,
        );
        t.mark_running(start).unwrap();
        t.mark_completed(
            start + chrono::Duration::seconds(secs),
            ScanResult::from_output("table", String::new()),
        )
        .unwrap();
        t
    }

    #[test]
    fn mean_over_completed_runs() {
        let history = [completed_after(10), completed_after(50)];
        assert_eq!(mean_scan_duration(&history), Some(Duration::from_secs(30)));
        assert_eq!(mean_scan_duration(std::iter::empty()), None);
    }

    #[rstest]
    #[case::empty(0, 30, 5, 0)]
    #[case::single_worker(4, 30, 1, 120)]
    #[case::spread(10, 30, 5, 60)]
    #[case::zero_workers_treated_as_one(2, 30, 0, 60)]
    fn wait_estimate(
        #[case] queued: usize,
        #[case] per_task_secs: u64,
        #[case] workers: usize,
        #[case] expected_secs: u64,
    ) {
        assert_eq!(
            estimate_wait(queued, Duration::from_secs(per_task_secs), workers),
            Duration::from_secs(expected_secs)
        );
    }
}
