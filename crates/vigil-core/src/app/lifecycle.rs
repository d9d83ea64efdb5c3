//! Lifecycle - 起動時の復旧と保持期間による掃除
//!
//! - recover: 前回のプロセスで `running` のまま残ったタスクを `failed` にする。
//!   admission を始める前に一度だけ同期的に呼ぶ
//! - RetentionSweeper: 起動直後と一定間隔で、期限切れの終了済みタスクを消す

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::log_hub::LogHub;
use crate::domain::{TaskId, VigilError};
use crate::ports::{Clock, TaskStore};

pub const INTERRUPTED_MESSAGE: &str = "Scan interrupted by server restart";
const INTERRUPTED_ERROR: &str = "Server was restarted while this scan was in progress";

/// Mark every task left `running` by a previous process as failed.
/// Returns how many were recovered.
pub async fn recover_interrupted(
    store: &dyn TaskStore,
    clock: &dyn Clock,
) -> Result<usize, VigilError> {
    let running = store.list_running().await?;
    let mut recovered = 0;
    for mut task in running {
        let now = clock.now();
        task.mark_failed(now, INTERRUPTED_MESSAGE, INTERRUPTED_ERROR)?;
        store
            .append_log(task.id, &format!("{INTERRUPTED_MESSAGE} at {}", now.to_rfc3339()))
            .await?;
        store.update(&task).await?;
        tracing::warn!(task_id = %task.id, image = %task.image, "recovered interrupted scan");
        recovered += 1;
    }
    if recovered > 0 {
        tracing::info!(recovered, "crash recovery finished");
    }
    Ok(recovered)
}

/// Outcome of one retention pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub failures: Vec<(TaskId, String)>,
}

pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
    hub: Arc<LogHub>,
    clock: Arc<dyn Clock>,
    window: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<LogHub>,
        clock: Arc<dyn Clock>,
        window: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            clock,
            window,
            interval,
        }
    }

    /// A zero window turns the sweeper off.
    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// Delete every terminal task finished (or created) before now - window.
    pub async fn sweep(&self) -> Result<SweepReport, VigilError> {
        let mut report = SweepReport::default();
        if !self.is_enabled() {
            return Ok(report);
        }
        // 表現できる最古の時刻より前に終わったタスクはないので、何も消さない
        let Some(cutoff) = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| self.clock.now().checked_sub_signed(window))
        else {
            tracing::debug!(window = ?self.window, "retention window reaches past the calendar");
            return Ok(report);
        };

        for task in self.store.list_stale(cutoff).await? {
            match self.store.delete(task.id).await {
                Ok(()) => {
                    self.hub.close_all(task.id);
                    report.deleted += 1;
                }
                // 並行して消された
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "retention delete failed");
                    report.failures.push((task.id, e.to_string()));
                }
            }
        }
        tracing::info!(
            deleted = report.deleted,
            failures = report.failures.len(),
            cutoff = %cutoff.to_rfc3339(),
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Sweep now, then every interval, until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            tracing::info!("retention sweep disabled");
            return None;
        }
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!(error = %e, "retention sweep failed");
                        }
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("retention loop stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Owner, ScanConfig, ScanResult, ScanTask, TaskStatus};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use chrono::{DateTime, TimeZone, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn task(created: DateTime<Utc>) -> ScanTask {
        ScanTask::new(
            TaskId::from_ulid(Ulid::new()),
            Owner::new("alice"),
            "alpine",
            ScanConfig::default(),
            created,
        )
    }

    async fn finished(store: &InMemoryTaskStore, at: DateTime<Utc>) -> TaskId {
        let mut t = task(at - chrono::Duration::minutes(1));
        store.create(&t).await.unwrap();
        t.mark_running(at).unwrap();
        t.mark_completed(at, ScanResult::from_output("json", "{}".into()))
            .unwrap();
        store.update(&t).await.unwrap();
        t.id
    }

    #[tokio::test]
    async fn running_tasks_become_interrupted_failures() {
        let store = InMemoryTaskStore::new();
        let clock = FixedClock::new(now());
        let mut running = task(now());
        store.create(&running).await.unwrap();
        running.mark_running(now()).unwrap();
        store.update(&running).await.unwrap();
        let queued = task(now());
        store.create(&queued).await.unwrap();

        assert_eq!(recover_interrupted(&store, &clock).await.unwrap(), 1);

        let t = store.get(running.id).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.message, INTERRUPTED_MESSAGE);
        assert!(t.output.contains(INTERRUPTED_MESSAGE));
        assert_eq!(
            store.get(queued.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(recover_interrupted(&store, &clock).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_terminal_tasks_strictly_before_cutoff() {
        let store = Arc::new(InMemoryTaskStore::new());
        let window = Duration::from_secs(3600);
        let cutoff = now() - chrono::Duration::hours(1);

        let old = finished(&store, cutoff - chrono::Duration::seconds(1)).await;
        let boundary = finished(&store, cutoff).await;
        let fresh = finished(&store, now()).await;
        let ancient_queued = task(cutoff - chrono::Duration::days(30));
        store.create(&ancient_queued).await.unwrap();

        let sweeper = RetentionSweeper::new(
            store.clone(),
            Arc::new(LogHub::default()),
            Arc::new(FixedClock::new(now())),
            window,
            Duration::from_secs(60),
        );
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(report.failures.is_empty());

        assert!(store.get(old).await.unwrap().is_none());
        assert!(store.get(boundary).await.unwrap().is_some());
        assert!(store.get(fresh).await.unwrap().is_some());
        assert!(store.get(ancient_queued.id).await.unwrap().is_some());
    }

    #[rstest]
    #[case::past_the_calendar(Duration::from_secs(1_000_000 * 365 * 24 * 3600))]
    #[case::past_chrono_range(Duration::from_secs(u64::MAX))]
    #[tokio::test]
    async fn huge_window_keeps_everything(#[case] window: Duration) {
        let store = Arc::new(InMemoryTaskStore::new());
        let old = finished(&store, now() - chrono::Duration::days(3650)).await;
        let sweeper = RetentionSweeper::new(
            store.clone(),
            Arc::new(LogHub::default()),
            Arc::new(FixedClock::new(now())),
            window,
            Duration::from_secs(60),
        );
        assert_eq!(sweeper.sweep().await.unwrap(), SweepReport::default());
        assert!(store.get(old).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_window_disables_the_sweep() {
        let store = Arc::new(InMemoryTaskStore::new());
        finished(&store, now() - chrono::Duration::days(365)).await;
        let sweeper = RetentionSweeper::new(
            store.clone(),
            Arc::new(LogHub::default()),
            Arc::new(FixedClock::new(now())),
            Duration::ZERO,
            Duration::from_secs(60),
        );
        assert_eq!(sweeper.sweep().await.unwrap(), SweepReport::default());

        let (_tx, rx) = watch::channel(false);
        assert!(sweeper.spawn(rx).is_none());
    }

    #[tokio::test]
    async fn loop_sweeps_immediately_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryTaskStore::new());
        let old = finished(&store, now() - chrono::Duration::days(100)).await;
        let sweeper = RetentionSweeper::new(
            store.clone(),
            Arc::new(LogHub::default()),
            Arc::new(FixedClock::new(now())),
            Duration::from_secs(90 * 24 * 3600),
            Duration::from_secs(3600),
        );
        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(rx).unwrap();

        crate::testing::wait_for_absent(store.as_ref(), old).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
