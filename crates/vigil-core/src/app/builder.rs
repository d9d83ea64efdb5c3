//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 起動順序
//! 1. 設定の検証（Fail-fast）
//! 2. ストアを開く（ディスク全体を走査して索引を作る）、設定プロファイルの置き場も用意する
//! 3. クラッシュ復旧（`running` のまま残ったタスクを `failed` に）
//! 4. admission loop と retention loop を起動
//!
//! `inspect_only` のときは 3 と 4 を行わない。別プロセスが動いているかもしれない
//! データを読むだけの用途（CLI の list / show など）向け。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::lifecycle::{RetentionSweeper, SweepReport, recover_interrupted};
use super::log_hub::LogHub;
use super::profiles::ProfileService;
use super::scheduler::{Scheduler, SchedulerDeps};
use super::service::ScanService;
use crate::config::{Config, ConfigError};
use crate::domain::VigilError;
use crate::impls::{CommandProbe, FileProfileStore, FileTaskStore, TokioCommandRunner};
use crate::ports::{
    Clock, CommandRunner, DisabledProbe, EngineProbe, ProfileStore, SystemClock, TaskStore,
    UlidGenerator,
};

/// AppBuilder は App を構築する
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(Config::from_env()?).build().await?;
/// let task = app.service().create_task(owner, request).await?;
/// app.shutdown().await;
/// ```
///
/// 差し替えなかった部品は本番用（FileTaskStore, FileProfileStore,
/// TokioCommandRunner, CommandProbe, SystemClock）になる。
pub struct AppBuilder {
    config: Config,
    store: Option<Arc<dyn TaskStore>>,
    profile_store: Option<Arc<dyn ProfileStore>>,
    runner: Option<Arc<dyn CommandRunner>>,
    probe: Option<Arc<dyn EngineProbe>>,
    clock: Option<Arc<dyn Clock>>,
    inspect_only: bool,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open task store: {0}")]
    Store(#[source] VigilError),
    #[error("crash recovery failed: {0}")]
    Recovery(#[source] VigilError),
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            profile_store: None,
            runner: None,
            probe: None,
            clock: None,
            inspect_only: false,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_profile_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.profile_store = Some(store);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn EngineProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Skip recovery and background loops.
    pub fn inspect_only(mut self) -> Self {
        self.inspect_only = true;
        self
    }

    pub async fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let config = self.config;

        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                FileTaskStore::open(&config.data_dir)
                    .await
                    .map_err(BuildError::Store)?,
            ),
        };
        let profile_store: Arc<dyn ProfileStore> = match self.profile_store {
            Some(store) => store,
            None => Arc::new(
                FileProfileStore::open(&config.data_dir)
                    .await
                    .map_err(BuildError::Store)?,
            ),
        };
        let profiles = Arc::new(ProfileService::new(profile_store, config.profile_policy()));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let runner: Arc<dyn CommandRunner> = self
            .runner
            .unwrap_or_else(|| Arc::new(TokioCommandRunner::new()));
        let probe: Arc<dyn EngineProbe> = match self.probe {
            Some(probe) => probe,
            None if config.engine_probe => {
                Arc::new(CommandProbe::new(runner.clone(), config.engine.clone()))
            }
            None => Arc::new(DisabledProbe),
        };
        let hub = Arc::new(LogHub::new(config.log_history, config.listener_capacity));

        let scheduler = Scheduler::new(
            SchedulerDeps {
                store: store.clone(),
                hub: hub.clone(),
                runner,
                probe,
                clock: clock.clone(),
                ids: Arc::new(UlidGenerator::new(clock.clone())),
            },
            config.scheduler_settings(),
        );
        let service = Arc::new(ScanService::new(store.clone(), hub.clone(), scheduler.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::new();
        if !self.inspect_only {
            recover_interrupted(store.as_ref(), clock.as_ref())
                .await
                .map_err(BuildError::Recovery)?;
            handles.push(scheduler.spawn_admission_loop());
            let sweeper = RetentionSweeper::new(
                store.clone(),
                hub.clone(),
                clock.clone(),
                config.retention,
                config.retention_interval,
            );
            handles.extend(sweeper.spawn(shutdown_rx));
        }

        tracing::info!(
            data_dir = %config.data_dir.display(),
            max_workers = config.max_workers,
            inspect_only = self.inspect_only,
            "app started"
        );
        Ok(App {
            config,
            service,
            profiles,
            scheduler,
            store,
            hub,
            clock,
            shutdown_tx,
            handles,
        })
    }
}

/// App は構築済みのランタイム
///
/// `shutdown` を呼ぶまでバックグラウンドのループが動き続ける。
pub struct App {
    config: Config,
    service: Arc<ScanService>,
    profiles: Arc<ProfileService>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn TaskStore>,
    hub: Arc<LogHub>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl App {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &Arc<ScanService> {
        &self.service
    }

    pub fn profiles(&self) -> &Arc<ProfileService> {
        &self.profiles
    }

    /// Run one retention pass right now, regardless of the loop.
    pub async fn sweep_now(&self) -> Result<SweepReport, VigilError> {
        RetentionSweeper::new(
            self.store.clone(),
            self.hub.clone(),
            self.clock.clone(),
            self.config.retention,
            self.config.retention_interval,
        )
        .sweep()
        .await
    }

    /// Stop admitting, wait for running scans, stop the loops.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.scheduler.shutdown().await;
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("app stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ConfigProfile, Owner, ScanConfig, ScanRequest, ScanTask, TaskId, TaskStatus,
    };
    use crate::impls::InMemoryTaskStore;
    use crate::ports::FixedClock;
    use crate::testing::{ScriptedRunner, wait_terminal};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use ulid::Ulid;

    fn config(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            engine_probe: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn builds_and_runs_a_scan_end_to_end() {
        let dir = TempDir::new().unwrap();
        let app = AppBuilder::new(config(&dir))
            .with_runner(Arc::new(ScriptedRunner::default()))
            .build()
            .await
            .unwrap();

        let task = app
            .service()
            .create_task(Owner::resolve(None), ScanRequest::new("alpine"))
            .await
            .unwrap();
        assert!(task.owner.is_anonymous());

        let done = wait_terminal(app.store.as_ref(), task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(
            dir.path()
                .join("scans/users/anonymous")
                .join(task.id.to_string())
                .join("result.json")
                .is_file()
        );

        app.shutdown().await;
    }

    #[tokio::test]
    async fn profiles_are_stored_next_to_scans() {
        let dir = TempDir::new().unwrap();
        let app = AppBuilder::new(config(&dir))
            .with_runner(Arc::new(ScriptedRunner::default()))
            .build()
            .await
            .unwrap();

        let owner = Owner::new("alice");
        let profile = ConfigProfile {
            image_prefix: Some("registry.local/".into()),
            ..ConfigProfile::default()
        };
        app.profiles().save(&owner, "local", profile).await.unwrap();
        let request = app.profiles().get(&owner, "local").await.unwrap().request_for("alpine");
        let task = app.service().create_task(owner, request).await.unwrap();
        assert_eq!(task.image, "registry.local/alpine");
        assert!(dir.path().join("configs/users/alice/config_local.json").is_file());

        wait_terminal(app.store.as_ref(), task.id).await;
        app.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let dir = TempDir::new().unwrap();
        let err = AppBuilder::new(Config {
            max_workers: 0,
            ..config(&dir)
        })
        .build()
        .await
        .err()
        .unwrap();
        assert!(matches!(err, BuildError::Config(ConfigError::Zero { .. })));
    }

    async fn store_with_running_task() -> (Arc<InMemoryTaskStore>, TaskId) {
        let store = Arc::new(InMemoryTaskStore::new());
        let t0 = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        let mut task = ScanTask::new(
            TaskId::from_ulid(Ulid::new()),
            Owner::new("alice"),
            "alpine",
            ScanConfig::default(),
            t0,
        );
        store.create(&task).await.unwrap();
        task.mark_running(t0).unwrap();
        store.update(&task).await.unwrap();
        (store, task.id)
    }

    #[tokio::test]
    async fn startup_recovers_interrupted_scans() {
        let dir = TempDir::new().unwrap();
        let (store, id) = store_with_running_task().await;
        let app = AppBuilder::new(config(&dir))
            .with_store(store.clone())
            .with_runner(Arc::new(ScriptedRunner::default()))
            .with_clock(Arc::new(FixedClock::new(Utc::now())))
            .build()
            .await
            .unwrap();

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.message, "Scan interrupted by server restart");
        app.shutdown().await;
    }

    #[tokio::test]
    async fn inspect_only_leaves_state_alone() {
        let dir = TempDir::new().unwrap();
        let (store, id) = store_with_running_task().await;
        let app = AppBuilder::new(config(&dir))
            .with_store(store.clone())
            .inspect_only()
            .build()
            .await
            .unwrap();

        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Running);
        assert_eq!(app.service().get_task(id).await.unwrap().status, TaskStatus::Running);
        app.shutdown().await;
    }
}
