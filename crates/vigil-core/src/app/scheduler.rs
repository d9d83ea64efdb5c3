//! Scheduler - 同時実行数を制限したスキャン実行
//!
//! # フロー
//! 1. submit: 検証 → `queued` で永続化 → 空きスロットがあれば即座に admit
//! 2. admission loop: 一定間隔、またはスロット解放・投入の通知で起きて、
//!    空きスロットの数だけ古い順に admit する
//! 3. execute: `running` → エンジン起動（期限付き）→ `completed` / `failed`
//!    → 購読者を閉じる → スロット解放
//!
//! スロットは `Semaphore` の owned permit。実行タスクに move して、終了時に
//! drop されることで解放される。admit / cancel / delete は `admission` ロックで
//! 直列化するので、queued のタスクが二重に claim されることはない。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use super::invocation::{build_scan_args, mask_credentials};
use super::log_hub::LogHub;
use crate::domain::{Owner, ScanRequest, ScanResult, ScanTask, TaskId, TaskStatus, VigilError};
use crate::ports::{Clock, CommandRunner, EngineProbe, IdGenerator, TaskStore};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for the scheduler. Built from `Config`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_workers: usize,
    pub scan_timeout: Duration,
    pub sweep_interval: Duration,
    pub engine: String,
    pub engine_server: Option<String>,
    pub probe_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_workers: 5,
            scan_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(1),
            engine: "trivy".to_string(),
            engine_server: None,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

/// Collaborators the scheduler drives.
pub struct SchedulerDeps {
    pub store: Arc<dyn TaskStore>,
    pub hub: Arc<LogHub>,
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn EngineProbe>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    hub: Arc<LogHub>,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn EngineProbe>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    settings: SchedulerSettings,

    slots: Arc<Semaphore>,
    admission: Mutex<()>,
    accepting: AtomicBool,
    wake: Notify,
    stop_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, settings: SchedulerSettings) -> Arc<Self> {
        let workers = settings.max_workers.max(1);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            store: deps.store,
            hub: deps.hub,
            runner: deps.runner,
            probe: deps.probe,
            clock: deps.clock,
            ids: deps.ids,
            settings: SchedulerSettings {
                max_workers: workers,
                ..settings
            },
            slots: Arc::new(Semaphore::new(workers)),
            admission: Mutex::new(()),
            accepting: AtomicBool::new(true),
            wake: Notify::new(),
            stop_tx,
        })
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn max_workers(&self) -> usize {
        self.settings.max_workers
    }

    /// Scans currently holding a slot.
    pub fn running(&self) -> usize {
        self.settings
            .max_workers
            .saturating_sub(self.slots.available_permits())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Validate, persist as `queued`, and try to start right away.
    ///
    /// Admission problems are logged, not returned: once persisted, the task
    /// is the caller's and the loop will pick it up later.
    pub async fn submit(
        self: &Arc<Self>,
        owner: Owner,
        request: ScanRequest,
    ) -> Result<ScanTask, VigilError> {
        let (image, config) = request.normalize()?;
        let task = ScanTask::new(
            self.ids.generate_task_id(),
            owner,
            image,
            config,
            self.clock.now(),
        );
        self.store.create(&task).await?;
        tracing::info!(task_id = %task.id, owner = %task.owner, image = %task.image, "task queued");

        if let Err(e) = self.admit_available().await {
            tracing::warn!(task_id = %task.id, error = %e, "immediate admission failed");
        }
        self.wake.notify_one();

        Ok(self.store.get(task.id).await?.unwrap_or(task))
    }

    /// Admit queued tasks, oldest first, while slots are free. Never waits
    /// for a slot. Returns how many were started.
    pub async fn admit_available(self: &Arc<Self>) -> Result<usize, VigilError> {
        let mut admitted = 0;
        while self.is_accepting() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };

            let guard = self.admission.lock().await;
            if !self.is_accepting() {
                break;
            }
            let Some(mut task) = self.store.next_queued().await? else {
                break;
            };
            task.mark_running(self.clock.now())?;
            self.store.update(&task).await?;
            drop(guard);

            tracing::info!(task_id = %task.id, image = %task.image, "task admitted");
            let this = Arc::clone(self);
            tokio::spawn(async move { this.execute(task, permit).await });
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Start the admission loop. It stops on `shutdown`.
    pub fn spawn_admission_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.settings.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = this.wake.notified() => {}
                    _ = stop_rx.changed() => continue,
                }
                if let Err(e) = this.admit_available().await {
                    tracing::warn!(error = %e, "admission sweep failed");
                }
            }
            tracing::debug!("admission loop stopped");
        })
    }

    /// Fail a queued task on the owner's request.
    pub async fn cancel(&self, id: TaskId) -> Result<ScanTask, VigilError> {
        let guard = self.admission.lock().await;
        let mut task = self.store.get(id).await?.ok_or(VigilError::NotFound(id))?;
        if task.status != TaskStatus::Queued {
            return Err(VigilError::InvalidState {
                id,
                status: task.status,
                reason: "only queued tasks can be cancelled",
            });
        }
        task.mark_failed(self.clock.now(), "Scan cancelled by user", "cancelled by user")?;
        self.store.append_log(id, "Scan cancelled by user").await?;
        self.store.update(&task).await?;
        drop(guard);

        self.hub.close_all(id);
        tracing::info!(task_id = %id, "task cancelled");
        Ok(task)
    }

    /// Remove a task that is not running.
    pub async fn delete(&self, id: TaskId) -> Result<(), VigilError> {
        let guard = self.admission.lock().await;
        let task = self.store.get(id).await?.ok_or(VigilError::NotFound(id))?;
        if task.status == TaskStatus::Running {
            return Err(VigilError::InvalidState {
                id,
                status: task.status,
                reason: "running tasks cannot be deleted",
            });
        }
        self.store.delete(id).await?;
        drop(guard);

        self.hub.close_all(id);
        tracing::info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Stop admitting, stop the loop and wait for every running scan.
    pub async fn shutdown(&self) {
        {
            let _guard = self.admission.lock().await;
            self.accepting.store(false, Ordering::SeqCst);
        }
        let _ = self.stop_tx.send(true);

        let workers = u32::try_from(self.settings.max_workers).unwrap_or(u32::MAX);
        match self.slots.acquire_many(workers).await {
            Ok(permits) => permits.forget(),
            Err(_) => tracing::debug!("slots already closed"),
        }
        self.slots.close();
        tracing::info!("scheduler drained");
    }

    async fn execute(self: Arc<Self>, task: ScanTask, permit: OwnedSemaphorePermit) {
        let id = task.id;
        if let Err(e) = self.run_scan(task).await {
            tracing::error!(task_id = %id, error = %e, "could not record scan outcome");
            self.fail_unrecorded(id, &e).await;
        }
        self.hub.close_all(id);
        drop(permit);
        self.wake.notify_one();
    }

    /// Move a task whose outcome could not be stored to `failed`, so it is
    /// not left `running` without a process behind it.
    async fn fail_unrecorded(&self, id: TaskId, cause: &VigilError) {
        let mut task = match self.store.get(id).await {
            Ok(Some(task)) if !task.status.is_terminal() => task,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(task_id = %id, error = %e, "could not reload task after recording failure");
                return;
            }
        };
        let message = format!("Scan failed: could not record outcome: {cause}");
        if let Err(e) = task.mark_failed(self.clock.now(), message.clone(), cause.to_string()) {
            tracing::error!(task_id = %id, error = %e, "could not mark task failed");
            return;
        }
        self.log(id, &message).await;
        if let Err(e) = self.store.update(&task).await {
            tracing::error!(task_id = %id, error = %e, "task left running: store rejected the failure record");
        }
    }

    /// Transcript line: live listeners first, then the durable log.
    async fn log(&self, id: TaskId, line: &str) {
        self.hub.append(id, line);
        if let Err(e) = self.store.append_log(id, line).await {
            tracing::warn!(task_id = %id, error = %e, "could not append to transcript");
        }
    }

    async fn run_scan(&self, mut task: ScanTask) -> Result<(), VigilError> {
        let id = task.id;
        self.log(id, &format!("Scan started at {}", self.clock.now().to_rfc3339()))
            .await;

        match tokio::time::timeout(self.settings.probe_timeout, self.probe.probe()).await {
            Ok(Ok(version)) => {
                for line in version.describe() {
                    self.log(id, &line).await;
                }
                task.engine_version = Some(version);
                if let Err(e) = self.store.update(&task).await {
                    tracing::warn!(task_id = %id, error = %e, "could not record engine version");
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(task_id = %id, error = %e, "engine probe failed");
                self.log(id, &format!("Warning: could not fetch engine version: {e}"))
                    .await;
            }
            Err(_) => {
                tracing::warn!(task_id = %id, "engine probe timed out");
                self.log(id, "Warning: could not fetch engine version: timed out")
                    .await;
            }
        }

        let args = build_scan_args(
            &task,
            self.settings.engine_server.as_deref(),
            self.settings.scan_timeout,
        );
        self.log(
            id,
            &format!(
                "Executing: {} {}",
                self.settings.engine,
                mask_credentials(&args).join(" ")
            ),
        )
        .await;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let run = {
            let hub = Arc::clone(&self.hub);
            let runner = &self.runner;
            let engine = self.settings.engine.as_str();
            let args = &args;
            let deadline = self.settings.scan_timeout;
            async move {
                let on_line = move |line: &str| {
                    hub.append(id, line);
                    let _ = line_tx.send(line.to_string());
                };
                tokio::time::timeout(deadline, runner.run(engine, args, &on_line)).await
                // on_line (and the sender) drops here, ending the pump
            }
        };
        let pump = async {
            while let Some(line) = line_rx.recv().await {
                if let Err(e) = self.store.append_log(id, &line).await {
                    tracing::warn!(task_id = %id, error = %e, "could not append to transcript");
                }
            }
        };
        let (outcome, ()) = tokio::join!(run, pump);

        match outcome {
            Err(_) => {
                let limit = humantime::format_duration(self.settings.scan_timeout);
                self.fail(task, "Scan timeout exceeded", format!("scan did not finish within {limit}"))
                    .await
            }
            Ok(Err(e)) => self.fail(task, format!("Scan failed: {e}"), e.to_string()).await,
            Ok(Ok(output)) if !output.success() => {
                let status = match output.exit_code {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                };
                let stderr = output.stderr.trim();
                let error = if stderr.is_empty() { status.clone() } else { stderr.to_string() };
                self.fail(task, format!("Scan failed: {status}"), error).await
            }
            Ok(Ok(output)) => {
                let result = ScanResult::from_output(&task.config.format, output.stdout);
                let now = self.clock.now();
                task.mark_completed(now, result)?;
                self.log(id, &format!("Scan completed at {}", now.to_rfc3339()))
                    .await;
                self.store.update(&task).await?;
                self.hub.close_all(id);
                tracing::info!(task_id = %id, "scan completed");
                Ok(())
            }
        }
    }

    async fn fail(
        &self,
        mut task: ScanTask,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<(), VigilError> {
        let message = message.into();
        task.mark_failed(self.clock.now(), message.clone(), error)?;
        self.log(task.id, &message).await;
        self.store.update(&task).await?;
        self.hub.close_all(task.id);
        tracing::warn!(task_id = %task.id, reason = %message, "scan failed");
        Ok(())
    }
}
