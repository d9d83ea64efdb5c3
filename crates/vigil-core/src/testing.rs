//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use crate::domain::{EngineVersion, ListQuery, Owner, Page, ScanTask, TaskId, VigilError};
use crate::impls::InMemoryTaskStore;
use crate::ports::{CommandOutput, CommandRunner, EngineProbe, LineSink, TaskStore};

/// What one scripted command invocation does.
#[derive(Clone, Default)]
pub(crate) struct Script {
    lines: Vec<String>,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    hold: Duration,
    gate: Option<Arc<Semaphore>>,
    launch_error: Option<String>,
}

impl Script {
    pub(crate) fn succeed(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub(crate) fn exit(code: i32, stderr: &str) -> Self {
        Self {
            stderr: stderr.to_string(),
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub(crate) fn launch_error(message: &str) -> Self {
        Self {
            launch_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Lines fed to the callback before finishing.
    pub(crate) fn lines(mut self, lines: &[&str]) -> Self {
        self.lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub(crate) fn hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    /// Block until a permit is added to `gate`.
    pub(crate) fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `CommandRunner` that plays back scripts in order and records calls.
/// Once the scripts run out every call succeeds with `{}`.
#[derive(Clone, Default)]
pub(crate) struct ScriptedRunner {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub(crate) fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Image reference (last argument) of every call, in call order.
    pub(crate) fn images(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|(_, args)| args.last().cloned())
            .collect()
    }

    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        on_line: LineSink<'_>,
    ) -> Result<CommandOutput, VigilError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::succeed("{}"));

        if let Some(message) = script.launch_error {
            return Err(VigilError::ExecutionFailed(message));
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        for line in &script.lines {
            on_line(line.as_str());
            tokio::task::yield_now().await;
        }
        if let Some(gate) = &script.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !script.hold.is_zero() {
            tokio::time::sleep(script.hold).await;
        }

        Ok(CommandOutput {
            stdout: script.stdout,
            stderr: script.stderr,
            exit_code: script.exit_code,
        })
    }
}

/// Probe with a fixed answer.
pub(crate) struct StaticProbe(pub(crate) EngineVersion);

#[async_trait]
impl EngineProbe for StaticProbe {
    async fn probe(&self) -> Result<EngineVersion, VigilError> {
        Ok(self.0.clone())
    }
}

/// Probe that never answers.
pub(crate) struct HangingProbe;

#[async_trait]
impl EngineProbe for HangingProbe {
    async fn probe(&self) -> Result<EngineVersion, VigilError> {
        std::future::pending().await
    }
}

/// In-memory store whose `update` fails for records matching `reject`.
pub(crate) struct RejectingStore {
    inner: InMemoryTaskStore,
    reject: fn(&ScanTask) -> bool,
}

impl RejectingStore {
    pub(crate) fn new(reject: fn(&ScanTask) -> bool) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            reject,
        }
    }
}

#[async_trait]
impl TaskStore for RejectingStore {
    async fn create(&self, task: &ScanTask) -> Result<(), VigilError> {
        self.inner.create(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<ScanTask>, VigilError> {
        self.inner.get(id).await
    }

    async fn update(&self, task: &ScanTask) -> Result<(), VigilError> {
        if (self.reject)(task) {
            return Err(VigilError::Storage(std::io::Error::other("disk full")));
        }
        self.inner.update(task).await
    }

    async fn delete(&self, id: TaskId) -> Result<(), VigilError> {
        self.inner.delete(id).await
    }

    async fn append_log(&self, id: TaskId, line: &str) -> Result<(), VigilError> {
        self.inner.append_log(id, line).await
    }

    async fn list(&self, owner: &Owner, query: &ListQuery) -> Result<Page<ScanTask>, VigilError> {
        self.inner.list(owner, query).await
    }

    async fn list_queued(&self, owner: &Owner) -> Result<Vec<ScanTask>, VigilError> {
        self.inner.list_queued(owner).await
    }

    async fn next_queued(&self) -> Result<Option<ScanTask>, VigilError> {
        self.inner.next_queued().await
    }

    async fn list_running(&self) -> Result<Vec<ScanTask>, VigilError> {
        self.inner.list_running().await
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScanTask>, VigilError> {
        self.inner.list_stale(cutoff).await
    }

    async fn owner_storage_size(&self, owner: &Owner) -> Result<u64, VigilError> {
        self.inner.owner_storage_size(owner).await
    }
}

/// Poll `store` until `id` satisfies `done`, failing the test after 5s.
pub(crate) async fn wait_for<F>(store: &dyn TaskStore, id: TaskId, done: F) -> ScanTask
where
    F: Fn(&ScanTask) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(task) = store.get(id).await.unwrap() {
            if done(&task) {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} did not reach the expected state"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) async fn wait_terminal(store: &dyn TaskStore, id: TaskId) -> ScanTask {
    wait_for(store, id, |t| t.status.is_terminal()).await
}

/// Poll `store` until `id` is gone, failing the test after 5s.
pub(crate) async fn wait_for_absent(store: &dyn TaskStore, id: TaskId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.get(id).await.unwrap().is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} was not removed"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
