//! Log hub - タスク出力のライブ配信
//!
//! タスクごとに直近の行を ring buffer に保持し、購読者それぞれの有界
//! チャネルへ `try_send` で配る。満杯の購読者は行を落とす（生成側は待たない）。
//! 完全な記録はストアの transcript が持つので、ここは at-most-once でよい。
//! ring から溢れた行数は数えておき、購読側がストアから補えるようにする。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::TaskId;

pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;
pub const DEFAULT_LISTENER_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiving end of one subscription.
///
/// `recv` yields `None` once the task has been closed (after any lines
/// already buffered for this listener).
#[derive(Debug)]
pub struct LogListener {
    id: ListenerId,
    task_id: TaskId,
    rx: mpsc::Receiver<String>,
}

impl LogListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// History handed to a new subscriber.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Replay {
    /// Lines evicted from the ring before `lines[0]`. They are the first
    /// `skipped` lines of the stored transcript.
    pub skipped: usize,
    pub lines: Vec<String>,
}

#[derive(Default)]
struct ChannelState {
    lines: VecDeque<String>,
    evicted: usize,
    listeners: HashMap<ListenerId, mpsc::Sender<String>>,
    closed: bool,
}

#[derive(Default)]
struct TaskChannel {
    state: Mutex<ChannelState>,
}

/// Per-task fan-out of output lines.
pub struct LogHub {
    channels: Mutex<HashMap<TaskId, Arc<TaskChannel>>>,
    history_limit: usize,
    listener_capacity: usize,
    next_listener: AtomicU64,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT, DEFAULT_LISTENER_CAPACITY)
    }
}

impl LogHub {
    pub fn new(history_limit: usize, listener_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
            listener_capacity: listener_capacity.max(1),
            next_listener: AtomicU64::new(1),
        }
    }

    fn existing(&self, task: TaskId) -> Option<Arc<TaskChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task)
            .cloned()
    }

    /// Run `f` against the live (not yet closed) channel of `task`, creating
    /// it if needed.
    fn with_channel<R>(&self, task: TaskId, mut f: impl FnMut(&mut ChannelState) -> R) -> R {
        loop {
            let channel = self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(task)
                .or_default()
                .clone();
            let mut state = channel.state.lock().unwrap_or_else(PoisonError::into_inner);
            // close_all と競合した場合は作り直す
            if !state.closed {
                return f(&mut state);
            }
        }
    }

    fn register(&self, task: TaskId, state: &mut ChannelState) -> LogListener {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.listener_capacity);
        state.listeners.insert(id, tx);
        LogListener { id, task_id: task, rx }
    }

    /// Record `line` and offer it to every listener without waiting.
    pub fn append(&self, task: TaskId, line: &str) {
        let limit = self.history_limit;
        self.with_channel(task, |state| {
            if state.lines.len() >= limit {
                state.lines.pop_front();
                state.evicted += 1;
            }
            state.lines.push_back(line.to_string());

            state.listeners.retain(|id, tx| match tx.try_send(line.to_string()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(task_id = %task, listener = id.0, "listener full, dropping line");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        });
    }

    pub fn subscribe(&self, task: TaskId) -> LogListener {
        self.with_channel(task, |state| self.register(task, state))
    }

    /// Buffered lines for `task`, oldest first.
    pub fn snapshot(&self, task: TaskId) -> Vec<String> {
        match self.existing(task) {
            Some(channel) => {
                let state = channel.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.lines.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Snapshot the history and register a listener under one lock, so every
    /// line shows up exactly once across the two.
    pub fn subscribe_with_replay(&self, task: TaskId) -> (Replay, LogListener) {
        self.with_channel(task, |state| {
            let replay = Replay {
                skipped: state.evicted,
                lines: state.lines.iter().cloned().collect(),
            };
            (replay, self.register(task, state))
        })
    }

    pub fn unsubscribe(&self, listener: &LogListener) {
        let task = listener.task_id;
        let Some(channel) = self.existing(task) else {
            return;
        };
        let now_idle = {
            let mut state = channel.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.listeners.remove(&listener.id);
            state.listeners.is_empty() && state.lines.is_empty()
        };
        if now_idle {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            if channels.get(&task).is_some_and(|c| Arc::ptr_eq(c, &channel)) {
                channels.remove(&task);
            }
        }
    }

    /// Drop every listener and the buffer of `task`. Safe to call twice.
    pub fn close_all(&self, task: TaskId) {
        let removed = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task);
        if let Some(channel) = removed {
            let mut state = channel.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            let listeners = state.listeners.len();
            state.listeners.clear();
            state.lines.clear();
            tracing::debug!(task_id = %task, listeners, "log channel closed");
        }
    }

    pub fn listener_count(&self, task: TaskId) -> usize {
        self.existing(task).map_or(0, |channel| {
            channel
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn listeners_receive_lines_in_order() {
        let hub = LogHub::default();
        let task = id();
        let mut a = hub.subscribe(task);
        let mut b = hub.subscribe(task);

        hub.append(task, "one");
        hub.append(task, "two");
        hub.close_all(task);

        for listener in [&mut a, &mut b] {
            assert_eq!(listener.recv().await.as_deref(), Some("one"));
            assert_eq!(listener.recv().await.as_deref(), Some("two"));
            assert_eq!(listener.recv().await, None);
        }
    }

    #[test]
    fn history_is_a_bounded_ring() {
        let hub = LogHub::new(3, 10);
        let task = id();
        for i in 0..5 {
            hub.append(task, &format!("line {i}"));
        }
        assert_eq!(hub.snapshot(task), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn replay_counts_lines_evicted_from_the_ring() {
        let hub = LogHub::new(3, 10);
        let task = id();
        for i in 0..7 {
            hub.append(task, &format!("line {i}"));
        }
        let (replay, _listener) = hub.subscribe_with_replay(task);
        assert_eq!(replay.skipped, 4);
        assert_eq!(replay.lines, vec!["line 4", "line 5", "line 6"]);
    }

    #[tokio::test]
    async fn full_listener_drops_lines_without_blocking() {
        let hub = LogHub::new(100, 2);
        let task = id();
        let mut slow = hub.subscribe(task);
        for i in 0..10 {
            hub.append(task, &format!("{i}"));
        }
        hub.close_all(task);

        let mut got = Vec::new();
        while let Some(line) = slow.recv().await {
            got.push(line);
        }
        assert_eq!(got, vec!["0", "1"]);
    }

    #[test]
    fn dropped_listeners_are_pruned_on_append() {
        let hub = LogHub::default();
        let task = id();
        let gone = hub.subscribe(task);
        let _kept = hub.subscribe(task);
        drop(gone);

        hub.append(task, "x");
        assert_eq!(hub.listener_count(task), 1);
    }

    #[tokio::test]
    async fn replay_then_live_has_no_gap_or_duplicate() {
        let hub = Arc::new(LogHub::default());
        let task = id();
        for i in 0..50 {
            hub.append(task, &format!("{i}"));
        }

        let producer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 50..200 {
                    hub.append(task, &format!("{i}"));
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let (replay, mut listener) = hub.subscribe_with_replay(task);
        assert_eq!(replay.skipped, 0);
        let mut seen: Vec<String> = replay.lines;
        producer.await.unwrap();
        hub.close_all(task);
        while let Some(line) = listener.recv().await {
            seen.push(line);
        }

        // capacity 100 の購読者は後半を落としうるので、重複と欠落は先頭側で見る
        let nums: Vec<u32> = seen.iter().map(|s| s.parse().unwrap()).collect();
        assert!(nums.windows(2).all(|w| w[1] == w[0] + 1), "{nums:?}");
        assert_eq!(nums[0], 0);
    }

    #[test]
    fn close_all_is_idempotent_and_unsubscribe_cleans_up() {
        let hub = LogHub::default();
        let task = id();
        let listener = hub.subscribe(task);
        hub.unsubscribe(&listener);
        assert_eq!(hub.listener_count(task), 0);
        assert!(hub.snapshot(task).is_empty());

        hub.append(task, "x");
        hub.close_all(task);
        hub.close_all(task);
        assert!(hub.snapshot(task).is_empty());
    }
}
