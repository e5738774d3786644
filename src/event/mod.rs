//! Event bus for deployment lifecycle events.
//!
//! Every state change in a run fans out through [`EventBus`]: to inline
//! sinks (the log files, which must never lose events) and to queued
//! subscribers (interactive front-ends, which may fall behind and get an
//! overflow marker instead of unbounded buffering). All payloads pass
//! through secret redaction before they leave the bus.
//!
//! ## Event Categories
//!
//! - **Run events**: start/end of the whole deployment
//! - **Host events**: start/end of one host's pipeline
//! - **Task events**: lifecycle (start, progress, log, complete, failed,
//!   skipped) plus pre-install check results
//! - **Overflow**: synthetic marker injected for a lagging subscriber

pub mod redact;
pub mod sinks;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::checker::CheckResult;
use crate::config::LogLevel;
use crate::model::{TaskStats, TaskView};

pub use redact::Redactor;

/// Default bound on a subscriber's queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

// ============================================================================
// Events
// ============================================================================

/// All events published during a deployment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    /// First event of any run.
    RunStart {
        hosts: Vec<String>,
        total_tasks: usize,
    },

    /// Last event of any run.
    RunComplete { stats: TaskStats },

    /// A host pipeline began; precedes all of that host's task events.
    HostStart { host: String },

    /// A host pipeline finished; follows all of that host's task events.
    HostComplete { host: String, stats: TaskStats },

    /// A task moved to Running.
    TaskStart { task: TaskView },

    /// One pre-install check finished for a task.
    CheckCompleted { host: String, task_id: String, result: CheckResult },

    /// Install progress, 0..=100.
    TaskProgress { host: String, task_id: String, percent: u8 },

    /// One line of remote output attributed to a task.
    TaskLog {
        host: String,
        task_id: String,
        level: LogLevel,
        line: String,
    },

    /// Terminal: the task completed successfully.
    TaskCompleted { task: TaskView },

    /// Terminal: the task failed.
    TaskFailed { task: TaskView, error: String },

    /// Terminal: the task was skipped.
    TaskSkipped { task: TaskView, reason: String },

    /// Injected for a subscriber that fell behind; `dropped` aggregates all
    /// events lost since the previous marker.
    Overflow { dropped: u64 },
}

impl Event {
    /// Returns the event type name as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::RunStart { .. } => "run_start",
            Event::RunComplete { .. } => "run_complete",
            Event::HostStart { .. } => "host_start",
            Event::HostComplete { .. } => "host_complete",
            Event::TaskStart { .. } => "task_start",
            Event::CheckCompleted { .. } => "check_completed",
            Event::TaskProgress { .. } => "task_progress",
            Event::TaskLog { .. } => "task_log",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskFailed { .. } => "task_failed",
            Event::TaskSkipped { .. } => "task_skipped",
            Event::Overflow { .. } => "overflow",
        }
    }

    /// The host this event belongs to, if any. Per-host sinks route on this.
    pub fn host(&self) -> Option<&str> {
        match self {
            Event::HostStart { host }
            | Event::HostComplete { host, .. }
            | Event::CheckCompleted { host, .. }
            | Event::TaskProgress { host, .. }
            | Event::TaskLog { host, .. } => Some(host),
            Event::TaskStart { task }
            | Event::TaskCompleted { task }
            | Event::TaskFailed { task, .. }
            | Event::TaskSkipped { task, .. } => Some(&task.host),
            Event::RunStart { .. } | Event::RunComplete { .. } | Event::Overflow { .. } => None,
        }
    }

    /// One-line human-readable rendering for the file sinks.
    pub fn summary(&self) -> String {
        match self {
            Event::RunStart { hosts, total_tasks } => {
                format!("run started: {} tasks across {} hosts", total_tasks, hosts.len())
            }
            Event::RunComplete { stats } => format!(
                "run complete: {} ok, {} failed, {} skipped",
                stats.completed, stats.failed, stats.skipped
            ),
            Event::HostStart { host } => format!("[{host}] pipeline started"),
            Event::HostComplete { host, stats } => format!(
                "[{host}] pipeline finished: {} ok, {} failed, {} skipped",
                stats.completed, stats.failed, stats.skipped
            ),
            Event::TaskStart { task } => format!("[{}] {} started", task.host, task.id),
            Event::CheckCompleted { host, result, .. } => format!(
                "[{host}] check {}: {} ({})",
                result.check_name,
                if result.passed { "passed" } else { "failed" },
                result.message
            ),
            Event::TaskProgress { host, task_id, percent } => {
                format!("[{host}] {task_id} {percent}%")
            }
            Event::TaskLog { host, line, .. } => format!("[{host}] {line}"),
            Event::TaskCompleted { task } => format!("[{}] {} completed", task.host, task.id),
            Event::TaskFailed { task, error } => {
                format!("[{}] {} FAILED: {}", task.host, task.id, error)
            }
            Event::TaskSkipped { task, reason } => {
                format!("[{}] {} skipped: {}", task.host, task.id, reason)
            }
            Event::Overflow { dropped } => format!("<{dropped} events dropped>"),
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// An inline event consumer invoked synchronously on publish.
///
/// Sinks are lossless: every published event reaches every sink, in publish
/// order. Sink implementations must be fast and must not block on the
/// subscriber side of the bus.
pub trait EventSink: Send + Sync {
    fn write(&self, event: &Event);

    /// Flush buffered output; called once when the run ends.
    fn flush(&self) {}
}

// ============================================================================
// Subscribers
// ============================================================================

struct SubscriberState {
    queue: VecDeque<Event>,
    dropped: u64,
}

struct SubscriberShared {
    capacity: usize,
    state: Mutex<SubscriberState>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberShared {
    fn push(&self, event: Event) {
        let mut state = self.state.lock();
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            state.dropped += 1;
        }
        state.queue.push_back(event);
        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Receiving end of a bus subscription.
///
/// Dropping the subscription deregisters it; the publisher prunes dead
/// subscribers on the next publish.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Waits for the next event. An [`Event::Overflow`] marker is delivered
    /// before newer events whenever this subscriber lost events since the
    /// last receive. Returns `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if state.dropped > 0 {
                    let dropped = std::mem::take(&mut state.dropped);
                    return Some(Event::Overflow { dropped });
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if self.shared.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Event> {
        let mut state = self.shared.state.lock();
        if state.dropped > 0 {
            let dropped = std::mem::take(&mut state.dropped);
            return Some(Event::Overflow { dropped });
        }
        state.queue.pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// The bus
// ============================================================================

struct BusInner {
    redactor: Redactor,
    sinks: RwLock<Vec<Box<dyn EventSink>>>,
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    closed: AtomicBool,
}

/// Fan-out hub for deployment events. Cheap to clone; all clones publish to
/// the same sinks and subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            inner: Arc::new(BusInner {
                redactor,
                sinks: RwLock::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A bus with no redaction, for tests.
    pub fn unredacted() -> Self {
        Self::new(Redactor::new(Vec::new()))
    }

    /// Registers an inline sink. Sinks receive every event, lossless.
    pub fn add_sink(&self, sink: Box<dyn EventSink>) {
        self.inner.sinks.write().push(sink);
    }

    /// Registers a queued subscriber with the default capacity.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Registers a queued subscriber with an explicit queue bound.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            capacity: capacity.max(1),
            state: Mutex::new(SubscriberState {
                queue: VecDeque::new(),
                dropped: 0,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.inner.subscribers.lock().push(Arc::clone(&shared));
        Subscription { shared }
    }

    /// Publishes one event: redacts it, writes it to every sink, then
    /// enqueues it for every live subscriber. Never blocks on a slow
    /// subscriber; a full queue drops its oldest event instead.
    pub fn publish(&self, event: Event) {
        let event = self.inner.redactor.redact_event(event);

        for sink in self.inner.sinks.read().iter() {
            sink.write(&event);
        }

        let mut subs = self.inner.subscribers.lock();
        subs.retain(|s| !s.closed.load(Ordering::SeqCst));
        for sub in subs.iter() {
            sub.push(event.clone());
        }
    }

    /// Flushes sinks and wakes subscribers with end-of-stream.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for sink in self.inner.sinks.read().iter() {
            sink.flush();
        }
        for sub in self.inner.subscribers.lock().iter() {
            sub.close();
        }
    }
}
