//! In-process typed publish/subscribe hub.
//!
//! No persistence, no back-pressure: `emit` delivers synchronously to every
//! handler registered for that event kind, in registration order. A handler
//! that panics or returns an error is isolated -- it is logged and delivery
//! continues to the remaining handlers. This is the only channel through
//! which components are allowed to react to each other; nothing shares
//! mutable memory across component boundaries.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

/// The event catalogue. Each variant carries the structured payload named in
/// the design; `kind()` maps a variant back to the name used for
/// `subscribe`/logging.
#[derive(Debug, Clone)]
pub enum Event {
    TaskReady(TaskReady),
    TaskRunning(TaskRunning),
    TaskProgress(TaskProgress),
    TaskComplete(TaskComplete),
    TaskFailed(TaskFailed),
    TaskCancelled(TaskCancelled),
    WorkerSpawned(WorkerSpawned),
    WorkerTerminated(WorkerTerminated),
    WorktreeCreated(WorktreeCreated),
    WorktreeMerged(WorktreeMerged),
    WorktreeConflict(WorktreeConflict),
    WorktreeRemoved(WorktreeRemoved),
    GraphLoaded(GraphLoaded),
    GraphComplete(GraphComplete),
    BudgetWarningTask(BudgetWarningTask),
    BudgetExceededTask(BudgetExceededTask),
    BudgetWarningSession(BudgetWarningSession),
    SessionBudgetExceeded(SessionBudgetExceeded),
    OrchestratorReady(OrchestratorReady),
    OrchestratorShutdown(OrchestratorShutdown),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskReady,
    TaskRunning,
    TaskProgress,
    TaskComplete,
    TaskFailed,
    TaskCancelled,
    WorkerSpawned,
    WorkerTerminated,
    WorktreeCreated,
    WorktreeMerged,
    WorktreeConflict,
    WorktreeRemoved,
    GraphLoaded,
    GraphComplete,
    BudgetWarningTask,
    BudgetExceededTask,
    BudgetWarningSession,
    SessionBudgetExceeded,
    OrchestratorReady,
    OrchestratorShutdown,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::TaskReady => "task:ready",
            EventKind::TaskRunning => "task:running",
            EventKind::TaskProgress => "task:progress",
            EventKind::TaskComplete => "task:complete",
            EventKind::TaskFailed => "task:failed",
            EventKind::TaskCancelled => "task:cancelled",
            EventKind::WorkerSpawned => "worker:spawned",
            EventKind::WorkerTerminated => "worker:terminated",
            EventKind::WorktreeCreated => "worktree:created",
            EventKind::WorktreeMerged => "worktree:merged",
            EventKind::WorktreeConflict => "worktree:conflict",
            EventKind::WorktreeRemoved => "worktree:removed",
            EventKind::GraphLoaded => "graph:loaded",
            EventKind::GraphComplete => "graph:complete",
            EventKind::BudgetWarningTask => "budget:warning:task",
            EventKind::BudgetExceededTask => "budget:exceeded:task",
            EventKind::BudgetWarningSession => "budget:warning:session",
            EventKind::SessionBudgetExceeded => "session:budget:exceeded",
            EventKind::OrchestratorReady => "orchestrator:ready",
            EventKind::OrchestratorShutdown => "orchestrator:shutdown",
        };
        f.write_str(s)
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TaskReady(_) => EventKind::TaskReady,
            Event::TaskRunning(_) => EventKind::TaskRunning,
            Event::TaskProgress(_) => EventKind::TaskProgress,
            Event::TaskComplete(_) => EventKind::TaskComplete,
            Event::TaskFailed(_) => EventKind::TaskFailed,
            Event::TaskCancelled(_) => EventKind::TaskCancelled,
            Event::WorkerSpawned(_) => EventKind::WorkerSpawned,
            Event::WorkerTerminated(_) => EventKind::WorkerTerminated,
            Event::WorktreeCreated(_) => EventKind::WorktreeCreated,
            Event::WorktreeMerged(_) => EventKind::WorktreeMerged,
            Event::WorktreeConflict(_) => EventKind::WorktreeConflict,
            Event::WorktreeRemoved(_) => EventKind::WorktreeRemoved,
            Event::GraphLoaded(_) => EventKind::GraphLoaded,
            Event::GraphComplete(_) => EventKind::GraphComplete,
            Event::BudgetWarningTask(_) => EventKind::BudgetWarningTask,
            Event::BudgetExceededTask(_) => EventKind::BudgetExceededTask,
            Event::BudgetWarningSession(_) => EventKind::BudgetWarningSession,
            Event::SessionBudgetExceeded(_) => EventKind::SessionBudgetExceeded,
            Event::OrchestratorReady(_) => EventKind::OrchestratorReady,
            Event::OrchestratorShutdown(_) => EventKind::OrchestratorShutdown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskReady {
    pub session_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone)]
pub struct TaskRunning {
    pub session_id: String,
    pub task_id: String,
    pub worker_id: String,
}

#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub session_id: String,
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct TaskComplete {
    pub session_id: String,
    pub task_id: String,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct TaskFailed {
    pub session_id: String,
    pub task_id: String,
    pub error: String,
    pub will_retry: bool,
}

#[derive(Debug, Clone)]
pub struct TaskCancelled {
    pub session_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone)]
pub struct WorkerSpawned {
    pub session_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerTerminated {
    pub session_id: String,
    pub task_id: String,
    pub worker_id: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeCreated {
    pub session_id: String,
    pub task_id: String,
    pub path: String,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeMerged {
    pub session_id: String,
    pub task_id: String,
    pub target_branch: String,
    pub merged_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeConflict {
    pub session_id: String,
    pub task_id: String,
    pub target_branch: String,
    pub conflicting_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeRemoved {
    pub session_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone)]
pub struct GraphLoaded {
    pub session_id: String,
    pub task_count: usize,
}

#[derive(Debug, Clone)]
pub struct GraphComplete {
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct BudgetWarningTask {
    pub session_id: String,
    pub task_id: String,
    pub percentage_used: f64,
}

#[derive(Debug, Clone)]
pub struct BudgetExceededTask {
    pub session_id: String,
    pub task_id: String,
    pub cap_usd: f64,
    pub effective_cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct BudgetWarningSession {
    pub session_id: String,
    pub percentage_used: f64,
}

#[derive(Debug, Clone)]
pub struct SessionBudgetExceeded {
    pub session_id: String,
    pub cap_usd: f64,
    pub effective_cost_usd: f64,
    pub action: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorReady {
    pub session_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorShutdown {
    pub session_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Free-form extra detail some handlers want without a dedicated field --
/// e.g. routed through to the execution log's `data` column.
pub fn event_data(event: &Event) -> Option<Value> {
    serde_json::to_value(format!("{event:?}")).ok()
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A registered handler's id, returned by [`EventBus::subscribe`] so it can
/// later be passed to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

/// A registry keyed by event kind. One bus is shared (by `Arc`) across every
/// component for the lifetime of one orchestration run.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subs = self.subscribers.lock().expect("event bus mutex poisoned");
        let counts: HashMap<String, usize> = subs
            .handlers
            .iter()
            .map(|(k, v)| (k.to_string(), v.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a handler for `kind`. Returns an id usable with
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self.subscribers.lock().expect("event bus mutex poisoned");
        subs.handlers.entry(kind).or_default().push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    /// Remove a previously registered handler. No-op if already removed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        let mut subs = self.subscribers.lock().expect("event bus mutex poisoned");
        if let Some(list) = subs.handlers.get_mut(&kind) {
            list.retain(|(existing, _)| *existing != id.0);
        }
    }

    /// Deliver `event` synchronously to every handler currently registered
    /// for its kind, in registration order. A handler is run outside the
    /// subscriber lock (the handler list is cloned first) so re-entrant
    /// `subscribe`/`emit` calls from within a handler do not deadlock.
    pub fn emit(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.lock().expect("event bus mutex poisoned");
            subs.handlers
                .get(&kind)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                warn!(event = %kind, "event handler panicked; isolated, continuing delivery");
            }
        }
    }

    /// Number of handlers registered across all kinds, for tests/debugging.
    pub fn handler_count(&self) -> usize {
        let subs = self.subscribers.lock().expect("event bus mutex poisoned");
        subs.handlers.values().map(|v| v.len()).sum()
    }
}
