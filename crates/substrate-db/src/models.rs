//! Row types and the enums stored as `TEXT` columns.
//!
//! Every status enum implements `Display`/`FromStr` plus `sqlx::Type` so
//! values round-trip through the `TEXT` columns declared in the migrations
//! without a separate mapping layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Interrupted,
    Cancelled,
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid session status: {0:?}")]
pub struct ParseSessionStatusError(String);

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = ParseSessionStatusError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "interrupted" => Ok(SessionStatus::Interrupted),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "abandoned" => Ok(SessionStatus::Abandoned),
            other => Err(ParseSessionStatusError(other.to_string())),
        }
    }
}

/// Status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid task status: {0:?}")]
pub struct ParseTaskStatusError(String);

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "ready" => Ok(TaskStatus::Ready),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(ParseTaskStatusError(other.to_string())),
        }
    }
}

impl TaskStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// How a dispatched task was billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    Subscription,
    Api,
    Free,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid billing mode: {0:?}")]
pub struct ParseBillingModeError(String);

impl fmt::Display for BillingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BillingMode::Subscription => "subscription",
            BillingMode::Api => "api",
            BillingMode::Free => "free",
        };
        f.write_str(s)
    }
}

impl FromStr for BillingMode {
    type Err = ParseBillingModeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(BillingMode::Subscription),
            "api" => Ok(BillingMode::Api),
            "free" => Ok(BillingMode::Free),
            other => Err(ParseBillingModeError(other.to_string())),
        }
    }
}

/// An out-of-band instruction left for the running orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid signal: {0:?}")]
pub struct ParseSignalKindError(String);

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Pause => "pause",
            SignalKind::Resume => "resume",
            SignalKind::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

impl FromStr for SignalKind {
    type Err = ParseSignalKindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(SignalKind::Pause),
            "resume" => Ok(SignalKind::Resume),
            "cancel" => Ok(SignalKind::Cancel),
            other => Err(ParseSignalKindError(other.to_string())),
        }
    }
}

/// One orchestration run over a task graph.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub graph_ref: String,
    pub status: SessionStatus,
    pub cost_usd: f64,
    pub planning_cost_usd: f64,
    pub budget_usd: Option<f64>,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of work belonging to one session.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Task {
    pub session_id: String,
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub budget_usd: Option<f64>,
    pub cost_usd: f64,
    pub worker_id: Option<String>,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub worktree_cleaned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A `depends_on` edge between two tasks in the same session.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize, Deserialize)]
pub struct TaskDependency {
    pub session_id: String,
    pub task_id: String,
    pub depends_on: String,
}

/// Immutable append-only cost ledger row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct CostEntry {
    pub id: i64,
    pub session_id: String,
    pub task_id: Option<String>,
    pub agent: String,
    pub billing_mode: BillingMode,
    pub estimated_cost_usd: f64,
    pub actual_cost_usd: Option<f64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub recorded_at: DateTime<Utc>,
}

impl CostEntry {
    /// The cost to use for budget arithmetic: actual when known, else
    /// estimated.
    pub fn effective_cost_usd(&self) -> f64 {
        self.actual_cost_usd.unwrap_or(self.estimated_cost_usd)
    }
}

/// An out-of-band instruction row awaiting the signal poller.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct SessionSignal {
    pub id: i64,
    pub session_id: String,
    pub signal: SignalKind,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record of an observable transition.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub session_id: String,
    pub task_id: Option<String>,
    pub event_kind: String,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub agent: Option<String>,
    pub cost_delta_usd: Option<f64>,
    pub data: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trips() {
        for s in [
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Interrupted,
            SessionStatus::Cancelled,
            SessionStatus::Abandoned,
        ] {
            let rendered = s.to_string();
            let parsed: SessionStatus = rendered.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn task_status_round_trips() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let rendered = s.to_string();
            let parsed: TaskStatus = rendered.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn task_status_terminal_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn billing_mode_round_trips() {
        for m in [BillingMode::Subscription, BillingMode::Api, BillingMode::Free] {
            assert_eq!(m.to_string().parse::<BillingMode>().unwrap(), m);
        }
    }

    #[test]
    fn signal_kind_round_trips() {
        for s in [SignalKind::Pause, SignalKind::Resume, SignalKind::Cancel] {
            assert_eq!(s.to_string().parse::<SignalKind>().unwrap(), s);
        }
    }

    #[test]
    fn rejects_unknown_status() {
        assert!("bogus".parse::<SessionStatus>().is_err());
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn cost_entry_prefers_actual_cost() {
        let entry = CostEntry {
            id: 1,
            session_id: "s".into(),
            task_id: Some("a".into()),
            agent: "claude-code".into(),
            billing_mode: BillingMode::Subscription,
            estimated_cost_usd: 1.0,
            actual_cost_usd: Some(0.5),
            input_tokens: 10,
            output_tokens: 20,
            recorded_at: Utc::now(),
        };
        assert_eq!(entry.effective_cost_usd(), 0.5);
    }

    #[test]
    fn cost_entry_falls_back_to_estimate() {
        let entry = CostEntry {
            id: 1,
            session_id: "s".into(),
            task_id: None,
            agent: "claude-code".into(),
            billing_mode: BillingMode::Api,
            estimated_cost_usd: 1.25,
            actual_cost_usd: None,
            input_tokens: 0,
            output_tokens: 0,
            recorded_at: Utc::now(),
        };
        assert_eq!(entry.effective_cost_usd(), 1.25);
    }
}
