//! Domain error enums for the component boundaries that need to match on a
//! failure kind to decide retry/escalate behavior. Everything else
//! propagates as `anyhow::Result` with `.context(..)`.

use thiserror::Error;

/// Errors from ingesting and validating a task graph document.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to parse graph document: {0}")]
    ParseError(String),
    #[error("unsupported graph version: {0:?}")]
    UnsupportedVersion(String),
    #[error("task {task:?} has no prompt")]
    EmptyPrompt { task: String },
    #[error("session name must not be empty")]
    EmptySessionName,
    #[error("graph has no tasks")]
    NoTasks,
    #[error("task {referrer:?} depends on unknown task {dependency:?}")]
    UnknownDependency { referrer: String, dependency: String },
    #[error("task {task:?} depends on itself")]
    SelfDependency { task: String },
    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),
    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),
}

/// Errors from worktree creation, cleanup, and merge simulation.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("{0:?} is not a git repository (no .git directory found)")]
    NotAGitRepo(std::path::PathBuf),
    #[error("git executable not found or too old: {0}")]
    UnsupportedGitVersion(String),
    #[error("failed to run git command: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {command} exited with code {code:?}: {stderr}")]
    GitExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("worktree for task {task_id:?} already exists at a different path than expected")]
    BranchMismatch { task_id: String },
    #[error("failed to parse git output: {0}")]
    ParseError(String),
}

/// Errors from the Task Graph Engine's runtime state machine (as opposed to
/// ingestion, which uses [`GraphError`]).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task {task_id:?} not found in session {session_id:?}")]
    TaskNotFound { session_id: String, task_id: String },
    #[error("invalid transition for task {task_id:?}: {from} -> {to}")]
    InvalidTransition { task_id: String, from: String, to: String },
    #[error("task {task_id:?} was modified concurrently; retry")]
    ConcurrentModification { task_id: String },
    #[error("session {session_id:?} not found")]
    SessionNotFound { session_id: String },
}

/// Errors from adapter health checks and command construction.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter {adapter:?} is unhealthy: {reason}")]
    Unhealthy { adapter: String, reason: String },
    #[error("adapter {adapter:?} failed to build a command for task {task_id:?}: {reason}")]
    CommandBuildFailed { adapter: String, task_id: String, reason: String },
    #[error("adapter {adapter:?} produced output that could not be parsed: {reason}")]
    MalformedOutput { adapter: String, reason: String },
    #[error("no adapter named {0:?} is registered")]
    NotRegistered(String),
}
