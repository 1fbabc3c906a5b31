//! Substrate's orchestration engine: the Task Graph Engine, Worker Pool,
//! Router, Budget Enforcer, Git Worktree Manager, Adapter contract, Crash
//! Recovery Manager, and the Orchestrator Lifecycle that wires them
//! together. `substrate-cli` is the thin driver on top of this crate.

pub mod adapter;
pub mod budget;
pub mod error;
pub mod events;
pub mod graph;
pub mod orchestrator;
pub mod recovery;
pub mod router;
pub mod worker_pool;
pub mod worktree;

pub use error::{AdapterError, EngineError, GraphError, WorktreeError};
pub use events::{Event, EventBus, EventKind};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
