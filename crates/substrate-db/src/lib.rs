//! Durable store for substrate: a single-file SQLite database holding
//! sessions, tasks, dependency edges, the cost ledger, out-of-band
//! signals, and the execution log.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use models::{
    BillingMode, CostEntry, ExecutionLogEntry, Session, SessionSignal, SessionStatus,
    SignalKind, Task, TaskDependency, TaskStatus,
};
