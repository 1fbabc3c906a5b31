//! Hand-written SQL query functions, grouped by table.
//!
//! `agent_events.rs`, `gate_results.rs`, and `invariants.rs` remain on disk
//! from the repo this crate was developed from but are intentionally not
//! declared here: the tables they query no longer exist in this schema.

pub mod cost_entries;
pub mod execution_log;
pub mod sessions;
pub mod signals;
pub mod tasks;
