//! The Adapter contract: the orchestration core's only real point of
//! polymorphism. Agent integrations live outside this crate; this module
//! declares the interface they implement, a registry for looking them up by
//! id, and one concrete reference adapter ([`cli::CliAdapter`]) used by
//! tests and as a worked example.

pub mod cli;
pub mod registry;
pub mod trait_def;

pub use registry::AdapterRegistry;
pub use trait_def::Adapter;

use std::collections::HashMap;
use std::path::PathBuf;

/// Everything an adapter needs to build a spawn command for one task.
#[derive(Debug, Clone)]
pub struct AdapterTask {
    pub task_id: String,
    pub name: String,
    pub prompt: String,
    pub task_type: String,
    pub model: Option<String>,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
}

/// Result of `healthCheck()`.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub healthy: bool,
    pub version: Option<String>,
    pub cli_path: Option<String>,
    pub detected_billing_modes: Vec<substrate_db::BillingMode>,
    pub supports_headless: bool,
    pub error: Option<String>,
}

/// Static capability description, used by the Router's soft checks and by
/// operators inspecting what an agent can do.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub billing_modes: Vec<substrate_db::BillingMode>,
    pub supports_resume: bool,
    pub max_turns: Option<u32>,
}

/// The command the Worker Pool should spawn for a task, as built by
/// `buildCommand`.
#[derive(Debug, Clone)]
pub struct SpawnCommand {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
    pub timeout_ms: u64,
}

/// Token counts reported or estimated for one task run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The result of `parseOutput(stdout, exitCode)`.
#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
    pub tokens: Option<TokenUsage>,
    pub actual_cost_usd: Option<f64>,
    pub error: Option<String>,
}

/// Default per-task-type timeout, in milliseconds, used by adapters that
/// don't have a more specific policy. Mirrors the type tags named in the
/// data model (`coding`, `testing`, `debugging`, `refactoring`, `docs`).
pub fn default_timeout_ms(task_type: &str) -> u64 {
    match task_type {
        "testing" => 15 * 60 * 1000,
        "debugging" => 20 * 60 * 1000,
        "docs" => 5 * 60 * 1000,
        _ => 10 * 60 * 1000,
    }
}
