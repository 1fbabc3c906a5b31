//! The `Adapter` trait itself: object-safe, so a single registry can hold a
//! heterogeneous set of agent integrations behind `Box<dyn Adapter>`.

use async_trait::async_trait;

use crate::error::AdapterError;

use super::{AdapterTask, Capabilities, HealthCheck, ParsedOutput, SpawnCommand};

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable machine-readable identifier, e.g. `"claude-code"`.
    fn id(&self) -> &str;

    /// Human-readable name for logs and status output.
    fn display_name(&self) -> &str;

    /// The adapter's own version string, independent of the underlying
    /// tool's version (reported separately in `HealthCheck::version`).
    fn adapter_version(&self) -> &str;

    /// Probe whether the underlying tool is installed and usable. Called at
    /// orchestrator initialize and surfaced as an Environment-kind error if
    /// unhealthy.
    async fn health_check(&self) -> HealthCheck;

    /// Static capability description.
    fn capabilities(&self) -> Capabilities;

    /// Build the command the Worker Pool should spawn for `task`. Pure and
    /// synchronous: no I/O, no process spawning here.
    fn build_command(&self, task: &AdapterTask) -> Result<SpawnCommand, AdapterError>;

    /// Parse a completed child process's stdout plus its exit code into a
    /// structured result. Never panics on malformed input: report it via
    /// `ParsedOutput::error` instead.
    fn parse_output(&self, stdout: &str, exit_code: i32) -> ParsedOutput;

    /// A cheap, approximate token estimate for a prompt, used by the Router
    /// to rate-limit before a real count is known.
    fn estimate_tokens(&self, prompt: &str) -> u64;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Adapter) {}
};
