//! A generic line-delimited-JSON subprocess adapter.
//!
//! Grounded in the lineage orchestrator's Claude Code adapter: agents are
//! expected to emit one JSON object per line of stdout. Unlike that
//! adapter, this one does not spawn or own the child process itself -- the
//! Worker Pool does that, using the command this adapter builds -- so
//! `parse_output` runs over already-collected stdout rather than a live
//! stream.
//!
//! Recognised line shapes:
//! - `{"type":"message","content":"..."}` -- appended to the accumulated
//!   output text.
//! - `{"type":"result","output":"...","cost_usd":0.01,"input_tokens":10,
//!   "output_tokens":5}` -- the final result; its `output` is appended, its
//!   cost and token counts become the parsed result's.
//! - `{"type":"error","message":"..."}` -- marks the run unsuccessful.
//!
//! Lines that are not valid JSON, or whose `type` is unrecognised, are
//! skipped rather than treated as a parse failure: agents are free to emit
//! diagnostic chatter on stdout alongside structured lines.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AdapterError;

use super::trait_def::Adapter;
use super::{AdapterTask, Capabilities, HealthCheck, ParsedOutput, SpawnCommand, TokenUsage, default_timeout_ms};

/// Adapter configuration: which binary to invoke and under what registered
/// id/display name. One `CliAdapter` instance models one agent integration.
pub struct CliAdapter {
    id: String,
    display_name: String,
    binary: String,
}

impl CliAdapter {
    pub fn new(id: impl Into<String>, binary: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            binary: binary.into(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

fn parse_line(line: &str, output: &mut String, tokens: &mut TokenUsage, saw_tokens: &mut bool) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let v: Value = serde_json::from_str(trimmed).ok()?;
    let line_type = v.get("type").and_then(Value::as_str).unwrap_or("");

    match line_type {
        "message" => {
            if let Some(content) = v.get("content").and_then(Value::as_str) {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(content);
            }
            None
        }
        "result" => {
            if let Some(content) = v.get("output").and_then(Value::as_str) {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(content);
            }
            if let Some(i) = v.get("input_tokens").and_then(Value::as_u64) {
                tokens.input_tokens += i;
                *saw_tokens = true;
            }
            if let Some(o) = v.get("output_tokens").and_then(Value::as_u64) {
                tokens.output_tokens += o;
                *saw_tokens = true;
            }
            None
        }
        "error" => Some(
            v.get("message")
                .and_then(Value::as_str)
                .unwrap_or("adapter reported an error")
                .to_string(),
        ),
        _ => None,
    }
}

#[async_trait]
impl Adapter for CliAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn adapter_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn health_check(&self) -> HealthCheck {
        match tokio::process::Command::new(&self.binary).arg("--version").output().await {
            Ok(output) if output.status.success() => HealthCheck {
                healthy: true,
                version: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
                cli_path: Some(self.binary.clone()),
                detected_billing_modes: vec![],
                supports_headless: true,
                error: None,
            },
            Ok(output) => HealthCheck {
                healthy: false,
                version: None,
                cli_path: Some(self.binary.clone()),
                detected_billing_modes: vec![],
                supports_headless: true,
                error: Some(format!("{} --version exited with {:?}", self.binary, output.status.code())),
            },
            Err(e) => HealthCheck {
                healthy: false,
                version: None,
                cli_path: Some(self.binary.clone()),
                detected_billing_modes: vec![],
                supports_headless: true,
                error: Some(format!("failed to run {}: {e}", self.binary)),
            },
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            billing_modes: vec![substrate_db::BillingMode::Api],
            supports_resume: false,
            max_turns: None,
        }
    }

    fn build_command(&self, task: &AdapterTask) -> Result<SpawnCommand, AdapterError> {
        if task.prompt.trim().is_empty() {
            return Err(AdapterError::CommandBuildFailed {
                adapter: self.id.clone(),
                task_id: task.task_id.clone(),
                reason: "task prompt is empty".into(),
            });
        }

        Ok(SpawnCommand {
            binary: self.binary.clone(),
            args: vec!["-p".to_string(), "--output-format".to_string(), "jsonl".to_string()],
            cwd: task.working_dir.clone(),
            env: task.env_vars.clone(),
            stdin: Some(task.prompt.clone()),
            timeout_ms: default_timeout_ms(&task.task_type),
        })
    }

    fn parse_output(&self, stdout: &str, exit_code: i32) -> ParsedOutput {
        let mut output = String::new();
        let mut tokens = TokenUsage::default();
        let mut saw_tokens = false;
        let mut error = None;

        for line in stdout.lines() {
            if let Some(e) = parse_line(line, &mut output, &mut tokens, &mut saw_tokens) {
                error = Some(e);
            }
        }

        let success = exit_code == 0 && error.is_none();

        ParsedOutput {
            success,
            output,
            exit_code,
            tokens: if saw_tokens { Some(tokens) } else { None },
            actual_cost_usd: None,
            error,
        }
    }

    fn estimate_tokens(&self, prompt: &str) -> u64 {
        (prompt.len() as u64).div_ceil(4)
    }
}
