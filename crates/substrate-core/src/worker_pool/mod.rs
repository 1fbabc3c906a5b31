//! Worker Pool: bounded-concurrency supervisor over agent child processes.
//!
//! Consumes `task:ready`/the engine's current ready set, claims tasks,
//! waits for the Worktree Manager to provision an isolated directory, spawns
//! the adapter-built command, and reports completion back to the engine.
//! Each in-flight task gets an independent tokio task; a panic or error in
//! one never affects its siblings.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::timeout;
use tracing::{error, info, warn};

use substrate_db::queries::cost_entries::{self, NewCostEntry};
use substrate_db::queries::sessions;
use substrate_db::BillingMode;

use crate::adapter::{AdapterRegistry, AdapterTask};
use crate::budget::{BudgetEnforcer, BudgetVerdict};
use crate::events::{Event, EventBus, EventKind, WorkerSpawned, WorkerTerminated};
use crate::graph::GraphEngine;
use crate::router::{Router, RoutableTask};
use crate::worktree::WorktreeManager;

/// The grace period between a graceful termination signal and a force kill.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct WorkerPoolConfig {
    pub max_concurrency: usize,
    pub base_branch: String,
    pub default_agent: String,
}

struct Dispatched {
    task_id: String,
    session_id: String,
}

/// Bounds how many child processes run at once; excess claims block on the
/// semaphore until a slot frees.
pub struct WorkerPool {
    pool: SqlitePool,
    events: EventBus,
    engine: Arc<GraphEngine>,
    worktrees: Arc<WorktreeManager>,
    adapters: Arc<AdapterRegistry>,
    router: Arc<Router>,
    budget: Arc<BudgetEnforcer>,
    semaphore: Arc<Semaphore>,
    config: WorkerPoolConfig,
    inflight: Arc<AsyncMutex<HashMap<String, tokio_util::sync::CancellationToken>>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        events: EventBus,
        engine: Arc<GraphEngine>,
        worktrees: Arc<WorktreeManager>,
        adapters: Arc<AdapterRegistry>,
        router: Arc<Router>,
        budget: Arc<BudgetEnforcer>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            pool,
            events,
            engine,
            worktrees,
            adapters,
            router,
            budget,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            inflight: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Claim `task:ready` for `session_id`/`task_id` and run it to
    /// completion. Intended to be invoked from a `task:ready` subscriber;
    /// spawns its own tokio task so the caller (typically an event handler)
    /// never blocks on the child process.
    pub fn dispatch(self: &Arc<Self>, session_id: String, task_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_one(&session_id, &task_id).await {
                error!(session_id, task_id, error = %e, "worker pool failed to run task");
            }
        });
    }

    async fn run_one(&self, session_id: &str, task_id: &str) -> Result<()> {
        let permit = self.semaphore.clone().acquire_owned().await.context("semaphore closed")?;

        let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
        let task = substrate_db::queries::tasks::get_task(&self.pool, session_id, task_id)
            .await?
            .with_context(|| format!("task {task_id:?} vanished before dispatch"))?;

        // Compare-and-set pending -> running.
        self.engine.mark_task_running(session_id, task_id, &worker_id).await?;

        let cancel = tokio_util::sync::CancellationToken::new();
        {
            let mut inflight = self.inflight.lock().await;
            inflight.insert(task_id.to_string(), cancel.clone());
        }

        // `task:running` has been recorded; provision the worktree now and
        // wait for `worktree:created` before spawning, so the agent always
        // sees a clean isolated directory.
        let worktree_info = {
            let worktrees = Arc::clone(&self.worktrees);
            let session_id = session_id.to_string();
            let task_id_owned = task_id.to_string();
            let base_branch = self.config.base_branch.clone();
            tokio::task::spawn_blocking(move || {
                worktrees.create_worktree(&session_id, &task_id_owned, &base_branch)
            })
            .await
            .context("worktree creation task panicked")?
        };

        let worktree_info = match worktree_info {
            Ok(info) => info,
            Err(e) => {
                self.engine.mark_task_failed(session_id, task_id, &format!("worktree creation failed: {e}"), None).await?;
                drop(permit);
                self.inflight.lock().await.remove(task_id);
                return Ok(());
            }
        };
        substrate_db::queries::tasks::set_worktree(
            &self.pool,
            session_id,
            task_id,
            &worktree_info.path.display().to_string(),
            worktree_info.branch.as_deref().unwrap_or_default(),
        )
        .await?;

        let agent_name = task.agent.clone().unwrap_or_else(|| self.config.default_agent.clone());
        let adapter = match self.adapters.get(&agent_name) {
            Some(a) => a,
            None => {
                self.engine
                    .mark_task_failed(session_id, task_id, &format!("no adapter registered for agent {agent_name:?}"), None)
                    .await?;
                self.cleanup_task_worktree(session_id, task_id).await;
                drop(permit);
                self.inflight.lock().await.remove(task_id);
                return Ok(());
            }
        };

        let decision = self.router.route(&RoutableTask {
            pinned_agent: task.agent.clone(),
            estimated_tokens: adapter.estimate_tokens(&task.prompt),
        });

        let Some(decision) = decision else {
            self.engine.mark_task_failed(session_id, task_id, "router found no available agent", None).await?;
            self.cleanup_task_worktree(session_id, task_id).await;
            drop(permit);
            self.inflight.lock().await.remove(task_id);
            return Ok(());
        };

        let adapter_task = AdapterTask {
            task_id: task_id.to_string(),
            name: task.name.clone(),
            prompt: task.prompt.clone(),
            task_type: task.task_type.clone(),
            model: task.model.clone().or(decision.model.clone()),
            working_dir: worktree_info.path.clone(),
            env_vars: HashMap::new(),
        };

        let spawn_command = match adapter.build_command(&adapter_task) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.engine.mark_task_failed(session_id, task_id, &format!("failed to build spawn command: {e}"), None).await?;
                self.cleanup_task_worktree(session_id, task_id).await;
                drop(permit);
                self.inflight.lock().await.remove(task_id);
                return Ok(());
            }
        };

        self.events.emit(Event::WorkerSpawned(WorkerSpawned {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            worker_id: worker_id.clone(),
            pid: 0,
        }));

        let outcome = self
            .spawn_and_wait(&spawn_command, cancel.clone())
            .await;

        self.inflight.lock().await.remove(task_id);
        self.events.emit(Event::WorkerTerminated(WorkerTerminated {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            worker_id: worker_id.clone(),
        }));

        match outcome {
            ChildOutcome::Exited { stdout, exit_code } => {
                let parsed = adapter.parse_output(&stdout, exit_code);
                let cost_usd = parsed.actual_cost_usd.unwrap_or(0.0);

                cost_entries::insert_cost_entry(
                    &self.pool,
                    session_id,
                    &NewCostEntry {
                        task_id: Some(task_id),
                        agent: &agent_name,
                        billing_mode: decision.billing_mode,
                        estimated_cost_usd: decision.estimated_cost_usd.unwrap_or(0.0),
                        actual_cost_usd: parsed.actual_cost_usd,
                        input_tokens: parsed.tokens.map(|t| t.input_tokens as i64).unwrap_or(0),
                        output_tokens: parsed.tokens.map(|t| t.output_tokens as i64).unwrap_or(0),
                    },
                )
                .await?;
                sessions::accrue_session_cost(&self.pool, session_id, cost_usd, false).await?;

                if let Some(tokens) = parsed.tokens {
                    self.router.report_actual_tokens(&agent_name, tokens.input_tokens + tokens.output_tokens);
                }

                let task_verdict = self.budget.check_task_budget(session_id, task_id).await?;
                let session_verdict = self.budget.check_session_budget(session_id).await?;

                if task_verdict == BudgetVerdict::Terminate || session_verdict == BudgetVerdict::Terminate {
                    self.engine.mark_task_failed(session_id, task_id, "budget exceeded", None).await?;
                } else if parsed.success {
                    self.engine.mark_task_complete(session_id, task_id, &parsed.output, cost_usd).await?;
                } else {
                    let error = parsed.error.unwrap_or_else(|| "agent exited with failure".to_string());
                    self.engine.mark_task_failed(session_id, task_id, &error, Some(exit_code)).await?;
                }
            }
            ChildOutcome::TimedOut => {
                self.engine.mark_task_failed(session_id, task_id, "timed out", None).await?;
            }
            ChildOutcome::Cancelled => {
                self.engine.mark_task_cancelled(session_id, task_id).await?;
            }
            ChildOutcome::SpawnFailed(e) => {
                self.engine.mark_task_failed(session_id, task_id, &format!("failed to spawn agent process: {e}"), None).await?;
            }
        }

        self.cleanup_task_worktree(session_id, task_id).await;
        drop(permit);
        Ok(())
    }

    /// Remove the worktree and branch backing `task_id` and record the
    /// cleanup in the store. Swallows errors: a worktree that fails to clean
    /// up is reclaimed later by crash recovery, and must never block the
    /// task's own completion.
    async fn cleanup_task_worktree(&self, session_id: &str, task_id: &str) {
        let worktrees = Arc::clone(&self.worktrees);
        let session_id_owned = session_id.to_string();
        let task_id_owned = task_id.to_string();
        let cleaned = tokio::task::spawn_blocking(move || {
            worktrees.cleanup_worktree(&session_id_owned, &task_id_owned);
        })
        .await;

        if let Err(e) = cleaned {
            warn!(session_id, task_id, error = %e, "worktree cleanup task panicked");
            return;
        }

        if let Err(e) = substrate_db::queries::tasks::mark_worktree_cleaned(&self.pool, session_id, task_id).await {
            warn!(session_id, task_id, error = %e, "failed to record worktree cleanup");
        }
    }

    /// Request cancellation of an in-flight task; the running child is sent
    /// a graceful termination signal and force-killed after the grace
    /// period.
    pub async fn cancel(&self, task_id: &str) {
        if let Some(token) = self.inflight.lock().await.get(task_id) {
            token.cancel();
        }
    }

    async fn spawn_and_wait(&self, spawn: &crate::adapter::SpawnCommand, cancel: tokio_util::sync::CancellationToken) -> ChildOutcome {
        let mut command = Command::new(&spawn.binary);
        command
            .args(&spawn.args)
            .current_dir(&spawn.cwd)
            .envs(&spawn.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => return ChildOutcome::SpawnFailed(e.to_string()),
        };
        let pid = child.id();

        if let Some(stdin_data) = &spawn.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(stdin_data.as_bytes()).await;
            }
        }

        let mut wait_handle = tokio::spawn(async move { child.wait_with_output().await });

        let timed_out_or_cancelled = tokio::select! {
            output = timeout(Duration::from_millis(spawn.timeout_ms), &mut wait_handle) => {
                match output {
                    Ok(Ok(Ok(output))) => {
                        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                        return ChildOutcome::Exited { stdout, exit_code: output.status.code().unwrap_or(-1) };
                    }
                    Ok(Ok(Err(e))) => return ChildOutcome::SpawnFailed(e.to_string()),
                    Ok(Err(join_err)) => return ChildOutcome::SpawnFailed(join_err.to_string()),
                    Err(_elapsed) => ChildOutcome::TimedOut,
                }
            }
            _ = cancel.cancelled() => ChildOutcome::Cancelled,
        };

        warn!(?pid, "sending graceful termination signal to child process");
        send_signal(pid, Signal::Term);

        match timeout(GRACE_PERIOD, &mut wait_handle).await {
            Ok(_) => {}
            Err(_elapsed) => {
                warn!(?pid, "child process survived grace period, force killing");
                send_signal(pid, Signal::Kill);
                let _ = wait_handle.await;
            }
        }

        timed_out_or_cancelled
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let raw = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: pid came from a child process we spawned and still track.
    let ret = unsafe { libc::kill(pid as i32, raw) };
    if ret != 0 {
        warn!(pid, "failed to deliver signal to child process");
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, _signal: Signal) {}

enum ChildOutcome {
    Exited { stdout: String, exit_code: i32 },
    TimedOut,
    Cancelled,
    SpawnFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use substrate_db::queries::sessions::insert_session;
    use substrate_db::queries::tasks::{insert_task, NewTask};
    use substrate_test_utils::temp_store;
    use tempfile::TempDir;

    use crate::adapter::{AdapterTask as AT, Capabilities, HealthCheck, ParsedOutput, SpawnCommand};
    use crate::error::AdapterError;

    struct EchoAdapter;

    #[async_trait]
    impl crate::adapter::Adapter for EchoAdapter {
        fn id(&self) -> &str {
            "echo"
        }
        fn display_name(&self) -> &str {
            "Echo"
        }
        fn adapter_version(&self) -> &str {
            "0.0.0"
        }
        async fn health_check(&self) -> HealthCheck {
            HealthCheck { healthy: true, version: None, cli_path: None, detected_billing_modes: vec![], supports_headless: true, error: None }
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        fn build_command(&self, task: &AT) -> Result<SpawnCommand, AdapterError> {
            Ok(SpawnCommand {
                binary: "true".to_string(),
                args: vec![],
                cwd: task.working_dir.clone(),
                env: Map::new(),
                stdin: None,
                timeout_ms: 5000,
            })
        }
        fn parse_output(&self, stdout: &str, exit_code: i32) -> ParsedOutput {
            ParsedOutput { success: exit_code == 0, output: stdout.to_string(), exit_code, tokens: None, actual_cost_usd: Some(0.01), error: None }
        }
        fn estimate_tokens(&self, prompt: &str) -> u64 {
            prompt.len() as u64
        }
    }

    fn init_repo() -> (TempDir, WorktreeManager, String) {
        let dir = TempDir::new().unwrap();
        std::process::Command::new("git").arg("init").arg("-q").current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git").args(["config", "user.name", "t"]).current_dir(dir.path()).status().unwrap();
        std::fs::write(dir.path().join("README.md"), "x").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(dir.path()).status().unwrap();
        std::process::Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir.path()).status().unwrap();
        let manager = WorktreeManager::new(dir.path(), EventBus::new()).unwrap();
        let branch_output = std::process::Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .output()
            .unwrap();
        let branch = String::from_utf8_lossy(&branch_output.stdout).trim().to_string();
        (dir, manager, branch)
    }

    #[tokio::test]
    async fn runs_a_task_through_to_completion() {
        let store = temp_store().await;
        let (_dir, worktrees, base_branch) = init_repo();
        let events = EventBus::new();

        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();
        insert_task(&store.pool, "s1", &NewTask { id: "a", name: "A", prompt: "go", task_type: "coding", agent: Some("echo"), model: None, budget_usd: None, max_retries: 0 }).await.unwrap();

        let mut registry = AdapterRegistry::new();
        registry.register(EchoAdapter);

        let engine = Arc::new(GraphEngine::new(store.pool.clone(), events.clone()));
        let router = Arc::new(Router::new(crate::router::RoutingPolicy {
            candidates: vec![crate::router::Candidate {
                agent: "echo".to_string(),
                subscription_enabled: false,
                api_enabled: true,
                model: None,
                rate_limit_tokens: None,
                rate_limit_window: None,
            }],
        }));
        let budget = Arc::new(BudgetEnforcer::new(store.pool.clone(), events.clone(), crate::budget::BudgetConfig::default()));

        let completed = Arc::new(AsyncMutex::new(false));
        let c = Arc::clone(&completed);
        events.subscribe(EventKind::TaskComplete, move |_| {
            *c.blocking_lock() = true;
        });

        let pool = Arc::new(WorkerPool::new(
            store.pool.clone(),
            events,
            engine,
            Arc::new(worktrees),
            Arc::new(registry),
            router,
            budget,
            WorkerPoolConfig { max_concurrency: 2, base_branch, default_agent: "echo".to_string() },
        ));

        pool.run_one("s1", "a").await.unwrap();

        let task = substrate_db::queries::tasks::get_task(&store.pool, "s1", "a").await.unwrap().unwrap();
        assert_eq!(task.status, substrate_db::TaskStatus::Completed);
        assert!(*completed.lock().await);

        let session = substrate_db::queries::sessions::get_session(&store.pool, "s1").await.unwrap().unwrap();
        assert_eq!(session.cost_usd, 0.01);

        let worktree_path = task.worktree_path.expect("worktree path recorded before cleanup");
        assert!(!std::path::Path::new(&worktree_path).exists(), "completed task's worktree should be removed");
        assert!(task.worktree_cleaned_at.is_some());
    }

    struct SleepAdapter;

    #[async_trait]
    impl crate::adapter::Adapter for SleepAdapter {
        fn id(&self) -> &str {
            "sleeper"
        }
        fn display_name(&self) -> &str {
            "Sleeper"
        }
        fn adapter_version(&self) -> &str {
            "0.0.0"
        }
        async fn health_check(&self) -> HealthCheck {
            HealthCheck { healthy: true, version: None, cli_path: None, detected_billing_modes: vec![], supports_headless: true, error: None }
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        fn build_command(&self, task: &AT) -> Result<SpawnCommand, AdapterError> {
            Ok(SpawnCommand {
                binary: "sleep".to_string(),
                args: vec!["3600".to_string()],
                cwd: task.working_dir.clone(),
                env: Map::new(),
                stdin: None,
                timeout_ms: 100,
            })
        }
        fn parse_output(&self, stdout: &str, exit_code: i32) -> ParsedOutput {
            ParsedOutput { success: exit_code == 0, output: stdout.to_string(), exit_code, tokens: None, actual_cost_usd: Some(0.0), error: None }
        }
        fn estimate_tokens(&self, prompt: &str) -> u64 {
            prompt.len() as u64
        }
    }

    #[tokio::test]
    async fn a_timed_out_child_is_force_killed() {
        let store = temp_store().await;
        let (_dir, worktrees, base_branch) = init_repo();
        let events = EventBus::new();

        insert_session(&store.pool, "s1", "demo", "g", None, "main").await.unwrap();
        insert_task(&store.pool, "s1", &NewTask { id: "a", name: "A", prompt: "go", task_type: "coding", agent: Some("sleeper"), model: None, budget_usd: None, max_retries: 0 }).await.unwrap();

        let mut registry = AdapterRegistry::new();
        registry.register(SleepAdapter);

        let engine = Arc::new(GraphEngine::new(store.pool.clone(), events.clone()));
        let router = Arc::new(Router::new(crate::router::RoutingPolicy {
            candidates: vec![crate::router::Candidate {
                agent: "sleeper".to_string(),
                subscription_enabled: false,
                api_enabled: true,
                model: None,
                rate_limit_tokens: None,
                rate_limit_window: None,
            }],
        }));
        let budget = Arc::new(BudgetEnforcer::new(store.pool.clone(), events.clone(), crate::budget::BudgetConfig::default()));

        let pool = Arc::new(WorkerPool::new(
            store.pool.clone(),
            events,
            engine,
            Arc::new(worktrees),
            Arc::new(registry),
            router,
            budget,
            WorkerPoolConfig { max_concurrency: 2, base_branch, default_agent: "sleeper".to_string() },
        ));

        pool.run_one("s1", "a").await.unwrap();

        let task = substrate_db::queries::tasks::get_task(&store.pool, "s1", "a").await.unwrap().unwrap();
        assert_eq!(task.status, substrate_db::TaskStatus::Failed);

        let worktree_path = task.worktree_path.expect("worktree path recorded before cleanup");
        assert!(!std::path::Path::new(&worktree_path).exists(), "timed-out task's worktree should be removed");
        assert!(task.worktree_cleaned_at.is_some());
    }
}
