mod config;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use substrate_core::adapter::cli::CliAdapter;
use substrate_core::adapter::AdapterRegistry;
use substrate_core::events::{Event, EventKind};
use substrate_core::graph::{parse_path, validate};
use substrate_core::orchestrator::{Orchestrator, OrchestratorConfig};
use substrate_core::router::{Candidate, RoutingPolicy};
use substrate_db::queries::{self, signals::insert_signal};
use substrate_db::SignalKind;

use config::SubstrateConfig;

const EXIT_SYSTEM_ERROR: i32 = 1;
const EXIT_USAGE_ERROR: i32 = 2;
const EXIT_BUDGET_EXCEEDED: i32 = 3;
const EXIT_ALL_TASKS_FAILED: i32 = 4;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "substrate", about = "Reference driver for the Substrate orchestration core")]
struct Cli {
    /// Project root (defaults to SUBSTRATE_PROJECT_ROOT or the current directory)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a task graph file without persisting anything
    Validate {
        /// Path to the graph file (YAML or JSON)
        file: PathBuf,
    },
    /// Load a graph and run its session to completion or until paused
    Run {
        /// Path to the graph file (YAML or JSON)
        file: PathBuf,
        /// Session id to use (defaults to a generated UUID)
        #[arg(long)]
        session_id: Option<String>,
        /// Return as soon as the session is paused, rather than waiting for completion
        #[arg(long)]
        until_paused: bool,
    },
    /// Write a pause/resume/cancel signal row for a running session
    Signal {
        /// Session id to signal
        session_id: String,
        /// Which signal to send
        #[arg(value_enum)]
        kind: SignalArg,
    },
    /// Print a session's current status and task counts
    Status {
        /// Session id to inspect
        session_id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalArg {
    Pause,
    Resume,
    Cancel,
}

impl From<SignalArg> for SignalKind {
    fn from(value: SignalArg) -> Self {
        match value {
            SignalArg::Pause => SignalKind::Pause,
            SignalArg::Resume => SignalKind::Resume,
            SignalArg::Cancel => SignalKind::Cancel,
        }
    }
}

#[tokio::main]
async fn main() {
    config::init_logging();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            EXIT_SYSTEM_ERROR
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Validate { file } => cmd_validate(&file).await,
        Commands::Run { file, session_id, until_paused } => {
            cmd_run(cli.project_root.as_deref(), &file, session_id, until_paused).await
        }
        Commands::Signal { session_id, kind } => cmd_signal(cli.project_root.as_deref(), &session_id, kind).await,
        Commands::Status { session_id } => cmd_status(cli.project_root.as_deref(), &session_id).await,
    }
}

async fn cmd_validate(file: &PathBuf) -> Result<i32> {
    let doc = match parse_path(file, None).await {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("failed to parse graph file: {e}");
            return Ok(EXIT_USAGE_ERROR);
        }
    };

    let known_agents = collect_agents(&doc);
    match validate(&doc, &known_agents) {
        Ok(report) => {
            println!("graph is valid: {} task(s)", doc.tasks.len());
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            Ok(0)
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("error: {error}");
            }
            Ok(EXIT_USAGE_ERROR)
        }
    }
}

fn collect_agents(doc: &substrate_core::graph::GraphDocument) -> Vec<String> {
    doc.tasks
        .values()
        .filter_map(|t| t.agent.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect()
}

async fn cmd_run(
    project_root: Option<&std::path::Path>,
    file: &PathBuf,
    session_id: Option<String>,
    until_paused: bool,
) -> Result<i32> {
    let config = SubstrateConfig::resolve(project_root)?;
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let doc = parse_path(file, None).await.with_context(|| format!("failed to parse {}", file.display()))?;
    let mut agents = collect_agents(&doc);
    if agents.is_empty() {
        agents.push(config.default_agent.clone());
    }

    let mut registry = AdapterRegistry::new();
    let mut candidates = Vec::new();
    for agent in &agents {
        registry.register(CliAdapter::new(agent.clone(), agent.clone()));
        candidates.push(Candidate {
            agent: agent.clone(),
            subscription_enabled: false,
            api_enabled: true,
            model: None,
            rate_limit_tokens: None,
            rate_limit_window: None,
        });
    }

    let orchestrator_config = OrchestratorConfig {
        project_root: config.project_root.clone(),
        max_concurrency: config.max_concurrency,
        default_agent: config.default_agent.clone(),
        base_branch: doc.session.base_branch.clone().unwrap_or(config.base_branch.clone()),
        routing_policy: RoutingPolicy { candidates },
        budget: substrate_core::budget::BudgetConfig::default(),
    };

    let orchestrator = Orchestrator::initialize(orchestrator_config, registry).await?;

    let engine = Arc::clone(orchestrator.engine());
    let graph_ref = file.display().to_string();
    let summary = engine
        .load_graph(&session_id, &graph_ref, doc, &agents)
        .await
        .map_err(|errors| anyhow::anyhow!("graph failed validation: {errors:?}"))?;
    for warning in &summary.warnings {
        println!("warning: {warning}");
    }
    println!("session {session_id}: loaded {} task(s)", summary.task_count);

    let budget_exceeded = Arc::new(AtomicBool::new(false));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let tx = done_tx.clone();
    orchestrator.events().subscribe(EventKind::GraphComplete, move |event| {
        if let Event::GraphComplete(_) = event {
            let _ = tx.send(());
        }
    });
    let tx = done_tx.clone();
    let flag = Arc::clone(&budget_exceeded);
    orchestrator.events().subscribe(EventKind::SessionBudgetExceeded, move |event| {
        if let Event::SessionBudgetExceeded(_) = event {
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        }
    });

    engine.start_execution(&session_id).await?;
    orchestrator.start_signal_polling(session_id.clone());

    let mut pause_check = tokio::time::interval(std::time::Duration::from_millis(250));
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break RunOutcome::Interrupted,
            Some(()) = done_rx.recv() => break RunOutcome::Finished,
            _ = pause_check.tick() => {
                if until_paused && engine.is_paused().await {
                    break RunOutcome::Paused;
                }
            }
        }
    };

    let exit_code = match outcome {
        RunOutcome::Interrupted => {
            orchestrator.shutdown("interrupted".to_string(), Some(session_id.clone())).await?;
            EXIT_INTERRUPTED
        }
        RunOutcome::Paused => {
            println!("session {session_id} paused");
            0
        }
        RunOutcome::Finished => {
            let session = queries::sessions::get_session(orchestrator.pool(), &session_id)
                .await?
                .context("session vanished after completion")?;
            orchestrator.shutdown("run complete".to_string(), None).await?;

            match session.status {
                substrate_db::SessionStatus::Completed => 0,
                substrate_db::SessionStatus::Cancelled => 0,
                substrate_db::SessionStatus::Failed if budget_exceeded.load(Ordering::SeqCst) => EXIT_BUDGET_EXCEEDED,
                substrate_db::SessionStatus::Failed => EXIT_ALL_TASKS_FAILED,
                _ => EXIT_SYSTEM_ERROR,
            }
        }
    };

    Ok(exit_code)
}

enum RunOutcome {
    Interrupted,
    Paused,
    Finished,
}

async fn cmd_signal(project_root: Option<&std::path::Path>, session_id: &str, kind: SignalArg) -> Result<i32> {
    let config = SubstrateConfig::resolve(project_root)?;
    let pool = substrate_db::pool::create_pool(&config.db_config).await?;
    insert_signal(&pool, session_id, kind.into()).await?;
    println!("signal sent to session {session_id}");
    Ok(0)
}

async fn cmd_status(project_root: Option<&std::path::Path>, session_id: &str) -> Result<i32> {
    let config = SubstrateConfig::resolve(project_root)?;
    let pool = substrate_db::pool::create_pool(&config.db_config).await?;

    let session = match queries::sessions::get_session(&pool, session_id).await? {
        Some(s) => s,
        None => {
            eprintln!("no such session: {session_id}");
            return Ok(EXIT_USAGE_ERROR);
        }
    };
    let progress = queries::tasks::get_session_progress(&pool, session_id).await?;

    println!("session {session_id} ({}): {:?}", session.name, session.status);
    println!(
        "  pending={} ready={} running={} completed={} failed={} cancelled={} total={}",
        progress.pending,
        progress.ready,
        progress.running,
        progress.completed,
        progress.failed,
        progress.cancelled,
        progress.total
    );
    println!("  cost_usd={:.4} budget_usd={:?}", session.cost_usd, session.budget_usd);

    Ok(0)
}
