//! `handoff`: submit, batch, resume and inspect tasks from the command line.
//!
//! Exit codes: 0 completed, 2 aborted, 3 failed, 1 usage/config/IO errors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tower::util::BoxCloneSyncService;
use tracing::{error, info};

use tower_handoff::concurrency::WorkerPool;
use tower_handoff::config::{self, OrchestratorConfig};
use tower_handoff::observability::{init_tracing, noop_sink};
use tower_handoff::registry::RegistryBuilder;
use tower_handoff::{
    CancellationToken, CapabilityRegistry, DescriptorFile, FileSessionStore, HandoffError, InMemorySessionStore,
    JsonLinesChainSink, Orchestrator, Result, RunReport, SessionState, SessionStatus,
    SessionStore, SqliteSessionStore, Task, TaskId,
};

#[derive(Parser, Debug)]
#[command(name = "handoff", version, about = "Route tasks through cooperating handlers")]
struct Cli {
    /// Orchestrator config file (TOML); HANDOFF_* variables override it
    #[arg(long, global = true, env = "HANDOFF_CONFIG")]
    config: Option<PathBuf>,

    /// Session storage backend
    #[arg(long, global = true, value_enum, default_value = "file")]
    store: StoreKind,

    /// Database file for the sqlite store
    #[arg(long, global = true, default_value = "sessions.db")]
    database: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    File,
    Sqlite,
    Memory,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a task and print its result and chain
    Run(RunArgs),
    /// Submit every line of a file as a task, `worker_pool_size` at a time
    Batch(BatchArgs),
    /// Continue a persisted task
    Resume(ResumeArgs),
    /// Print a persisted session
    Show {
        #[arg(long)]
        task_id: String,
    },
    /// Validate a handler descriptor file
    Validate {
        #[arg(long)]
        registry: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Handler descriptor file (TOML)
    #[arg(long)]
    registry: PathBuf,

    /// Task text; parsed as JSON when it is a JSON object
    #[arg(long)]
    task: String,

    /// Use this task id instead of a generated one
    #[arg(long)]
    task_id: Option<String>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(long)]
    registry: PathBuf,

    /// One task per line; blank lines are skipped
    #[arg(long)]
    tasks: PathBuf,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    registry: PathBuf,

    #[arg(long)]
    task_id: String,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Print the full report as JSON
    #[arg(long)]
    json: bool,

    /// Append completed chains to this JSON-lines file
    #[arg(long)]
    chain_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "handoff failed");
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let cfg = load_config(cli.config.as_ref())?;
    match cli.command {
        Command::Validate { registry } => {
            let registry = load_registry(&registry)?;
            for d in registry.list() {
                let targets: Vec<&str> = d.transfer_targets.iter().map(|t| t.as_str()).collect();
                println!("{} -> [{}]", d.id, targets.join(", "));
            }
            println!("ok: {} handlers", registry.len());
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { task_id } => {
            let store = open_store(cli.store, &cli.database, &cfg).await?;
            let task_id = TaskId(task_id);
            let state = store
                .load(&task_id)
                .await?
                .ok_or_else(|| HandoffError::Session(format!("no session for task {}", task_id)))?;
            print_session(&state)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            let store = open_store(cli.store, &cli.database, &cfg).await?;
            let orchestrator = build(&args.registry, &cfg, store, &args.output)?;
            let payload = parse_payload(&args.task);
            let task = match args.task_id {
                Some(id) => Task::with_id(id, payload),
                None => Task::new(payload),
            };
            let report = orchestrator.submit(task).await?;
            print_report(&report, args.output.json)?;
            Ok(exit_code(report.status))
        }
        Command::Batch(args) => {
            let store = open_store(cli.store, &cli.database, &cfg).await?;
            let orchestrator = build(&args.registry, &cfg, store, &args.output)?;
            let contents = std::fs::read_to_string(&args.tasks)?;
            let tasks: Vec<Task> = contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| Task::new(parse_payload(l)))
                .collect();
            info!(tasks = tasks.len(), workers = cfg.worker_pool_size, "running batch");
            let pool = WorkerPool::from_config(orchestrator, &cfg);
            let mut worst = SessionStatus::Completed;
            for outcome in pool.run_all(tasks).await {
                match outcome {
                    Ok(report) => {
                        print_report(&report, args.output.json)?;
                        worst = worse(worst, report.status);
                    }
                    Err(e) => {
                        error!(error = %e, "task did not produce a report");
                        eprintln!("error: {}", e);
                        worst = worse(worst, SessionStatus::Failed);
                    }
                }
            }
            Ok(exit_code(worst))
        }
        Command::Resume(args) => {
            let store = open_store(cli.store, &cli.database, &cfg).await?;
            let orchestrator = build(&args.registry, &cfg, store, &args.output)?;
            let report = orchestrator
                .resume(&TaskId(args.task_id), CancellationToken::new())
                .await?;
            print_report(&report, args.output.json)?;
            Ok(exit_code(report.status))
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<OrchestratorConfig> {
    let mut cfg = match path {
        Some(p) => config::from_file(p)?,
        None => OrchestratorConfig::default(),
    };
    config::apply_env(&mut cfg, |k| std::env::var(k).ok());
    cfg.validate()?;
    Ok(cfg)
}

fn load_registry(path: &PathBuf) -> Result<CapabilityRegistry> {
    let file = DescriptorFile::load(path)?;
    RegistryBuilder::from_file(file)?.build()
}

async fn open_store(
    kind: StoreKind,
    database: &PathBuf,
    cfg: &OrchestratorConfig,
) -> Result<Arc<dyn SessionStore>> {
    Ok(match kind {
        StoreKind::File => Arc::new(FileSessionStore::new(&cfg.session_dir)?),
        StoreKind::Sqlite => Arc::new(SqliteSessionStore::new(database).await?),
        StoreKind::Memory => Arc::new(InMemorySessionStore::new()),
    })
}

fn build(
    registry: &PathBuf,
    cfg: &OrchestratorConfig,
    store: Arc<dyn SessionStore>,
    output: &OutputArgs,
) -> Result<Orchestrator> {
    let registry = load_registry(registry)?;
    let sink = match &output.chain_log {
        Some(path) => BoxCloneSyncService::new(JsonLinesChainSink::new(path)),
        None => noop_sink(),
    };
    Orchestrator::builder(registry)
        .config(cfg.clone())
        .store(store)
        .sink(sink)
        .build()
}

fn parse_payload(text: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(v @ serde_json::Value::Object(_)) => v,
        _ => serde_json::Value::String(text.to_string()),
    }
}

fn exit_code(status: SessionStatus) -> ExitCode {
    match status {
        SessionStatus::Completed => ExitCode::SUCCESS,
        SessionStatus::Aborted => ExitCode::from(2),
        SessionStatus::Failed => ExitCode::from(3),
        // run and resume only return terminal reports
        SessionStatus::Running => ExitCode::from(1),
    }
}

/// Failed outranks Aborted outranks Completed.
fn worse(a: SessionStatus, b: SessionStatus) -> SessionStatus {
    let rank = |s: SessionStatus| match s {
        SessionStatus::Failed => 2,
        SessionStatus::Aborted => 1,
        _ => 0,
    };
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("task:   {}", report.task_id);
    println!("status: {}", report.status);
    if let Some(result) = &report.result {
        match &result.summary {
            Some(summary) => println!("result: {}", summary),
            None => println!("result: {}", serde_json::to_string_pretty(&result.output)?),
        }
    }
    if let Some(err) = &report.last_error {
        println!("error:  {}", err.message);
    }
    let path = report.chain.path();
    let names: Vec<&str> = path.iter().map(|h| h.as_str()).collect();
    println!("chain:  {}", names.join(" -> "));
    for entry in report.chain.entries() {
        println!("  {} -> {}: {}", entry.from, entry.to, entry.reason);
    }
    Ok(())
}

fn print_session(state: &SessionState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}
