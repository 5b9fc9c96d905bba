//! dflow - run DAG task workflows.
//!
//! Usage:
//!   dflow run <file>                 Run a workflow definition
//!   dflow resume --id <id>           Resume a run from its checkpoint
//!   dflow status --id <id>           Show a run and its task results
//!   dflow list                       List known runs
//!   dflow cancel --id <id>           Ask a running workflow to stop
//!   dflow validate <file>            Check a definition and print its layers

use clap::{Parser, Subcommand};
use dagflow::{
    CheckpointStore, EngineConfig, Event, EventBus, EventHandler, EventStreamWriter,
    FileAppendLog, InMemoryCheckpointStore, Orchestrator, RunId, RunOptions, RunReport, RunStatus,
    TaskId, Workflow, YamlLoader, load_workflow, open_store,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// dflow - a DAG task-workflow engine
#[derive(Parser)]
#[command(name = "dflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (default: <state-dir>/dagflow.yaml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for checkpoints, logs and the event stream
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Maximum concurrently running tasks
    #[arg(short = 'j', long, global = true)]
    max_parallel: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition
    Run {
        /// Path to the workflow YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Workflow id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Walk the graph without running any command
        #[arg(long)]
        dry_run: bool,

        /// Discard any existing checkpoint for the id
        #[arg(long)]
        force: bool,

        /// Run only this task and its dependencies
        #[arg(long, value_name = "NAME")]
        task: Option<String>,
    },

    /// Resume a run from its checkpoint
    Resume {
        /// Workflow id to resume
        #[arg(long)]
        id: String,

        /// Re-run this task and everything reachable from it
        #[arg(long, value_name = "NAME")]
        from_task: Option<String>,

        /// Workflow definition (default: the copy saved by `run`)
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Show a run and its task results
    Status {
        #[arg(long)]
        id: String,
    },

    /// List known runs
    List,

    /// Ask a running workflow to stop dispatching tasks
    Cancel {
        #[arg(long)]
        id: String,
    },

    /// Validate a workflow definition and print its readiness layers
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

/// Event handler that narrates lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::WorkflowStarted {
                run_id,
                workflow,
                total_tasks,
                resumed_tasks,
                ..
            } => {
                if *resumed_tasks > 0 {
                    info!(
                        "Workflow '{}' started (id: {}, {} task(s), {} already done)",
                        workflow, run_id, total_tasks, resumed_tasks
                    );
                } else {
                    info!(
                        "Workflow '{}' started (id: {}, {} task(s))",
                        workflow, run_id, total_tasks
                    );
                }
            }
            Event::TaskStarted {
                task_id, session, ..
            } => {
                info!("  Task '{}' started ({})", task_id, session);
            }
            Event::TaskRetrying {
                task_id,
                attempt,
                max_attempts,
                error,
                ..
            } => {
                warn!(
                    "  Task '{}' attempt {}/{} failed: {}",
                    task_id, attempt, max_attempts, error
                );
            }
            Event::TaskCompleted {
                task_id,
                status,
                exit_code,
                duration,
                ..
            } => {
                let exit_info = exit_code
                    .map(|c| format!(" (exit: {})", c))
                    .unwrap_or_default();
                info!("  Task '{}' {}{} in {:?}", task_id, status, exit_info, duration);
            }
            Event::TaskFailed {
                task_id,
                attempt,
                error,
                ..
            } => {
                error!("  Task '{}' failed after {} attempt(s): {}", task_id, attempt, error);
            }
            Event::WorkflowCompleted {
                run_id,
                status,
                completed,
                failed,
                duration,
                ..
            } => {
                if *status == RunStatus::Completed {
                    info!(
                        "Workflow {} completed in {:?} ({} task(s) done)",
                        run_id, duration, completed
                    );
                } else {
                    error!(
                        "Workflow {} {} after {:?} ({} done, {} failed)",
                        run_id, status, duration, completed, failed
                    );
                }
            }
            Event::WorkflowCancelled {
                run_id,
                completed,
                failed,
                ..
            } => {
                warn!(
                    "Workflow {} cancelled ({} done, {} failed)",
                    run_id, completed, failed
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> CliResult<ExitCode> {
    let config = load_engine_config(&cli)?;

    match cli.command {
        Commands::Run {
            file,
            id,
            dry_run,
            force,
            task,
        } => {
            let mut options = RunOptions::new().with_dry_run(dry_run).with_force(force);
            if let Some(id) = id {
                options = options.with_run_id(id);
            }
            if let Some(task) = task {
                options = options.with_only_task(task);
            }
            run_workflow(&config, &file, options).await
        }
        Commands::Resume {
            id,
            from_task,
            file,
        } => {
            let file = file.unwrap_or_else(|| definition_copy_path(&config, &RunId::new(&id)));
            let mut options = RunOptions::resume(id);
            if let Some(task) = from_task {
                options = options.with_from_task(task);
            }
            run_workflow(&config, &file, options).await
        }
        Commands::Status { id } => {
            show_status(&config, &RunId::new(id)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            list_runs(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cancel { id } => {
            let store = open_store(&config).await?;
            let run_id = RunId::new(id);
            store.request_cancel(&run_id).await?;
            println!("Cancellation requested for {}", run_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { file } => validate_workflow(&config, &file),
    }
}

/// Load the engine config and apply command-line overrides.
fn load_engine_config(cli: &Cli) -> CliResult<EngineConfig> {
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| EngineConfig::default().state_dir);

    let mut config = match &cli.config {
        Some(path) => YamlLoader::load_engine_config(path)?,
        None => {
            let default_path = state_dir.join("dagflow.yaml");
            if default_path.exists() {
                YamlLoader::load_engine_config(&default_path)?
            } else {
                EngineConfig::default()
            }
        }
    };

    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(max) = cli.max_parallel {
        config.max_parallel = max;
    }
    config.validate()?;
    Ok(config)
}

fn definition_copy_path(config: &EngineConfig, run_id: &RunId) -> PathBuf {
    config
        .state_dir
        .join("definitions")
        .join(format!("{}.yaml", run_id))
}

/// Create the run record, then save the definition it was started from.
///
/// Returns the options that drive the claimed run.
async fn claim_run(
    orchestrator: &Orchestrator,
    config: &EngineConfig,
    workflow: &Workflow,
    file: &Path,
    options: RunOptions,
) -> CliResult<RunOptions> {
    let run_id = orchestrator.init(workflow, &options).await?;
    save_definition(file, &definition_copy_path(config, &run_id)).await?;
    Ok(RunOptions {
        run_id: Some(run_id),
        resume: true,
        force: false,
        ..options
    })
}

async fn save_definition(source: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = dest.with_extension("yaml.tmp");
    tokio::fs::copy(source, &tmp).await?;
    tokio::fs::rename(&tmp, dest).await
}

/// Run or resume a workflow and map its final status to an exit code.
async fn run_workflow(
    config: &EngineConfig,
    file: &Path,
    mut options: RunOptions,
) -> CliResult<ExitCode> {
    let workflow = load_workflow(file, config)?;

    // Dry runs never touch resumable state.
    let store: Arc<dyn CheckpointStore> = if options.dry_run {
        Arc::new(InMemoryCheckpointStore::new())
    } else {
        open_store(config).await?
    };

    let events = Arc::new(EventBus::new());
    events.register(Arc::new(LoggingHandler)).await;
    events
        .register(Arc::new(EventStreamWriter::new(Arc::new(
            FileAppendLog::new(config.event_log_path()),
        ))))
        .await;

    let orchestrator = Orchestrator::from_config(config, store, events);

    if !options.dry_run && !options.resume {
        options = claim_run(&orchestrator, config, &workflow, file, options).await?;
    }

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for running tasks to finish");
            token.cancel();
        }
    });

    let report = orchestrator.run(&workflow, options).await?;
    print_report(&report);

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
}

fn print_report(report: &RunReport) {
    println!("Workflow {}: {}", report.run_id, report.status);
    let sections = [
        ("completed", &report.completed),
        ("skipped (already done)", &report.skipped),
        ("failed", &report.failed),
        ("handled by on_failure", &report.handled),
        ("blocked", &report.blocked),
        ("not triggered", &report.not_triggered),
    ];
    for (label, ids) in sections {
        if !ids.is_empty() {
            println!("  {}: {}", label, join_ids(ids));
        }
    }
}

async fn show_status(config: &EngineConfig, run_id: &RunId) -> CliResult<()> {
    let store = open_store(config).await?;
    let record = store.get_run(run_id).await?;

    println!("ID: {}", record.run_id);
    println!("  Workflow: {}", record.workflow_name);
    println!("  Status: {}", record.status);
    println!("  Created: {}", record.created_at.to_rfc3339());
    if let Some(started) = record.started_at {
        println!("  Started: {}", started.to_rfc3339());
    }
    if let Some(finished) = record.finished_at {
        println!("  Finished: {}", finished.to_rfc3339());
    }
    println!(
        "  Tasks: {} completed, {} failed",
        record.tasks_completed, record.tasks_failed
    );
    if let Some(err) = &record.error {
        println!("  Error: {}", err);
    }
    if store.cancel_requested(run_id).await? {
        println!("  Cancellation requested");
    }

    let results = store.list_task_results(run_id).await?;
    if !results.is_empty() {
        println!();
        for result in results {
            let exit_info = result
                .exit_code
                .map(|c| format!(", exit {}", c))
                .unwrap_or_default();
            println!(
                "  - {}: {} (attempt {}{}, {} ms)",
                result.task_id, result.status, result.attempt, exit_info, result.duration_ms
            );
            if let Some(err) = result.error {
                println!("      {}", err);
            }
        }
    }
    Ok(())
}

async fn list_runs(config: &EngineConfig) -> CliResult<()> {
    let store = open_store(config).await?;
    let runs = store.list_runs().await?;

    if runs.is_empty() {
        println!("No runs found in {}", config.state_dir.display());
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {}  {}  ({} completed, {} failed)",
            run.run_id, run.workflow_name, run.status, run.tasks_completed, run.tasks_failed
        );
    }
    Ok(())
}

/// Validate a definition without running it.
fn validate_workflow(config: &EngineConfig, file: &Path) -> CliResult<ExitCode> {
    let workflow = load_workflow(file, config)?;

    match workflow.validate().and_then(|_| workflow.graph().layers()) {
        Ok(layers) => {
            println!("Workflow '{}' is valid: {} task(s)", workflow.name(), workflow.len());
            for (i, layer) in layers.iter().enumerate() {
                println!("  layer {}: {}", i + 1, join_ids(layer));
            }
            for edge in workflow.graph().edges().iter().filter(|e| e.kind.is_soft()) {
                println!("  route: {} -> {} ({})", edge.from, edge.to, edge.kind);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
