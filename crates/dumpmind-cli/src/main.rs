//! dumpmind CLI - kernel crash reproduction.
//!
//! - `dumpmind run` - create one task and run it to completion
//! - `dumpmind batch` - run a list of tasks on a worker group
//! - `dumpmind ingest` - create a task from a syzbot crash report
//! - `dumpmind mount-and-inject` / `extract-artifacts` - the two image steps
//! - `dumpmind resolve-toolchain` / `paths` - inspect what a task would use

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use dumpmind_core::app::{
    DEFAULT_POLL_INTERVAL, OrchestratorBuilder, RunOutcome, TaskOrchestrator, WorkerGroup,
};
use dumpmind_core::cancel::CancelHandle;
use dumpmind_core::config::{DEFAULT_CONFIG_PATH, Settings};
use dumpmind_core::domain::{NO_CRASH_OBSERVED, Revision, Task, TaskId, TaskType};
use dumpmind_core::impls::{InMemoryTaskStore, LoopMounter};
use dumpmind_core::ports::TaskStore;
use dumpmind_core::report::CrashReport;
use dumpmind_core::toolchain::{CompilerId, ToolchainResolver};
use dumpmind_core::workspace::WorkspacePaths;

#[derive(Parser)]
#[command(name = "dumpmind")]
#[command(about = "Reproduce kernel crashes and collect their vmcores", version)]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the task image, then inject kernel headers and the reproducer
    MountAndInject { id: String, revision: String },

    /// Collect a vmcore and the console log after the triggering boot
    ExtractArtifacts { id: String, revision: String },

    /// Create a task and run it to completion; prints the final task as JSON
    Run {
        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        revision: String,

        /// gcc-<N>, gcc-default or clang-<N>
        #[arg(long)]
        toolchain: String,

        #[arg(long = "type", default_value = "get-vmcore")]
        task_type: TaskType,
    },

    /// Run every task listed in a JSON file on `workers` concurrent workers
    Batch { tasks: PathBuf },

    /// Create a task from a syzbot crash report (JSON) and print it
    Ingest {
        report: PathBuf,

        #[arg(long = "type", default_value = "get-vmcore")]
        task_type: TaskType,

        /// Fetch sources and run the task instead of only printing it
        #[arg(long)]
        run: bool,
    },

    /// Print the build environment for a compiler identifier
    ResolveToolchain {
        identifier: String,

        /// Treat the argument as a compiler description
        /// (`gcc (Debian 12.2.0-14) 12.2.0`)
        #[arg(long)]
        from_description: bool,
    },

    /// Print the workspace layout of a task
    Paths { id: String, revision: String },
}

/// One entry of a batch file.
#[derive(Debug, Deserialize)]
struct BatchEntry {
    id: Option<String>,
    #[serde(rename = "type", default = "default_task_type")]
    task_type: TaskType,
    revision: String,
    toolchain: String,
}

fn default_task_type() -> TaskType {
    TaskType::GetVmcore
}

#[derive(Serialize)]
struct ExtractReport<'a> {
    artifact_path: Option<&'a Path>,
    result: &'a str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::MountAndInject { id, revision } => {
            let orchestrator = orchestrator(&settings)?;
            let paths = orchestrator.paths(&parse_id(&id)?, &parse_revision(&revision)?);
            let cancel = cancel_on_ctrl_c();
            orchestrator
                .mount_and_inject(&paths, &cancel.signal())
                .await
                .context("mount-and-inject")?;
            info!(image = %paths.image_path.display(), "image ready for the triggering boot");
        }
        Commands::ExtractArtifacts { id, revision } => {
            let orchestrator = orchestrator(&settings)?;
            let paths = orchestrator.paths(&parse_id(&id)?, &parse_revision(&revision)?);
            let cancel = cancel_on_ctrl_c();
            let artifact = orchestrator
                .extract_artifacts(&paths, &cancel.signal())
                .await
                .context("extract-artifacts")?;
            let report = ExtractReport {
                artifact_path: artifact.as_ref().map(|a| a.path()),
                result: if artifact.is_some() {
                    "vmcore collected"
                } else {
                    NO_CRASH_OBSERVED
                },
            };
            print_json(&report)?;
        }
        Commands::Run {
            id,
            revision,
            toolchain,
            task_type,
        } => {
            let orchestrator = orchestrator(&settings)?;
            let revision = parse_revision(&revision)?;
            let task = match id {
                Some(id) => {
                    orchestrator
                        .create(parse_id(&id)?, task_type, revision, &toolchain)
                        .await?
                }
                None => orchestrator.submit(task_type, revision, &toolchain).await?,
            };
            print_json(&run_to_completion(&orchestrator, &task).await?)?;
        }
        Commands::Batch { tasks } => {
            let orchestrator = Arc::new(orchestrator(&settings)?);
            run_batch(orchestrator, &tasks, settings.workers).await?;
        }
        Commands::Ingest {
            report,
            task_type,
            run,
        } => {
            let orchestrator = orchestrator(&settings)?;
            let request = CrashReport::load(&report)?.to_request(task_type, &settings.sources)?;
            let task = orchestrator.create_request(request).await?;
            if run {
                print_json(&run_to_completion(&orchestrator, &task).await?)?;
            } else {
                print_json(&task)?;
            }
        }
        Commands::ResolveToolchain {
            identifier,
            from_description,
        } => {
            let identifier = if from_description {
                CompilerId::from_description(&identifier)?.to_string()
            } else {
                identifier
            };
            let resolver = ToolchainResolver::detect(settings.toolchains.clone());
            print_json(&resolver.resolve(&identifier)?)?;
        }
        Commands::Paths { id, revision } => {
            let paths = WorkspacePaths::new(
                &settings.workspace_root,
                &parse_id(&id)?,
                &parse_revision(&revision)?,
            );
            print_json(&paths)?;
        }
    }
    Ok(())
}

fn orchestrator(settings: &Settings) -> Result<TaskOrchestrator> {
    OrchestratorBuilder::from_settings(settings)
        .store(Arc::new(InMemoryTaskStore::new()))
        .mounter(Arc::new(LoopMounter::new()))
        .build()
        .context("building orchestrator")
}

/// Claim `task` on a fresh worker and run it; Ctrl-C cancels.
async fn run_to_completion(orchestrator: &TaskOrchestrator, task: &Task) -> Result<Task> {
    let worker = orchestrator.ids().generate_worker_id();
    let cancel = cancel_on_ctrl_c();
    match orchestrator.run(task.id(), &worker, &cancel.signal()).await? {
        RunOutcome::Finished(task) => Ok(task),
        RunOutcome::Conflict { status, .. } => bail!("task {} is already {status}", task.id()),
    }
}

async fn run_batch(orchestrator: Arc<TaskOrchestrator>, file: &Path, workers: usize) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let entries: Vec<BatchEntry> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let revision = parse_revision(&entry.revision)?;
        let task = match entry.id {
            Some(id) => {
                orchestrator
                    .create(parse_id(&id)?, entry.task_type, revision, &entry.toolchain)
                    .await?
            }
            None => {
                orchestrator
                    .submit(entry.task_type, revision, &entry.toolchain)
                    .await?
            }
        };
        ids.push(task.id().clone());
    }
    info!(tasks = ids.len(), workers, "starting batch");

    let group = WorkerGroup::spawn(workers, Arc::clone(&orchestrator), DEFAULT_POLL_INTERVAL);
    let store = Arc::clone(orchestrator.store());
    let interrupt = cancel_on_ctrl_c().signal();
    loop {
        tokio::select! {
            _ = interrupt.cancelled() => {
                group.abort();
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if store.counts_by_status().await?.is_drained() {
                    break;
                }
            }
        }
    }
    group.shutdown_and_join().await;

    let mut finished: Vec<Task> = Vec::with_capacity(ids.len());
    for id in &ids {
        finished.push(store.get(id).await?);
    }
    print_json(&finished)?;
    info!(counts = ?store.counts_by_status().await?, "batch finished");
    Ok(())
}

/// Cancel the returned handle on Ctrl-C. Mount sessions are released
/// before the command exits.
fn cancel_on_ctrl_c() -> Arc<CancelHandle> {
    let handle = Arc::new(CancelHandle::new());
    let h = Arc::clone(&handle);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            h.cancel();
        }
    });
    handle
}

fn parse_id(id: &str) -> Result<TaskId> {
    TaskId::parse(id).with_context(|| format!("invalid task id '{id}'"))
}

fn parse_revision(revision: &str) -> Result<Revision> {
    Revision::parse(revision).with_context(|| format!("invalid revision '{revision}'"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

