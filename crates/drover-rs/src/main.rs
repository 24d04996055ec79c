//! Operational surface for the orchestration engine.
//!
//! # Examples
//!
//! ```sh
//! # Queue work, then boot the driver loop
//! drover enqueue "bring up the staging server" --priority high
//! drover start
//!
//! # Inspect the queue and dead letters
//! drover status
//!
//! # Ask a running driver to finish in-flight cycles and exit
//! drover stop
//! ```
//!
//! Reads the model API key from the `DROVER_MODEL_KEY` environment variable.
//! Exit codes: 0 success, 1 generic failure, 2 detected state corruption.

use clap::{Parser, Subcommand};
use drover_rs::api::HttpModelClient;
use drover_rs::config::{OrchestratorConfig, request_stop};
use drover_rs::error::EngineError;
use drover_rs::events::LoggingHandler;
use drover_rs::orchestrator::Orchestrator;
use drover_rs::queue::{Priority, WorkSpec};
use drover_rs::tools::contract::{
    CapFuture, CommandOutput, FileCapability, ProcessCapability, ShellCapability,
};
use drover_rs::tools::CapabilitySet;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Durable autonomous task orchestration.
#[derive(Parser)]
#[command(name = "drover")]
struct Cli {
    /// Root directory for persisted state
    #[arg(long, default_value = ".drover")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the driver loop and process work until stopped
    Start {
        /// Chat completions endpoint for the model service
        #[arg(long, default_value = "https://openrouter.ai/api/v1/chat/completions")]
        endpoint: String,

        /// Model identifier
        #[arg(long, default_value = "z-ai/glm-5")]
        model: String,

        /// Default project scope
        #[arg(long, default_value = "default")]
        project: String,

        /// Subagent pool width
        #[arg(long, default_value_t = 3)]
        max_concurrent: usize,
    },
    /// Add a work item to the queue
    Enqueue {
        /// What to do
        description: String,

        /// Scheduling priority
        #[arg(long, default_value = "medium")]
        priority: String,

        /// Project scope
        #[arg(long, default_value = "default")]
        project: String,

        /// Item id(s) that must complete first
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Retry budget
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// Print queue counts and dead letters
    Status,
    /// Ask a running driver to finish in-flight cycles and exit
    Stop,
}

// ── Local capability adapters ──────────────────────────────────────
//
// The engine consumes capabilities only through the contracts in
// `drover_rs::tools`; these minimal local adapters exist so the binary is
// operable on its own. GUI control has no local adapter and is simply
// absent from the advertised contracts.

struct LocalShell;

impl ShellCapability for LocalShell {
    fn run(&self, command: &str) -> CapFuture<'_, CommandOutput> {
        let command = command.to_string();
        Box::pin(async move {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .output()
                .await
                .map_err(|e| EngineError::ToolExecution(format!("spawn failed: {e}")))?;
            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code().unwrap_or(-1),
            })
        })
    }
}

struct LocalFiles;

impl FileCapability for LocalFiles {
    fn read(&self, path: &str) -> CapFuture<'_, String> {
        let path = path.to_string();
        Box::pin(async move {
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| EngineError::ToolExecution(format!("read {path}: {e}")))
        })
    }

    fn write(&self, path: &str, content: &str) -> CapFuture<'_, ()> {
        let path = path.to_string();
        let content = content.to_string();
        Box::pin(async move {
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| EngineError::ToolExecution(format!("write {path}: {e}")))
        })
    }

    fn edit(&self, path: &str, old_text: &str, new_text: &str) -> CapFuture<'_, ()> {
        let path = path.to_string();
        let old_text = old_text.to_string();
        let new_text = new_text.to_string();
        Box::pin(async move {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| EngineError::ToolExecution(format!("read {path}: {e}")))?;
            if !content.contains(&old_text) {
                return Err(EngineError::ToolExecution(format!(
                    "old_text not found in {path}"
                )));
            }
            let updated = content.replacen(&old_text, &new_text, 1);
            tokio::fs::write(&path, updated)
                .await
                .map_err(|e| EngineError::ToolExecution(format!("write {path}: {e}")))
        })
    }
}

struct LocalProbe;

impl ProcessCapability for LocalProbe {
    fn list_processes(&self) -> CapFuture<'_, Vec<String>> {
        Box::pin(async {
            let mut procs = Vec::new();
            let mut entries = tokio::fs::read_dir("/proc")
                .await
                .map_err(|e| EngineError::ToolExecution(format!("read /proc: {e}")))?;
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit()))
                else {
                    continue;
                };
                if let Ok(comm) =
                    tokio::fs::read_to_string(format!("/proc/{pid}/comm")).await
                {
                    procs.push(comm.trim().to_string());
                }
            }
            Ok(procs)
        })
    }

    fn port_listening(&self, port: u16) -> CapFuture<'_, bool> {
        Box::pin(async move {
            Ok(
                tokio::net::TcpStream::connect(("127.0.0.1", port))
                    .await
                    .is_ok(),
            )
        })
    }
}

// ── Entry point ────────────────────────────────────────────────────

fn exit_code_for(err: &EngineError) -> i32 {
    if err.is_fatal_corruption() { 2 } else { 1 }
}

fn fail(err: EngineError) -> ! {
    eprintln!("error: {err}");
    process::exit(exit_code_for(&err));
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            endpoint,
            model,
            project,
            max_concurrent,
        } => {
            let api_key = match std::env::var("DROVER_MODEL_KEY") {
                Ok(key) => key,
                Err(_) => {
                    eprintln!("error: DROVER_MODEL_KEY not set");
                    process::exit(1);
                }
            };
            let client = match HttpModelClient::new(api_key, endpoint, model) {
                Ok(client) => client,
                Err(err) => fail(err),
            };

            let caps = CapabilitySet::new()
                .with_shell(Arc::new(LocalShell))
                .with_files(Arc::new(LocalFiles))
                .with_process(Arc::new(LocalProbe));

            let config = OrchestratorConfig::new(cli.data_dir)
                .with_project(project)
                .with_max_concurrent_subagents(max_concurrent);

            let engine = match Orchestrator::open(config, Arc::new(client), Arc::new(caps)) {
                Ok(engine) => Arc::new(engine.with_event_handler(Box::new(LoggingHandler))),
                Err(err) => fail(err),
            };

            let mut driver = {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.run().await })
            };

            let result = tokio::select! {
                result = &mut driver => result,
                _ = tokio::signal::ctrl_c() => {
                    // Graceful: the driver finishes its in-flight cycle.
                    engine.stop();
                    driver.await
                }
            };
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => fail(err),
                Err(e) => {
                    eprintln!("error: driver panicked: {e}");
                    process::exit(1);
                }
            }
        }

        Command::Enqueue {
            description,
            priority,
            project,
            depends_on,
            max_retries,
        } => {
            let priority: Priority = match priority.parse() {
                Ok(p) => p,
                Err(err) => fail(err),
            };

            let config = OrchestratorConfig::new(cli.data_dir);
            let queue = match drover_rs::queue::WorkQueue::open(
                config.queue_journal_path(),
                config.queue_backoff.clone(),
            ) {
                Ok(queue) => queue,
                Err(err) => fail(err),
            };

            let mut spec = WorkSpec::new(description)
                .with_priority(priority)
                .with_project(project)
                .with_max_retries(max_retries);
            for dep in depends_on {
                spec = spec.with_dependency(dep);
            }

            match queue.enqueue(spec) {
                Ok(id) => println!("{id}"),
                Err(err) => fail(err),
            }
        }

        Command::Status => {
            use drover_rs::queue::{WorkQueue, WorkStatus};

            let config = OrchestratorConfig::new(cli.data_dir);
            let path = config.queue_journal_path();
            let items = if path.exists() {
                match WorkQueue::load_snapshot(&path) {
                    Ok(items) => items,
                    Err(err) => fail(err),
                }
            } else {
                Vec::new()
            };

            let count = |status: WorkStatus| items.iter().filter(|i| i.status == status).count();
            println!(
                "queue: {} pending, {} assigned, {} running, {} completed, {} failed, {} cancelled",
                count(WorkStatus::Pending),
                count(WorkStatus::Assigned),
                count(WorkStatus::Running),
                count(WorkStatus::Completed),
                count(WorkStatus::Failed),
                count(WorkStatus::Cancelled),
            );
            for item in items.iter().filter(|i| i.status == WorkStatus::Failed) {
                let error = item.last_error.as_deref().unwrap_or("unknown");
                match item.lesson_ref.as_deref() {
                    Some(lesson) => println!("dead-letter {}: {error} (lesson {lesson})", item.id),
                    None => println!("dead-letter {}: {error}", item.id),
                }
            }
        }

        Command::Stop => {
            if let Err(e) = request_stop(&cli.data_dir) {
                eprintln!("error: cannot write stop marker: {e}");
                process::exit(1);
            }
            println!("stop requested");
        }
    }
}
