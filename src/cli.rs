//! Command-line interface.
//!
//! `rollout run -c config.yml` is batch mode: it loads and validates the
//! configuration, confirms the plan, drives the deployment engine to
//! completion, and exits with 0 (all completed), 1 (configuration error),
//! 2 (every host unreachable), 3 (task failures), or 4 (cancelled).
//! Interactive front-ends attach through the library's subscriber API
//! instead of this binary.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use dialoguer::Confirm;
use tracing::warn;

use crate::checker::CheckerManager;
use crate::config::DeployConfig;
use crate::engine::{DeployEngine, RunContext, RunReport};
use crate::event::sinks::{HostLogSink, JsonlSink, MainLogSink};
use crate::event::{Event, EventBus, Redactor};
use crate::executor::AnsibleExecutor;
use crate::installer::InstallerRegistry;
use crate::model::{TaskSet, TaskStatus};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_CANCELLED: i32 = 4;

#[derive(Debug, Parser)]
#[command(name = "rollout", version, about = "Concurrent multi-node software provisioning")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a deployment from a configuration file.
    Run(RunArgs),
    /// Print a commented configuration template to stdout.
    GenerateConfig,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to the deployment configuration.
    #[arg(short = 'c', long)]
    config: PathBuf,

    /// Validate and check only; ask the runner for no-op mode.
    #[arg(long)]
    dry_run: bool,

    /// Restrict the run to the named hosts (repeatable).
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Restrict the run to the named packages (repeatable).
    #[arg(long = "software")]
    software: Vec<String>,

    /// Skip the interactive confirmation.
    #[arg(short = 'y', long)]
    yes: bool,

    /// Directory holding the installer playbooks.
    #[arg(long, default_value = "playbooks")]
    playbook_dir: PathBuf,
}

/// Runs the parsed command and returns the process exit code.
pub async fn execute(cli: Cli) -> i32 {
    match cli.command {
        Command::GenerateConfig => {
            print!("{}", DeployConfig::template());
            EXIT_OK
        }
        Command::Run(args) => run_deployment(args).await,
    }
}

async fn run_deployment(args: RunArgs) -> i32 {
    let config = match DeployConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            return EXIT_CONFIG;
        }
    };
    crate::logging::init(config.log.level);

    let (errors, warnings) = config.validate();
    for warning in &warnings {
        warn!("{warning}");
    }
    if !errors.is_empty() {
        eprintln!("{}", "configuration is invalid:".red().bold());
        for error in &errors {
            eprintln!("  - {error}");
        }
        return EXIT_CONFIG;
    }

    let config = match config.filtered(&args.nodes, &args.software) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            return EXIT_CONFIG;
        }
    };

    let tasks = TaskSet::build(&config);
    println!(
        "About to install {} package(s) across {} host(s){}",
        tasks.len(),
        config.nodes.len(),
        if args.dry_run { " (dry run)" } else { "" }
    );
    if !args.yes && !confirm_plan() {
        println!("aborted");
        return EXIT_CANCELLED;
    }

    match prepare_and_run(args, config, tasks).await {
        Ok(report) => {
            print_summary(&report);
            report.exit_code()
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            EXIT_CONFIG
        }
    }
}

fn confirm_plan() -> bool {
    Confirm::new()
        .with_prompt("Proceed?")
        .default(false)
        .interact()
        .unwrap_or(false)
}

async fn prepare_and_run(
    args: RunArgs,
    config: DeployConfig,
    tasks: TaskSet,
) -> crate::error::Result<RunReport> {
    let run_dir = config
        .general
        .data_dir
        .join("run")
        .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
    std::fs::create_dir_all(&run_dir)?;
    std::fs::create_dir_all(&config.log.dir)?;
    write_run_inventory(&run_dir, &config)?;

    let bus = EventBus::new(Redactor::new(config.secrets()));
    bus.add_sink(Box::new(MainLogSink::new(&config.log.dir)?));
    bus.add_sink(Box::new(HostLogSink::new(&config.log.dir)));
    bus.add_sink(Box::new(JsonlSink::new(&run_dir)));

    let exec = Arc::new(AnsibleExecutor::new(&args.playbook_dir, &run_dir)?);
    let ctx = RunContext::new(
        config.general.data_dir.clone(),
        run_dir,
        config.general.max_concurrent_nodes,
        args.dry_run,
        bus.clone(),
    );

    let engine = DeployEngine::new(
        ctx,
        tasks,
        Arc::new(CheckerManager::with_defaults()),
        Arc::new(InstallerRegistry::with_builtins()),
        exec,
    );

    // Ctrl-C requests cooperative cancellation; a second Ctrl-C kills us.
    let handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling, waiting for in-flight tasks...");
            handle.cancel();
        }
    });

    let mut subscription = engine.handle().subscribe();
    let reporter = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            print_event(&event);
        }
    });

    engine.start();
    let report = engine.wait().await;
    let _ = reporter.await;
    Ok(report)
}

/// Records the resolved host inventory for this run, with credentials
/// blanked; the record is for auditing, not for reconnecting.
fn write_run_inventory(
    run_dir: &std::path::Path,
    config: &DeployConfig,
) -> crate::error::Result<()> {
    let mut nodes = config.nodes.clone();
    for node in &mut nodes {
        node.owner_pass = node.owner_pass.as_ref().map(|_| "***".to_string());
        node.super_pass = node.super_pass.as_ref().map(|_| "***".to_string());
    }
    let text = serde_yaml::to_string(&nodes)?;
    std::fs::write(run_dir.join("inventory.yml"), text)?;
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::HostStart { host } => println!("{} {host}", "HOST".bold()),
        Event::CheckCompleted { host, result, .. } if !result.passed => {
            println!(
                "  {} [{host}] {}: {}",
                "check".yellow(),
                result.check_name,
                result.message
            );
        }
        Event::TaskCompleted { task } => {
            println!("  {} [{}] {} {}", "ok".green().bold(), task.host, task.package, task.version);
        }
        Event::TaskFailed { task, error } => {
            println!(
                "  {} [{}] {} {}: {error}",
                "failed".red().bold(),
                task.host,
                task.package,
                task.version
            );
        }
        Event::TaskSkipped { task, reason } => {
            println!(
                "  {} [{}] {} {}: {reason}",
                "skipped".yellow(),
                task.host,
                task.package,
                task.version
            );
        }
        _ => {}
    }
}

fn print_summary(report: &RunReport) {
    println!("\n{}", "DEPLOYMENT SUMMARY".bold());
    for host in &report.hosts {
        let marker = if host.unreachable {
            "unreachable".red().to_string()
        } else {
            format!(
                "{} ok, {} failed, {} skipped",
                host.stats.completed, host.stats.failed, host.stats.skipped
            )
        };
        println!("{}: {marker}", host.host.bold());
        for task in &host.tasks {
            let status = match task.status {
                TaskStatus::Completed => "completed".green().to_string(),
                TaskStatus::Failed => "failed".red().to_string(),
                TaskStatus::Skipped => "skipped".yellow().to_string(),
                other => other.to_string(),
            };
            let reason = if task.error.is_empty() {
                String::new()
            } else {
                format!(" ({})", task.error)
            };
            println!("  {} {}: {status}{reason}", task.package, task.version);
        }
    }
    let verdict = if report.success() {
        "all tasks completed".green().bold().to_string()
    } else if report.cancelled {
        "run cancelled".yellow().bold().to_string()
    } else {
        "run finished with failures".red().bold().to_string()
    };
    println!("{verdict}");
}
