//! Autonomous task orchestrator.
//!
//! Runs a work request (`stories -> tasks` with prerequisites) through
//! execution, review and a regression-checking quality gate, committing each
//! accepted task to the project repository.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::cancel::{CancelToken, cancel_on_signals, watch_stop_file};
use orchestrator::exit_codes;
use orchestrator::io::config::load_config;
use orchestrator::io::init::{InitOptions, OrchestratorPaths, clear_stop, init_orchestrator, request_stop};
use orchestrator::session::{
    preflight, production_services, recover_run, run_status, run_work_request,
};
use orchestrator::validate::validate_work_request;
use orchestrator::work_request::{check_work_request, load_work_request};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Autonomous task orchestrator for coding agents"
)]
struct Cli {
    /// Project root (a git repository).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/` with default config and schema.
    Init {
        /// Overwrite existing config and schema (state is kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Check a work request against the schema and the dependency rules.
    Validate {
        /// Work request JSON file.
        file: PathBuf,
    },
    /// Run a work request to completion, resuming it if it was interrupted.
    Run {
        /// Work request JSON file.
        file: PathBuf,
    },
    /// Print the state of the persisted run.
    Status,
    /// Reset tasks left mid-flight by a crash to ready, without running anything.
    ///
    /// Refuses a dirty working tree, like `run`.
    Recover,
    /// Ask a running orchestrator to stop after its workers wind down.
    Stop,
}

fn main() {
    orchestrator::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Validate { file } => cmd_validate(root, &file),
        Command::Run { file } => cmd_run(root, &file),
        Command::Status => cmd_status(root),
        Command::Recover => cmd_recover(root),
        Command::Stop => cmd_stop(root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_orchestrator(root, &InitOptions { force })?;
    println!("initialized {}", paths.dir.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path, file: &Path) -> Result<i32> {
    let outcome = validate_work_request(root, file)?;
    println!(
        "ok: {} ({} stories, {} tasks; ready: {})",
        outcome.work_request_id,
        outcome.stories,
        outcome.tasks,
        outcome.initially_ready.join(", ")
    );
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, file: &Path) -> Result<i32> {
    // First, before anything spawns a thread.
    let cancel = CancelToken::new();
    cancel_on_signals(cancel.clone())?;

    let request = load_work_request(file)?;
    check_work_request(&request)?;
    preflight(root)?;

    let services = production_services(root)?;
    let paths = OrchestratorPaths::new(root);
    let cfg = load_config(&paths.config_path).context("load config.toml")?;
    clear_stop(&paths)?;
    watch_stop_file(cancel.clone(), paths.stop_path.clone(), cfg.poll_interval());

    let report = run_work_request(root, request, services, cancel.clone());
    // Ends the stop-file watcher.
    cancel.cancel();
    let report = report?;
    print!("{}", report.render());
    Ok(report.exit_code())
}

fn cmd_status(root: &Path) -> Result<i32> {
    match run_status(root)? {
        Some(report) => print!("{}", report.render()),
        None => println!("no run recorded"),
    }
    Ok(exit_codes::OK)
}

fn cmd_recover(root: &Path) -> Result<i32> {
    preflight(root)?;
    let recovered = recover_run(root, production_services(root)?)?;
    if recovered.is_empty() {
        println!("nothing to recover");
    } else {
        println!("reset to ready: {}", recovered.join(", "));
    }
    Ok(exit_codes::OK)
}

fn cmd_stop(root: &Path) -> Result<i32> {
    request_stop(&OrchestratorPaths::new(root))?;
    println!("stop requested");
    Ok(exit_codes::OK)
}
