/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::main
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Entry point for Syn-Forum Core. Checks a Composer-managed
    forum deployment for core and extension updates, applies
    scoped update runs, and maintains the state document the
    admin layer renders.

  Security / Safety Notes:
    Operates within user privileges and refuses uid 0 unless
    explicitly overridden. Executes composer and performs
    HTTPS GET requests only.

  Dependencies:
    clap for CLI parsing, chrono for timestamps.

  Operational Scope:
    Invoked by the forum admin layer via `syn-forum core` or
    when operators require standalone state regeneration.

  Revision History:
    2026-03-02 COD  Authored Syn-Forum Core runtime.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Result-first error handling with deterministic exits
    - Structured logging following Synavera cadence
    - Configurable execution via CLI and config file
============================================================*/

mod blueprint;
mod composer;
mod config;
mod error;
mod logger;
mod orchestrator;
mod packagist;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};

use blueprint::LogNotifier;
use composer::ComposerClient;
use config::SynforumConfig;
use error::{Result, SynforumError};
use logger::Logger;
use orchestrator::{RunDispatch, UpdateOrchestrator};
use packagist::PackagistClient;
use state::{LastUpdateCheck, LastUpdateRun, UpdateState, UpdateStateStore, UpdateStatus, UpdateType};

/// Exit code signalling a recorded run with status=failure; distinct
/// from the error-taxonomy codes so operators can tell "composer said
/// no" from "we could not even ask".
const EXIT_RUN_FAILURE: u8 = 13;

/// Command-line arguments for Syn-Forum-Core.
#[derive(Debug, Parser)]
#[command(
    name = "Syn-Forum-Core",
    version,
    author = "Synavera Systems",
    about = "Conscious update orchestrator for Composer-managed forums"
)]
struct Cli {
    /// Override configuration file path.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override state document path.
    #[arg(long, value_name = "PATH")]
    state: Option<PathBuf>,
    /// Explicit log file path.
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
    /// Enable verbose logging to stderr.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
    /// Permit running as uid 0.
    #[arg(long, action = ArgAction::SetTrue)]
    allow_root: bool,
    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Debug, Subcommand)]
enum CommandKind {
    /// Query the package manager for update candidates and record them.
    Check {
        /// Do not persist the state document; emit summary only.
        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Skip Packagist version enrichment.
        #[arg(long, action = ArgAction::SetTrue)]
        no_packagist: bool,
    },
    /// Apply one scoped update run and record its outcome.
    Update {
        /// Update a single extension to its newest compatible release.
        #[arg(long, value_name = "PKG", conflicts_with_all = ["core_minor", "global"])]
        extension: Option<String>,
        /// Update the forum core within the installed major.
        #[arg(long, action = ArgAction::SetTrue, conflicts_with = "global")]
        core_minor: bool,
        /// Update every required package.
        #[arg(long, action = ArgAction::SetTrue)]
        global: bool,
    },
    /// Print the recorded check and run state.
    State,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[Syn-Forum-Core] {}", err);
            err.exit_code()
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    if !cli.allow_root && unsafe { libc::geteuid() } == 0 {
        return Err(SynforumError::Config(
            "Refusing to drive composer as root; pass --allow-root to override".into(),
        ));
    }

    let config = SynforumConfig::load_from_optional_path(cli.config.as_deref())?;
    let state_path = cli.state.clone().unwrap_or_else(|| config.state_path());

    let session_stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let log_path = cli
        .log
        .clone()
        .or_else(|| Some(config.log_dir().join(format!("core_{session_stamp}.log"))));
    let logger = Arc::new(Logger::new(log_path, cli.verbose)?);
    logger.info("INIT", "Syn-Forum Core awakening.");

    let store = UpdateStateStore::open(Some(state_path))?;

    let code = match cli.command {
        CommandKind::State => {
            print_state(store.last_check(), store.last_run());
            ExitCode::SUCCESS
        }
        CommandKind::Check {
            dry_run,
            no_packagist,
        } => {
            let store = if dry_run { store.into_ephemeral() } else { store };
            let orchestrator = build_orchestrator(&config, store, !no_packagist, &logger)?;
            orchestrator.check_for_updates().await?;

            let check = orchestrator.last_check()?;
            let core = orchestrator.core_update()?;
            let extensions = orchestrator.extension_updates()?;
            println!(
                "→ Check complete. Candidates={} (core={}, extensions={}){}",
                check.updates.len(),
                if core.is_some() { "yes" } else { "no" },
                extensions.len(),
                if dry_run { " [dry-run]" } else { "" }
            );
            ExitCode::SUCCESS
        }
        CommandKind::Update {
            extension,
            core_minor,
            global,
        } => {
            let orchestrator = build_orchestrator(&config, store, true, &logger)?;
            let dispatch = match (&extension, core_minor, global) {
                (Some(name), _, _) => orchestrator.update_extension(name).await?,
                (None, true, _) => orchestrator.update_core_minor().await?,
                (None, false, true) => orchestrator.update_globally().await?,
                (None, false, false) => {
                    return Err(SynforumError::Config(
                        "Select one of --extension, --core-minor, --global".into(),
                    ));
                }
            };

            match dispatch {
                RunDispatch::Coalesced => ExitCode::SUCCESS,
                RunDispatch::Completed(update_type) => {
                    let run = orchestrator.last_run()?;
                    let recorded = run.get(update_type);
                    print_run_line(update_type, recorded);
                    if recorded.status == UpdateStatus::Failure {
                        ExitCode::from(EXIT_RUN_FAILURE)
                    } else {
                        ExitCode::SUCCESS
                    }
                }
            }
        }
    };

    logger.info("COMPLETE", "State synchronised.");
    logger.finalize()?;
    Ok(code)
}

fn build_orchestrator(
    config: &SynforumConfig,
    store: UpdateStateStore,
    with_packagist: bool,
    logger: &Arc<Logger>,
) -> Result<UpdateOrchestrator<ComposerClient>> {
    let manager = ComposerClient::new(&config.composer);
    let packagist = if with_packagist {
        Some(PackagistClient::new(&config.packagist)?)
    } else {
        None
    };
    Ok(UpdateOrchestrator::new(
        manager,
        store,
        packagist,
        Box::new(LogNotifier::new(logger.clone())),
        logger.clone(),
        config.composer.core_package.clone(),
    ))
}

fn print_state(check: &LastUpdateCheck, run: &LastUpdateRun) {
    match check.checked_at {
        Some(stamp) => println!(
            "→ Last check: {} ({} update candidates)",
            stamp.to_rfc3339(),
            check.updates.len()
        ),
        None => println!("→ Last check: never"),
    }
    for package in &check.updates {
        println!(
            "    {} {} → {} [{}]",
            package.name, package.version, package.latest, package.latest_status
        );
    }
    for update_type in UpdateType::ALL {
        print_run_line(update_type, run.get(update_type));
    }
    let limited = run.limited_packages();
    if !limited.is_empty() {
        println!(
            "→ Limited packages overall: {}",
            limited.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
}

fn print_run_line(update_type: UpdateType, state: &UpdateState) {
    match state.ran_at {
        Some(stamp) => println!(
            "→ Last run [{}]: {} at {} (limited={} incompatible={})",
            update_type.as_str(),
            state.status.as_str(),
            stamp.to_rfc3339(),
            state.limited_packages.len(),
            state.incompatible_extensions.len()
        ),
        None => println!("→ Last run [{}]: never", update_type.as_str()),
    }
}
