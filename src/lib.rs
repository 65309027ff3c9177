// src/lib.rs

pub mod automaton;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod pipe;
pub mod protocol;
pub mod server;
pub mod store;
pub mod target;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::CliArgs;
use crate::config::{load_profile, Profile};
use crate::engine::{Driver, DriverOptions, Engine, EngineCommand};
use crate::exec::LocalExecutor;
use crate::server::AppState;
use crate::store::TargetStore;

/// Interval between periodic JSON dumps of the alive set.
const DUMP_INTERVAL: Duration = Duration::from_secs(60);

/// High-level entry point used by `main.rs`.
///
/// Wires together: profile loading, the target store, the engine and its
/// driver loop, the protocol server, the optional command pipe, the dump
/// task, and Ctrl-C handling.
pub async fn run(args: CliArgs) -> Result<()> {
    let profile = load_profile(&args.config, args.profile.as_deref())?;

    if args.dry_run {
        print_dry_run(&profile);
        return Ok(());
    }

    let store = TargetStore::connect(&profile.database_parameters).await?;
    let executor = Arc::new(LocalExecutor::new());
    let engine = Arc::new(Engine::new(store, executor, &profile));

    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(64);

    // Protocol server.
    let state = AppState::new(Arc::clone(&engine), cmd_tx.clone(), &profile);
    let port = profile.listen.port;
    if profile.listen.tls.is_some() {
        warn!("TLS termination is delegated to the fronting plumbing; listening on plain TCP");
    }
    tokio::spawn(async move {
        if let Err(e) = server::serve(state, port).await {
            warn!(error = %e, "protocol server stopped");
        }
    });

    // Optional admin pipe.
    if let Some(pipe_path) = &profile.command_pipe {
        tokio::spawn(pipe::run_pipe_reader(
            PathBuf::from(pipe_path),
            cmd_tx.clone(),
        ));
    }

    // Periodic JSON dumps.
    if profile.log_path.is_some() {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DUMP_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if let Err(e) = engine.dump_now().await {
                    warn!(error = %e, "periodic dump failed");
                }
            }
        });
    }

    // Ctrl-C -> graceful shutdown.
    {
        let tx = cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(EngineCommand::Shutdown).await;
        });
    }

    info!("overseer starting");
    let driver = Driver::new(engine, cmd_rx, DriverOptions::default());
    driver.run().await?;
    Ok(())
}

/// Print the selected profile without executing anything.
fn print_dry_run(profile: &Profile) {
    println!("overseer dry-run");
    println!("  database_parameters = {}", profile.database_parameters);
    println!(
        "  maximum_successive_attempts = {}",
        profile.maximum_successive_attempts
    );
    println!(
        "  turn_unix_ssh_failure_into_target_failure = {}",
        profile.turn_unix_ssh_failure_into_target_failure
    );
    println!(
        "  concurrent_automaton_steps = {}",
        profile.concurrent_automaton_steps
    );
    println!("  engine_step_batch_size = {}", profile.engine_step_batch_size);
    println!(
        "  orphan_killing_wait = {}s",
        profile.orphan_killing_wait_secs
    );
    println!(
        "  host_timeout_upper_bound = {}s",
        profile.host_timeout_upper_bound_secs
    );
    println!(
        "  listen = port {} ({})",
        profile.listen.port,
        if profile.listen.tls.is_some() {
            "tls"
        } else {
            "tcp"
        }
    );
    println!("  read_only = {}", profile.read_only);
    println!("  tokens ({}):", profile.tokens.len());
    for token in &profile.tokens {
        println!("    - {}", token.name);
    }
    if let Some(pipe) = &profile.command_pipe {
        println!("  command_pipe = {pipe}");
    }
    if let Some(log) = &profile.log_path {
        println!("  log_path = {log}");
    }
}
