// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for the `overseer` daemon.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "overseer",
    version,
    about = "Workflow engine: drives DAGs of targets to completion.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(long, value_name = "PATH", default_value = "overseer.json")]
    pub config: String,

    /// Configuration profile to run. Falls back to `OVERSEER_PROFILE`, then
    /// to the only profile if the file defines exactly one.
    #[arg(long, value_name = "NAME")]
    pub profile: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `OVERSEER_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Load + validate the profile, print it, and exit without serving.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
