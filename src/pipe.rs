// src/pipe.rs

//! Administrative command pipe.
//!
//! When the profile names a pipe path, a background task reads it line by
//! line and feeds commands into the driver loop:
//!
//! - `kill <id> [<id>...]` — same as a `Kill_targets` request
//! - `sweep-orphans` — force an orphan sweep now
//! - `dump` — force a JSON dump now
//!
//! Unknown lines are logged and ignored. The pipe is administrative only;
//! it is not part of the client protocol.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::EngineCommand;

/// Parse one pipe line into a command.
fn parse_line(line: &str) -> Option<EngineCommand> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "kill" => {
            let ids: Vec<String> = words.map(str::to_string).collect();
            if ids.is_empty() {
                None
            } else {
                Some(EngineCommand::KillTargets(ids))
            }
        }
        "sweep-orphans" => Some(EngineCommand::SweepOrphans),
        "dump" => Some(EngineCommand::Dump),
        _ => None,
    }
}

/// Read the named pipe forever, reopening it whenever the writer side
/// closes.
pub async fn run_pipe_reader(path: PathBuf, cmd_tx: mpsc::Sender<EngineCommand>) {
    info!(path = %path.display(), "command pipe reader started");
    loop {
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open command pipe; stopping reader");
                return;
            }
        };

        let mut lines = BufReader::new(file).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_line(trimmed) {
                Some(cmd) => {
                    info!(command = ?cmd, "pipe command accepted");
                    if cmd_tx.send(cmd).await.is_err() {
                        return;
                    }
                }
                None => warn!(line = %trimmed, "ignoring unknown pipe command"),
            }
        }
        // EOF: every writer closed; reopen and keep listening.
    }
}
