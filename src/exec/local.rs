// src/exec/local.rs

//! Local host executor.
//!
//! Runs `Direct_command` processes on the local machine through `sh -c`,
//! probes conditions against the local filesystem, and tracks running
//! children in an in-memory registry keyed by the run-handle token.
//!
//! `Long_running` plugins and non-local hosts are transport concerns; this
//! executor answers them with classified start/unix errors.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::target::{BuildProcess, Condition, Host, RunHandle};

use super::{EnvError, ExecFuture, HostExecutor, ProcessStatus};

fn is_local(host: &Host) -> bool {
    matches!(host.as_str(), "localhost" | "127.0.0.1" | "local")
}

/// Executor for `localhost` work.
pub struct LocalExecutor {
    /// Running children by handle token. `probe` reaps exited ones lazily.
    children: Mutex<HashMap<String, Child>>,
    /// Exit statuses of reaped children, kept for repeated probes.
    finished: Mutex<HashMap<String, ProcessStatus>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    async fn check_condition_inner(&self, condition: &Condition) -> Result<bool, EnvError> {
        match condition {
            Condition::FileExists { host, path } => {
                if !is_local(host) {
                    return Err(EnvError::unix(format!("unsupported host {host:?}")));
                }
                Ok(tokio::fs::metadata(path).await.is_ok())
            }
            Condition::FileSizeAtLeast { host, path, size } => {
                if !is_local(host) {
                    return Err(EnvError::unix(format!("unsupported host {host:?}")));
                }
                match tokio::fs::metadata(path).await {
                    Ok(meta) => Ok(meta.len() >= *size),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(EnvError::unix(format!("stat {path:?}: {e}"))),
                }
            }
            Condition::All(subs) => {
                for sub in subs {
                    if !Box::pin(self.check_condition_inner(sub)).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn start_inner(&self, process: &BuildProcess) -> Result<RunHandle, EnvError> {
        match process {
            BuildProcess::NoOperation => {
                // The automaton short-circuits no-ops; reaching here is a
                // driver bug, surfaced as a start error rather than a panic.
                Err(EnvError::start("no-operation targets are never started"))
            }
            BuildProcess::DirectCommand { host, program } => {
                if !is_local(host) {
                    return Err(EnvError::start(format!("unsupported host {host:?}")));
                }

                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(program)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);

                let child = cmd
                    .spawn()
                    .map_err(|e| EnvError::start(format!("spawning {program:?}: {e}")))?;

                let token = uuid::Uuid::new_v4().to_string();
                info!(%token, program = %program, "started local process");
                self.children.lock().unwrap().insert(token.clone(), child);

                Ok(RunHandle {
                    host: host.clone(),
                    token,
                })
            }
            BuildProcess::LongRunning { plugin, .. } => Err(EnvError::start(format!(
                "no plugin {plugin:?} registered on the local executor"
            ))),
        }
    }

    fn probe_inner(&self, handle: &RunHandle) -> Result<ProcessStatus, EnvError> {
        if let Some(status) = self.finished.lock().unwrap().get(&handle.token) {
            return Ok(status.clone());
        }

        let mut children = self.children.lock().unwrap();
        let child = children
            .get_mut(&handle.token)
            .ok_or_else(|| EnvError::probe(format!("unknown run handle {}", handle.token)))?;

        match child.try_wait() {
            Ok(None) => Ok(ProcessStatus::StillRunning),
            Ok(Some(status)) => {
                let outcome = if status.success() {
                    ProcessStatus::FinishedSuccessfully
                } else {
                    ProcessStatus::FinishedWithFailure(format!(
                        "exit code {}",
                        status.code().unwrap_or(-1)
                    ))
                };
                debug!(token = %handle.token, ?outcome, "local process exited");
                children.remove(&handle.token);
                self.finished
                    .lock()
                    .unwrap()
                    .insert(handle.token.clone(), outcome.clone());
                Ok(outcome)
            }
            Err(e) => Err(EnvError::probe(format!("wait on {}: {e}", handle.token))),
        }
    }

    async fn kill_inner(&self, handle: &RunHandle) -> Result<(), EnvError> {
        let child = self.children.lock().unwrap().remove(&handle.token);
        match child {
            Some(mut child) => {
                child
                    .kill()
                    .await
                    .map_err(|e| EnvError::kill(format!("kill {}: {e}", handle.token)))?;
                self.finished.lock().unwrap().insert(
                    handle.token.clone(),
                    ProcessStatus::FinishedWithFailure("killed".into()),
                );
                Ok(())
            }
            None => {
                // Already reaped or never ours. Killing a finished process
                // is a no-op, not an error.
                warn!(token = %handle.token, "kill for unknown or finished handle");
                Ok(())
            }
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostExecutor for LocalExecutor {
    fn check_condition<'a>(
        &'a self,
        condition: &'a Condition,
    ) -> ExecFuture<'a, Result<bool, EnvError>> {
        Box::pin(self.check_condition_inner(condition))
    }

    fn start<'a>(
        &'a self,
        process: &'a BuildProcess,
    ) -> ExecFuture<'a, Result<RunHandle, EnvError>> {
        Box::pin(async move { self.start_inner(process) })
    }

    fn probe<'a>(
        &'a self,
        handle: &'a RunHandle,
    ) -> ExecFuture<'a, Result<ProcessStatus, EnvError>> {
        Box::pin(async move { self.probe_inner(handle) })
    }

    fn kill<'a>(&'a self, handle: &'a RunHandle) -> ExecFuture<'a, Result<(), EnvError>> {
        Box::pin(self.kill_inner(handle))
    }

    fn copy_files(
        &self,
        src_host: &Host,
        files: &[String],
        dst_host: &Host,
        dst_path: &str,
    ) -> (Host, String) {
        let sources = files.join(" ");
        if src_host == dst_host {
            (
                dst_host.clone(),
                format!("cp -r {sources} {dst_path}"),
            )
        } else {
            // Run the transfer from the destination side.
            (
                dst_host.clone(),
                format!("scp -r {src_host}:{{{sources}}} {dst_path}"),
            )
        }
    }

    fn diagnostic<'a>(
        &'a self,
        _payload: &'a serde_json::Value,
    ) -> ExecFuture<'a, Result<serde_json::Value, EnvError>> {
        Box::pin(async {
            Ok(serde_json::json!({
                "error": "the local executor has no process subprotocol"
            }))
        })
    }
}
