//! A scripted fake `HostExecutor`.
//!
//! Keys scripts by the *program* of a `Direct_command` (or the plugin name
//! of a `Long_running` process). Defaults make the common cases work
//! without scripting:
//!
//! - starting always succeeds
//! - probing a `"true"`-like program finishes successfully, `"false"`
//!   finishes with failure, anything else finishes successfully
//! - conditions evaluate to `false` (not done yet)
//! - kills succeed
//!
//! Scripted entries are consumed front to back, then behaviour falls back
//! to the defaults. Every call is recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use overseer::exec::{EnvError, ExecFuture, HostExecutor, ProcessStatus};
use overseer::target::{BuildProcess, Condition, Host, RunHandle};

#[derive(Default)]
struct FakeState {
    condition_scripts: HashMap<String, VecDeque<Result<bool, EnvError>>>,
    start_scripts: HashMap<String, VecDeque<Result<(), EnvError>>>,
    probe_scripts: HashMap<String, VecDeque<Result<ProcessStatus, EnvError>>>,
    kill_scripts: HashMap<String, VecDeque<Result<(), EnvError>>>,
    /// token -> key, for probes and kills.
    handles: HashMap<String, String>,
    handle_counter: u64,

    started: Vec<String>,
    probed: Vec<String>,
    killed: Vec<String>,
    conditions_checked: Vec<String>,
}

/// Scripted executor for tests.
#[derive(Default)]
pub struct FakeHostExecutor {
    state: Mutex<FakeState>,
}

/// Script key of a build process: program text or plugin name.
pub fn process_key(process: &BuildProcess) -> String {
    match process {
        BuildProcess::NoOperation => "no-op".to_string(),
        BuildProcess::DirectCommand { program, .. } => program.clone(),
        BuildProcess::LongRunning { plugin, .. } => plugin.clone(),
    }
}

/// Script key of a condition: its first path.
pub fn condition_key(condition: &Condition) -> String {
    match condition {
        Condition::FileExists { path, .. } => path.clone(),
        Condition::FileSizeAtLeast { path, .. } => path.clone(),
        Condition::All(subs) => subs
            .first()
            .map(condition_key)
            .unwrap_or_else(|| "all".to_string()),
    }
}

impl FakeHostExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_condition(&self, key: &str, results: Vec<Result<bool, EnvError>>) {
        self.state
            .lock()
            .unwrap()
            .condition_scripts
            .entry(key.to_string())
            .or_default()
            .extend(results);
    }

    pub fn script_start(&self, key: &str, results: Vec<Result<(), EnvError>>) {
        self.state
            .lock()
            .unwrap()
            .start_scripts
            .entry(key.to_string())
            .or_default()
            .extend(results);
    }

    pub fn script_probe(&self, key: &str, results: Vec<Result<ProcessStatus, EnvError>>) {
        self.state
            .lock()
            .unwrap()
            .probe_scripts
            .entry(key.to_string())
            .or_default()
            .extend(results);
    }

    pub fn script_kill(&self, key: &str, results: Vec<Result<(), EnvError>>) {
        self.state
            .lock()
            .unwrap()
            .kill_scripts
            .entry(key.to_string())
            .or_default()
            .extend(results);
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn probed(&self) -> Vec<String> {
        self.state.lock().unwrap().probed.clone()
    }

    pub fn conditions_checked(&self) -> Vec<String> {
        self.state.lock().unwrap().conditions_checked.clone()
    }

    fn default_probe(key: &str) -> Result<ProcessStatus, EnvError> {
        if key == "false" || key.starts_with("false ") || key.contains("exit 1") {
            Ok(ProcessStatus::FinishedWithFailure("exit code 1".to_string()))
        } else {
            Ok(ProcessStatus::FinishedSuccessfully)
        }
    }
}

impl HostExecutor for FakeHostExecutor {
    fn check_condition<'a>(
        &'a self,
        condition: &'a Condition,
    ) -> ExecFuture<'a, Result<bool, EnvError>> {
        let key = condition_key(condition);
        let mut state = self.state.lock().unwrap();
        state.conditions_checked.push(key.clone());
        let result = state
            .condition_scripts
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(false));
        Box::pin(async move { result })
    }

    fn start<'a>(
        &'a self,
        process: &'a BuildProcess,
    ) -> ExecFuture<'a, Result<RunHandle, EnvError>> {
        let key = process_key(process);
        let mut state = self.state.lock().unwrap();
        let scripted = state
            .start_scripts
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()));
        let result = match scripted {
            Err(e) => Err(e),
            Ok(()) => {
                state.handle_counter += 1;
                let token = format!("fake-{}-{}", key, state.handle_counter);
                state.handles.insert(token.clone(), key.clone());
                state.started.push(key);
                Ok(RunHandle {
                    host: "localhost".to_string(),
                    token,
                })
            }
        };
        Box::pin(async move { result })
    }

    fn probe<'a>(
        &'a self,
        handle: &'a RunHandle,
    ) -> ExecFuture<'a, Result<ProcessStatus, EnvError>> {
        let mut state = self.state.lock().unwrap();
        let result = match state.handles.get(&handle.token).cloned() {
            None => Err(EnvError::probe(format!("unknown handle {}", handle.token))),
            Some(key) => {
                state.probed.push(key.clone());
                state
                    .probe_scripts
                    .get_mut(&key)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| Self::default_probe(&key))
            }
        };
        Box::pin(async move { result })
    }

    fn kill<'a>(&'a self, handle: &'a RunHandle) -> ExecFuture<'a, Result<(), EnvError>> {
        let mut state = self.state.lock().unwrap();
        let result = match state.handles.get(&handle.token).cloned() {
            None => Ok(()),
            Some(key) => {
                state.killed.push(key.clone());
                state
                    .kill_scripts
                    .get_mut(&key)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Ok(()))
            }
        };
        Box::pin(async move { result })
    }

    fn copy_files(
        &self,
        _src_host: &Host,
        files: &[String],
        dst_host: &Host,
        dst_path: &str,
    ) -> (Host, String) {
        (dst_host.clone(), format!("cp -r {} {}", files.join(" "), dst_path))
    }

    fn diagnostic<'a>(
        &'a self,
        payload: &'a serde_json::Value,
    ) -> ExecFuture<'a, Result<serde_json::Value, EnvError>> {
        let echoed = serde_json::json!({ "echo": payload });
        Box::pin(async move { Ok(echoed) })
    }
}
