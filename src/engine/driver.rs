// src/engine/driver.rs

//! The batched concurrent step loop.
//!
//! Single writer: one driver owns the engine's transitions. Each batch
//! selects up to `engine_step_batch_size` workable targets (those whose
//! next transition needs no blocking call first, then the ones awaiting
//! probes, least-recently stepped first so nothing starves), steps them on
//! at most `concurrent_automaton_steps` concurrent workers, executes at most
//! one external call per target, feeds the result back through the
//! automaton, and commits through the store's per-id `update`.
//!
//! Recoverable errors are logged and the loop continues; only
//! [`OverseerError::Fatal`] aborts it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::automaton::{step, Action, DepState, ExternalOutcome, Observations};
use crate::errors::{OverseerError, Result};
use crate::exec::EnvError;
use crate::target::{State, Target, TargetId};

use super::{Engine, EngineCommand};

/// How long an idle driver sleeps before re-checking for work.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Minimum interval between two probes of the same still-running process.
/// Keeps a long-running job from being polled on every batch.
const PROBE_BACKOFF: Duration = Duration::from_millis(500);

/// Driver behaviour knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverOptions {
    /// Exit the loop once nothing activated is alive (used by tests and
    /// one-shot runs).
    pub exit_when_idle: bool,
}

/// The batched step loop around a shared [`Engine`].
pub struct Driver {
    engine: Arc<Engine>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    options: DriverOptions,
}

impl Driver {
    pub fn new(
        engine: Arc<Engine>,
        cmd_rx: mpsc::Receiver<EngineCommand>,
        options: DriverOptions,
    ) -> Self {
        Self {
            engine,
            cmd_rx,
            options,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!("engine driver started");
        let mut last_sweep = Instant::now();

        loop {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                if !self.handle_command(cmd).await {
                    info!("shutdown requested; stopping driver");
                    return Ok(());
                }
            }

            if last_sweep.elapsed() >= self.engine.orphan_killing_wait {
                if let Err(e) = self.engine.sweep_orphans().await {
                    warn!(error = %e, "orphan sweep failed");
                }
                last_sweep = Instant::now();
            }

            let did_work = match run_batch(&self.engine).await {
                Ok(worked) => worked,
                Err(e @ OverseerError::Fatal(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "recoverable error in step batch");
                    false
                }
            };

            if self.options.exit_when_idle && matches!(self.engine.is_idle().await, Ok(true)) {
                info!("engine idle; driver exiting");
                return Ok(());
            }

            if did_work {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => match cmd {
                        None => {
                            info!("command channel closed; stopping driver");
                            return Ok(());
                        }
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                info!("shutdown requested; stopping driver");
                                return Ok(());
                            }
                        }
                    },
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }

    /// Returns `false` on shutdown.
    async fn handle_command(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::KillTargets(ids) => {
                debug!(?ids, "kill requested through command channel");
                self.engine.request_kill(ids);
                true
            }
            EngineCommand::SweepOrphans => {
                if let Err(e) = self.engine.sweep_orphans().await {
                    warn!(error = %e, "forced orphan sweep failed");
                }
                true
            }
            EngineCommand::Dump => {
                if let Err(e) = self.engine.dump_now().await {
                    warn!(error = %e, "forced dump failed");
                }
                true
            }
            EngineCommand::Shutdown => false,
        }
    }
}

/// One pass over the work set. Returns whether anything was committed or
/// executed.
pub(crate) async fn run_batch(engine: &Arc<Engine>) -> Result<bool> {
    let alive = engine.store.iter_alive().await?;
    let alive_ids: HashSet<&str> = alive.iter().map(|t| t.id.as_str()).collect();

    // Drop kill requests whose targets are already gone or terminal.
    for id in engine.kill_snapshot() {
        if !alive_ids.contains(id.as_str()) {
            engine.clear_kill(&id);
        }
    }
    let kill_set = engine.kill_snapshot();

    let mut candidates: Vec<Target> = alive
        .iter()
        .filter(|t| t.is_active() || kill_set.contains(&t.id))
        // Probe backoff, unless a kill is pending on the target.
        .filter(|t| !recently_probed(t) || kill_set.contains(&t.id))
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Ok(false);
    }

    candidates.sort_by(|a, b| {
        (needs_external_call(a), a.current().at).cmp(&(needs_external_call(b), b.current().at))
    });
    candidates.truncate(engine.batch_size);

    // Snapshot dependency states once per batch; workers never observe an
    // uncommitted dependency.
    let mut dep_states: HashMap<TargetId, DepState> = HashMap::new();
    let alive_by_id: HashMap<&str, &Target> =
        alive.iter().map(|t| (t.id.as_str(), t)).collect();
    for t in &candidates {
        for dep in &t.dependencies {
            if dep_states.contains_key(dep) {
                continue;
            }
            let state = match alive_by_id.get(dep.as_str()) {
                Some(d) => classify_dependency(d),
                None => match engine.store.get(dep).await {
                    Ok(d) => classify_dependency(&d),
                    // A reference to a target that was never submitted can
                    // never succeed; treat it like a dead dependency.
                    Err(OverseerError::NotFound(_)) => {
                        warn!(dep = %dep, of = %t.id, "dependency on unknown target");
                        DepState::Dead
                    }
                    Err(e) => return Err(e),
                },
            };
            dep_states.insert(dep.clone(), state);
        }
    }
    let dep_states = Arc::new(dep_states);

    let mut join: JoinSet<Result<bool>> = JoinSet::new();
    let mut queue = candidates.into_iter();
    let mut in_flight = 0usize;
    let mut did_work = false;

    loop {
        while in_flight < engine.concurrent_steps {
            match queue.next() {
                Some(target) => {
                    let engine = Arc::clone(engine);
                    let deps = Arc::clone(&dep_states);
                    join.spawn(async move { process_target(&engine, target, &deps).await });
                    in_flight += 1;
                }
                None => break,
            }
        }

        match join.join_next().await {
            None => break,
            Some(joined) => {
                in_flight -= 1;
                match joined {
                    Ok(Ok(worked)) => did_work |= worked,
                    Ok(Err(e @ OverseerError::Fatal(_))) => return Err(e),
                    Ok(Err(e)) => warn!(error = %e, "step worker failed; will retry next batch"),
                    Err(join_err) => {
                        return Err(OverseerError::Fatal(format!(
                            "step worker panicked: {join_err}"
                        )))
                    }
                }
            }
        }
    }

    if did_work {
        engine.bump_revision();
    }
    Ok(did_work)
}

/// Drive one target through up to two automaton steps: a first step from
/// the snapshot, then one external call at most, then a second step
/// consuming its result.
async fn process_target(
    engine: &Arc<Engine>,
    target: Target,
    dep_states: &HashMap<TargetId, DepState>,
) -> Result<bool> {
    let dependencies = unique_dependency_states(&target, dep_states);
    let obs = Observations {
        dependencies: dependencies.clone(),
        outcome: None,
        kill_requested: engine.kill_is_requested(&target.id),
    };

    let first = step(&target, &obs, &engine.policy);
    let mut worked = first.target.history.len() > target.history.len();
    let mut current = if worked {
        let committed = first.target.clone();
        engine
            .store
            .update(&target.id, move |t| *t = committed.clone())
            .await?
    } else {
        first.target
    };

    let mut external = None;
    for action in first.actions {
        match action {
            Action::Activate { id, cause } => {
                worked |= engine.activate(&id, cause).await;
            }
            other => external = Some(other),
        }
    }

    if let Some(action) = external {
        worked = true;
        let outcome = execute_action(engine, action).await;
        let obs = Observations {
            dependencies,
            outcome: Some(outcome),
            kill_requested: engine.kill_is_requested(&target.id),
        };
        let second = step(&current, &obs, &engine.policy);
        if second.target.history.len() > current.history.len() {
            let committed = second.target.clone();
            current = engine
                .store
                .update(&target.id, move |t| *t = committed.clone())
                .await?;
        }
        // Any further external action is re-issued by the automaton next
        // batch; only activations are applied now.
        for action in second.actions {
            if let Action::Activate { id, cause } = action {
                engine.activate(&id, cause).await;
            }
        }
    }

    if current.is_terminal() {
        engine.clear_kill(&current.id);
        debug!(id = %current.id, state = current.state().tag(), "target reached terminal state");
    }
    Ok(worked)
}

fn unique_dependency_states(
    target: &Target,
    dep_states: &HashMap<TargetId, DepState>,
) -> Vec<(TargetId, DepState)> {
    let mut seen = HashSet::new();
    target
        .dependencies
        .iter()
        .filter(|d| seen.insert((*d).clone()))
        .map(|d| {
            let state = dep_states.get(d).copied().unwrap_or(DepState::InProgress);
            (d.clone(), state)
        })
        .collect()
}

/// A still-running process probed less than [`PROBE_BACKOFF`] ago.
fn recently_probed(t: &Target) -> bool {
    matches!(t.state(), State::StartedRunning(_))
        && (chrono::Utc::now() - t.current().at)
            .to_std()
            .map(|elapsed| elapsed < PROBE_BACKOFF)
            .unwrap_or(true)
}

fn classify_dependency(t: &Target) -> DepState {
    match t.state() {
        State::Successful => DepState::Successful,
        State::Dead(_) => DepState::Dead,
        _ => DepState::InProgress,
    }
}

/// Whether the target's next transition goes through the executor.
fn needs_external_call(t: &Target) -> bool {
    match t.state() {
        State::Activable
        | State::Passive
        | State::AlreadyDone
        | State::VerifiedSuccess
        | State::FailedRunning(_)
        | State::FailedToVerifySuccess
        | State::FailedFromDependencies
        | State::Killing
        | State::Killed => false,
        State::RanSuccessfully => t.condition.is_some(),
        State::Active
        | State::TriedToEvaluateCondition
        | State::Building
        | State::TriedToStart
        | State::StartedRunning(_)
        | State::TriedToCheckProcess
        | State::TriedToKill => true,
        State::Successful | State::Dead(_) => false,
    }
}

/// Perform one external call with the configured timeout, classifying a
/// timeout like any other environmental failure.
async fn execute_action(engine: &Arc<Engine>, action: Action) -> ExternalOutcome {
    let limit = engine.host_timeout;
    match action {
        Action::CheckCondition(cond) => {
            let res = match timeout(limit, engine.executor.check_condition(&cond)).await {
                Ok(inner) => inner,
                Err(_) => Err(EnvError::unix(format!(
                    "condition probe timed out after {limit:?}"
                ))),
            };
            ExternalOutcome::ConditionChecked(res)
        }
        Action::Start(process) => {
            let res = match timeout(limit, engine.executor.start(&process)).await {
                Ok(inner) => inner,
                Err(_) => Err(EnvError::start(format!("start timed out after {limit:?}"))),
            };
            ExternalOutcome::StartAttempted(res)
        }
        Action::Probe(handle) => {
            let res = match timeout(limit, engine.executor.probe(&handle)).await {
                Ok(inner) => inner,
                Err(_) => Err(EnvError::probe(format!("probe timed out after {limit:?}"))),
            };
            ExternalOutcome::ProcessProbed(res)
        }
        Action::Kill(handle) => {
            let res = match timeout(limit, engine.executor.kill(&handle)).await {
                Ok(inner) => inner,
                Err(_) => Err(EnvError::kill(format!("kill timed out after {limit:?}"))),
            };
            ExternalOutcome::KillAttempted(res)
        }
        Action::Activate { .. } => unreachable!("activations are not external calls"),
    }
}
