// src/automaton/mod.rs

//! The target lifecycle automaton.
//!
//! [`step`] is a pure, synchronous function: it takes a snapshot of a target,
//! an observation bundle (dependency states, the result of any external call
//! the driver performed for this target, a pending kill request) and the
//! failure policy, and returns the next target value plus the actions the
//! driver should perform. It never suspends and never touches the store,
//! which keeps the whole transition table unit-testable without Tokio,
//! processes, or SQL — the same pure-core/IO-shell split the engine uses
//! everywhere.
//!
//! Transitions append to the target's history; terminal targets are returned
//! unchanged. A step emits at most one *external* action (condition check,
//! start, probe, kill); activation requests are in-engine bookkeeping and may
//! accompany it.

use serde::{Deserialize, Serialize};

use crate::exec::{EnvError, ProcessStatus};
use crate::target::{BuildProcess, Cause, Condition, RunHandle, State, Target, TargetId};

/// Observed state of one dependency, as of the driver's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    Successful,
    Dead,
    InProgress,
}

/// Result of the external call the driver performed for this target since
/// the last step, if any.
#[derive(Debug, Clone)]
pub enum ExternalOutcome {
    ConditionChecked(Result<bool, EnvError>),
    StartAttempted(Result<RunHandle, EnvError>),
    ProcessProbed(Result<ProcessStatus, EnvError>),
    KillAttempted(Result<(), EnvError>),
}

/// Everything the automaton is allowed to see beyond the target itself.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    /// Dependency states aligned with `target.dependencies` (deduplicated).
    pub dependencies: Vec<(TargetId, DepState)>,
    pub outcome: Option<ExternalOutcome>,
    pub kill_requested: bool,
}

/// Side effects the driver must perform after committing the new target.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// External: probe a readiness condition.
    CheckCondition(Condition),
    /// External: launch the build process.
    Start(BuildProcess),
    /// External: probe a running process.
    Probe(RunHandle),
    /// External: terminate a running process.
    Kill(RunHandle),
    /// In-engine: activate another target (cascade or fallback). Idempotent
    /// on non-passive targets.
    Activate { id: TargetId, cause: Cause },
}

impl Action {
    pub fn is_external(&self) -> bool {
        !matches!(self, Action::Activate { .. })
    }
}

/// Failure/recovery policy knobs (§ configuration).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Attempts at or above this count force death.
    pub maximum_successive_attempts: u32,
    /// When false (default), classified environmental errors return the
    /// target to its prior actionable state without counting an attempt.
    pub turn_unix_ssh_failure_into_target_failure: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            maximum_successive_attempts: 3,
            turn_unix_ssh_failure_into_target_failure: false,
        }
    }
}

/// Result of one automaton step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub target: Target,
    pub actions: Vec<Action>,
}

impl StepOutcome {
    fn unchanged(target: &Target) -> Self {
        Self {
            target: target.clone(),
            actions: Vec::new(),
        }
    }
}

/// Compute the next target value and side effects for one step.
pub fn step(target: &Target, obs: &Observations, policy: &FailurePolicy) -> StepOutcome {
    if target.is_terminal() {
        return StepOutcome::unchanged(target);
    }

    let mut t = target.clone();
    let mut actions = Vec::new();

    let in_kill_path = matches!(
        t.state(),
        State::TriedToKill | State::Killing | State::Killed
    );
    if obs.kill_requested || in_kill_path {
        kill_step(&mut t, obs, policy, &mut actions);
        return StepOutcome { target: t, actions };
    }

    match t.state().clone() {
        State::Passive => {
            // Activation is an explicit operation; nothing to drive.
        }
        State::Activable => resolve_dependencies(&mut t, obs, &mut actions),
        State::Active => {
            match t.condition.clone() {
                Some(cond) => {
                    t.push(
                        State::TriedToEvaluateCondition,
                        Cause::engine("probing readiness condition"),
                    );
                    actions.push(Action::CheckCondition(cond));
                }
                None => begin_build(&mut t, &mut actions),
            }
        }
        State::TriedToEvaluateCondition => match &obs.outcome {
            Some(ExternalOutcome::ConditionChecked(Ok(true))) => {
                t.push(State::AlreadyDone, Cause::engine("condition already holds"));
                t.push(State::Successful, Cause::engine("nothing to do"));
            }
            Some(ExternalOutcome::ConditionChecked(Ok(false))) => {
                begin_build(&mut t, &mut actions);
            }
            Some(ExternalOutcome::ConditionChecked(Err(e))) => {
                environment_failure(&mut t, policy, e, State::Active, &mut actions);
            }
            _ => {
                // Probe result lost (engine restart mid-flight); re-issue.
                if let Some(cond) = t.condition.clone() {
                    actions.push(Action::CheckCondition(cond));
                } else {
                    begin_build(&mut t, &mut actions);
                }
            }
        },
        State::Building => start_process(&mut t, &mut actions),
        State::TriedToStart => match &obs.outcome {
            Some(ExternalOutcome::StartAttempted(Ok(handle))) => {
                t.push(
                    State::StartedRunning(handle.clone()),
                    Cause::engine("process started"),
                );
            }
            Some(ExternalOutcome::StartAttempted(Err(e))) => {
                environment_failure(&mut t, policy, e, State::Building, &mut actions);
            }
            _ => {
                actions.push(Action::Start(t.build_process.clone()));
            }
        },
        State::StartedRunning(handle) => {
            t.push(
                State::TriedToCheckProcess,
                Cause::engine("probing process"),
            );
            actions.push(Action::Probe(handle));
        }
        State::TriedToCheckProcess => {
            let handle = match t.run_handle().cloned() {
                Some(h) => h,
                None => {
                    // No recorded start: the history is corrupt. Kill the
                    // target rather than loop forever.
                    die(&mut t, "probe state without a run handle", &mut actions);
                    return StepOutcome { target: t, actions };
                }
            };
            match &obs.outcome {
                Some(ExternalOutcome::ProcessProbed(Ok(ProcessStatus::StillRunning))) => {
                    t.push(
                        State::StartedRunning(handle),
                        Cause::engine("still running"),
                    );
                }
                Some(ExternalOutcome::ProcessProbed(Ok(
                    ProcessStatus::FinishedSuccessfully,
                ))) => {
                    t.push(State::RanSuccessfully, Cause::engine("process succeeded"));
                    verify_after_run(&mut t, &mut actions);
                }
                Some(ExternalOutcome::ProcessProbed(Ok(ProcessStatus::FinishedWithFailure(
                    reason,
                )))) => {
                    record_failure(
                        &mut t,
                        State::FailedRunning(reason.clone()),
                        policy,
                        &mut actions,
                    );
                }
                Some(ExternalOutcome::ProcessProbed(Err(e))) => {
                    environment_failure(
                        &mut t,
                        policy,
                        e,
                        State::StartedRunning(handle),
                        &mut actions,
                    );
                }
                _ => {
                    actions.push(Action::Probe(handle));
                }
            }
        }
        State::RanSuccessfully => match &obs.outcome {
            Some(ExternalOutcome::ConditionChecked(Ok(true))) => {
                t.push(State::VerifiedSuccess, Cause::engine("condition holds"));
                t.push(State::Successful, Cause::engine("verified"));
            }
            Some(ExternalOutcome::ConditionChecked(Ok(false))) => {
                record_failure(&mut t, State::FailedToVerifySuccess, policy, &mut actions);
            }
            Some(ExternalOutcome::ConditionChecked(Err(e))) => {
                environment_failure(&mut t, policy, e, State::RanSuccessfully, &mut actions);
            }
            _ => verify_after_run(&mut t, &mut actions),
        },
        State::AlreadyDone | State::VerifiedSuccess => {
            t.push(State::Successful, Cause::engine("done"));
        }
        // Transitional failure entries are normally chained inside one step;
        // seeing one as current means a crash interrupted the chain.
        State::FailedRunning(_) | State::FailedToVerifySuccess => {
            if t.attempts() >= policy.maximum_successive_attempts {
                die(&mut t, "all attempts exhausted", &mut actions);
            } else {
                t.push(State::Active, Cause::engine("retrying"));
            }
        }
        State::FailedFromDependencies => {
            die(&mut t, "dependencies died", &mut actions);
        }
        State::Killing => {
            t.push(State::Killed, Cause::engine("process terminated"));
            die(&mut t, "killed", &mut actions);
        }
        State::Killed => {
            die(&mut t, "killed", &mut actions);
        }
        State::TriedToKill => unreachable!("handled by the kill path above"),
        State::Successful | State::Dead(_) => unreachable!("terminal handled above"),
    }

    StepOutcome { target: t, actions }
}

/// Dependency resolution for `Activable` targets, including the activation
/// cascade and the failure-propagation fallback.
fn resolve_dependencies(t: &mut Target, obs: &Observations, actions: &mut Vec<Action>) {
    let dead: Vec<&TargetId> = obs
        .dependencies
        .iter()
        .filter(|(_, s)| *s == DepState::Dead)
        .map(|(id, _)| id)
        .collect();

    if !dead.is_empty() {
        let ids = dead
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        t.push(
            State::FailedFromDependencies,
            Cause::engine(format!("dead dependencies: {ids}")),
        );
        die(t, &format!("dependencies died: {ids}"), actions);
        return;
    }

    let unresolved: Vec<&TargetId> = obs
        .dependencies
        .iter()
        .filter(|(_, s)| *s == DepState::InProgress)
        .map(|(id, _)| id)
        .collect();

    if unresolved.is_empty() {
        t.push(State::Active, Cause::engine("dependencies resolved"));
    } else {
        // Cascade: make sure every pending dependency is activated. The
        // driver ignores the request for non-passive targets.
        for id in unresolved {
            actions.push(Action::Activate {
                id: id.clone(),
                cause: Cause::DependencyOf(t.id.clone()),
            });
        }
    }
}

/// `Active`/condition-false path into the build: `Building`, then either the
/// no-op shortcut or a start attempt.
fn begin_build(t: &mut Target, actions: &mut Vec<Action>) {
    t.push(State::Building, Cause::engine("dependencies ensured"));
    start_process(t, actions);
}

fn start_process(t: &mut Target, actions: &mut Vec<Action>) {
    match &t.build_process {
        BuildProcess::NoOperation => {
            t.push(State::RanSuccessfully, Cause::engine("nothing to run"));
            verify_after_run(t, actions);
        }
        process => {
            let process = process.clone();
            t.push(State::TriedToStart, Cause::engine("starting process"));
            actions.push(Action::Start(process));
        }
    }
}

/// Post-run verification: without a condition a successful run is enough;
/// with one, the probe result decides.
fn verify_after_run(t: &mut Target, actions: &mut Vec<Action>) {
    match t.condition.clone() {
        None => {
            t.push(State::VerifiedSuccess, Cause::engine("no condition to check"));
            t.push(State::Successful, Cause::engine("verified"));
        }
        Some(cond) => {
            actions.push(Action::CheckCondition(cond));
        }
    }
}

/// A real workflow-level failure: count the attempt and either retry or die.
fn record_failure(
    t: &mut Target,
    state: State,
    policy: &FailurePolicy,
    actions: &mut Vec<Action>,
) {
    let attempts = t.attempts() + 1;
    let reason = match &state {
        State::FailedRunning(r) => format!("process failed: {r}"),
        State::FailedToVerifySuccess => "condition still false after run".to_string(),
        other => format!("failure: {}", other.tag()),
    };
    t.push_with_attempts(state, Cause::engine(reason.clone()), attempts);

    if attempts >= policy.maximum_successive_attempts {
        die(t, &format!("{reason} ({attempts} attempts)"), actions);
    } else {
        t.push(State::Active, Cause::engine("retrying"));
    }
}

/// A classified unix/ssh failure: per policy either an uncounted hiccup that
/// returns the target to its prior actionable state, or a counted attempt.
fn environment_failure(
    t: &mut Target,
    policy: &FailurePolicy,
    error: &EnvError,
    back_to: State,
    actions: &mut Vec<Action>,
) {
    if policy.turn_unix_ssh_failure_into_target_failure {
        let attempts = t.attempts() + 1;
        if attempts >= policy.maximum_successive_attempts {
            t.push_with_attempts(
                back_to,
                Cause::engine(format!("environment failure: {error}")),
                attempts,
            );
            die(t, &format!("environment failure: {error}"), actions);
        } else {
            t.push_with_attempts(
                back_to,
                Cause::engine(format!("environment failure: {error}")),
                attempts,
            );
        }
    } else {
        t.push(
            back_to,
            Cause::engine(format!("environment hiccup: {error}")),
        );
    }
}

/// Kill-request handling from any non-terminal state.
fn kill_step(
    t: &mut Target,
    obs: &Observations,
    policy: &FailurePolicy,
    actions: &mut Vec<Action>,
) {
    match t.state().clone() {
        State::TriedToKill => match &obs.outcome {
            Some(ExternalOutcome::KillAttempted(Ok(()))) => {
                t.push(State::Killing, Cause::engine("kill dispatched"));
                t.push(State::Killed, Cause::User);
                die(t, "killed", actions);
            }
            Some(ExternalOutcome::KillAttempted(Err(e))) => {
                environment_failure(t, policy, e, State::TriedToKill, actions);
            }
            _ => {
                if let Some(handle) = t.run_handle().cloned() {
                    actions.push(Action::Kill(handle));
                } else {
                    t.push(State::Killed, Cause::User);
                    die(t, "killed", actions);
                }
            }
        },
        State::Killing => {
            t.push(State::Killed, Cause::User);
            die(t, "killed", actions);
        }
        State::Killed => {
            die(t, "killed", actions);
        }
        state if state.is_really_running() => {
            match t.run_handle().cloned() {
                Some(handle) => {
                    t.push(State::TriedToKill, Cause::User);
                    actions.push(Action::Kill(handle));
                }
                None => {
                    t.push(State::Killed, Cause::User);
                    die(t, "killed", actions);
                }
            }
        }
        // Not started yet (or already past its run): short-circuit.
        _ => {
            t.push(State::Killed, Cause::User);
            die(t, "killed before running", actions);
        }
    }
}

/// Terminal failure: append `Dead` and activate the fallback branches
/// exactly once, at this instant.
fn die(t: &mut Target, reason: &str, actions: &mut Vec<Action>) {
    t.push(State::Dead(reason.to_string()), Cause::engine(reason));
    for id in &t.if_fails_activate {
        actions.push(Action::Activate {
            id: id.clone(),
            cause: Cause::FallbackOf(t.id.clone()),
        });
    }
}
