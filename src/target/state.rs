// src/target/state.rs

//! Lifecycle states and the append-only state history.
//!
//! Every transition appends a [`StateEntry`] carrying the new state, a
//! strictly increasing timestamp, the [`Cause`] of the transition, and the
//! successive-failure counter. Terminal entries (`Successful`, `Dead`) end
//! the history for good.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{Host, TargetId};

/// Handle to a started process, interpreted by the executor that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub host: Host,
    /// Executor-scoped token (pid file, LSF job id, local registry key...).
    pub token: String,
}

/// Principal lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Known but not activated.
    #[serde(rename = "Passive")]
    Passive,
    /// Activated; dependencies not yet resolved.
    #[serde(rename = "Activable")]
    Activable,
    /// Ready to evaluate the next step.
    #[serde(rename = "Active")]
    Active,
    /// Pre-run condition probe in flight.
    #[serde(rename = "Tried_to_evaluate_condition")]
    TriedToEvaluateCondition,
    /// Condition held before running.
    #[serde(rename = "Already_done")]
    AlreadyDone,
    /// Dependencies ensured; about to start.
    #[serde(rename = "Building")]
    Building,
    /// Start in flight.
    #[serde(rename = "Tried_to_start")]
    TriedToStart,
    /// Long-running process active.
    #[serde(rename = "Started_running")]
    StartedRunning(RunHandle),
    /// Process probe in flight.
    #[serde(rename = "Tried_to_check_process")]
    TriedToCheckProcess,
    /// Process reported success; condition re-check pending.
    #[serde(rename = "Ran_successfully")]
    RanSuccessfully,
    /// Condition held after the run.
    #[serde(rename = "Verified_success")]
    VerifiedSuccess,
    /// Terminal success.
    #[serde(rename = "Successful")]
    Successful,
    /// Process reported failure.
    #[serde(rename = "Failed_running")]
    FailedRunning(String),
    /// Process succeeded but the condition still does not hold.
    #[serde(rename = "Failed_to_verify_success")]
    FailedToVerifySuccess,
    /// One or more dependencies are dead.
    #[serde(rename = "Failed_from_dependencies")]
    FailedFromDependencies,
    /// Kill requested.
    #[serde(rename = "Tried_to_kill")]
    TriedToKill,
    /// Kill in flight.
    #[serde(rename = "Killing")]
    Killing,
    /// Termination confirmed.
    #[serde(rename = "Killed")]
    Killed,
    /// Terminal failure or kill, with the terminating cause.
    #[serde(rename = "Dead")]
    Dead(String),
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Successful | State::Dead(_))
    }

    /// The process is actually running on some host right now.
    pub fn is_really_running(&self) -> bool {
        matches!(
            self,
            State::StartedRunning(_) | State::TriedToCheckProcess
        )
    }

    /// Wire tag of the state, as used in flat-state listings.
    pub fn tag(&self) -> &'static str {
        match self {
            State::Passive => "Passive",
            State::Activable => "Activable",
            State::Active => "Active",
            State::TriedToEvaluateCondition => "Tried_to_evaluate_condition",
            State::AlreadyDone => "Already_done",
            State::Building => "Building",
            State::TriedToStart => "Tried_to_start",
            State::StartedRunning(_) => "Started_running",
            State::TriedToCheckProcess => "Tried_to_check_process",
            State::RanSuccessfully => "Ran_successfully",
            State::VerifiedSuccess => "Verified_success",
            State::Successful => "Successful",
            State::FailedRunning(_) => "Failed_running",
            State::FailedToVerifySuccess => "Failed_to_verify_success",
            State::FailedFromDependencies => "Failed_from_dependencies",
            State::TriedToKill => "Tried_to_kill",
            State::Killing => "Killing",
            State::Killed => "Killed",
            State::Dead(_) => "Dead",
        }
    }

    /// Coarse status used by the `Simple` query filter.
    pub fn simple_status(&self) -> SimpleStatus {
        match self {
            State::Passive | State::Activable => SimpleStatus::Activable,
            State::Successful => SimpleStatus::Successful,
            State::Dead(_) => SimpleStatus::Failed,
            _ => SimpleStatus::InProgress,
        }
    }
}

/// Four-valued status exposed to query filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimpleStatus {
    #[serde(rename = "Activable")]
    Activable,
    #[serde(rename = "In_progress")]
    InProgress,
    #[serde(rename = "Successful")]
    Successful,
    #[serde(rename = "Failed")]
    Failed,
}

/// Why a transition happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cause {
    /// Explicit client action (activation, kill, restart).
    #[serde(rename = "User")]
    User,
    /// Activated because the named target depends on this one.
    #[serde(rename = "Dependency_of")]
    DependencyOf(TargetId),
    /// Activated as a failure fallback of the named target.
    #[serde(rename = "Fallback_of")]
    FallbackOf(TargetId),
    /// Driver-internal transition with a human-readable reason.
    #[serde(rename = "Engine")]
    Engine(String),
}

impl Cause {
    pub fn engine(reason: impl Into<String>) -> Self {
        Cause::Engine(reason.into())
    }
}

/// One entry of a target's lifecycle history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: State,
    pub at: DateTime<Utc>,
    pub cause: Cause,
    /// Successive non-fatal failure cycles so far.
    pub attempts: u32,
}

impl StateEntry {
    /// The entry every fresh target starts with.
    pub fn initial() -> Self {
        Self {
            state: State::Passive,
            at: Utc::now(),
            cause: Cause::engine("created"),
            attempts: 0,
        }
    }

    /// Build the successor of `prev`, forcing a strictly later timestamp so
    /// the history stays totally ordered even if the clock stalls.
    pub fn after(prev: &StateEntry, state: State, cause: Cause, attempts: u32) -> Self {
        let now = Utc::now();
        let floor = prev.at + Duration::microseconds(1);
        Self {
            state,
            at: if now > floor { now } else { floor },
            cause,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_successful_and_dead() {
        assert!(State::Successful.is_terminal());
        assert!(State::Dead("x".into()).is_terminal());
        assert!(!State::Killed.is_terminal());
        assert!(!State::FailedRunning("x".into()).is_terminal());
    }

    #[test]
    fn simple_status_mapping() {
        assert_eq!(State::Passive.simple_status(), SimpleStatus::Activable);
        assert_eq!(State::Activable.simple_status(), SimpleStatus::Activable);
        assert_eq!(State::Successful.simple_status(), SimpleStatus::Successful);
        assert_eq!(
            State::Dead("why".into()).simple_status(),
            SimpleStatus::Failed
        );
        assert_eq!(State::Building.simple_status(), SimpleStatus::InProgress);
        assert_eq!(State::Killing.simple_status(), SimpleStatus::InProgress);
    }

    #[test]
    fn successor_entries_never_share_a_timestamp() {
        let first = StateEntry::initial();
        let second = StateEntry::after(&first, State::Activable, Cause::User, 0);
        let third = StateEntry::after(&second, State::Active, Cause::engine("ok"), 0);
        assert!(second.at > first.at);
        assert!(third.at > second.at);
    }

    #[test]
    fn state_serde_uses_wire_tags() {
        let json = serde_json::to_string(&State::TriedToEvaluateCondition).unwrap();
        assert_eq!(json, "\"Tried_to_evaluate_condition\"");
        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, State::TriedToEvaluateCondition);

        let dead = serde_json::to_string(&State::Dead("reason".into())).unwrap();
        assert_eq!(dead, "{\"Dead\":\"reason\"}");
    }
}
