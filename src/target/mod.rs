// src/target/mod.rs

//! The target model: the unit of work the engine schedules.
//!
//! A target is a node in a dependency DAG. It carries descriptive fields the
//! engine treats as opaque (`name`, `tags`, `metadata`), the edges that drive
//! scheduling (`dependencies`, `if_fails_activate`), the prescription for the
//! work itself ([`BuildProcess`]), an optional readiness [`Condition`], a
//! deduplication policy ([`Equivalence`]), and its full append-only state
//! history (see [`state`]).
//!
//! Targets reference each other by id only; the store owns every node and
//! there are no direct pointers between them.

pub mod query;
pub mod state;

use serde::{Deserialize, Serialize};

pub use state::{Cause, RunHandle, SimpleStatus, State, StateEntry};

/// Canonical target id type used throughout the engine.
pub type TargetId = String;

/// Host designator, interpreted by the executor ("localhost", "ssh://...").
pub type Host = String;

/// Readiness predicate probed on a host. If it holds before the target runs,
/// the target is already done; after a successful run it must hold for the
/// run to count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// The file exists on the host.
    #[serde(rename = "File_exists")]
    FileExists { host: Host, path: String },
    /// The file exists and is at least `size` bytes.
    #[serde(rename = "File_size_at_least")]
    FileSizeAtLeast { host: Host, path: String, size: u64 },
    /// Conjunction: every sub-condition holds.
    #[serde(rename = "All")]
    All(Vec<Condition>),
}

/// The prescription for doing the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildProcess {
    /// Nothing to run; the target exists for its condition and edges.
    #[serde(rename = "No_operation")]
    NoOperation,
    /// Short synchronous command run on a host.
    #[serde(rename = "Direct_command")]
    DirectCommand { host: Host, program: String },
    /// Long-running job managed by a named plugin (daemonize, LSF, ...).
    /// The payload is opaque to the engine and interpreted by the plugin.
    #[serde(rename = "Long_running")]
    LongRunning {
        plugin: String,
        payload: serde_json::Value,
    },
}

/// Deduplication policy applied at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Equivalence {
    /// Never collapse onto another target.
    #[serde(rename = "None")]
    #[default]
    None,
    /// Collapse onto an alive target with structurally equal build process
    /// and condition.
    #[serde(rename = "Same_make_and_condition")]
    SameMakeAndCondition,
}

/// Descriptor of the artifact a target produces. Used by downstream queries;
/// the automaton never reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub host: Host,
    pub path: String,
}

/// A workflow node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Immutable unique identifier. Never reused, never changed.
    pub id: TargetId,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Ids this target requires to be `Successful` before it runs.
    #[serde(default)]
    pub dependencies: Vec<TargetId>,
    /// Ids activated exactly once if this target dies.
    #[serde(default)]
    pub if_fails_activate: Vec<TargetId>,
    #[serde(default)]
    pub equivalence: Equivalence,
    #[serde(default)]
    pub condition: Option<Condition>,
    pub build_process: BuildProcess,
    #[serde(default)]
    pub product: Option<Product>,
    /// Append-only lifecycle history; the last entry is the current state.
    pub history: Vec<StateEntry>,
}

impl Target {
    /// A fresh passive target with the given id and name.
    pub fn new(id: impl Into<TargetId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: Vec::new(),
            metadata: None,
            dependencies: Vec::new(),
            if_fails_activate: Vec::new(),
            equivalence: Equivalence::None,
            condition: None,
            build_process: BuildProcess::NoOperation,
            product: None,
            history: vec![StateEntry::initial()],
        }
    }

    /// Current (latest) state entry. The history is never empty.
    pub fn current(&self) -> &StateEntry {
        self.history.last().expect("target history is never empty")
    }

    pub fn state(&self) -> &State {
        &self.current().state
    }

    /// `Successful` or `Dead`: no further transitions.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Non-terminal.
    pub fn is_alive(&self) -> bool {
        !self.is_terminal()
    }

    /// Activated and alive: participates in driver batches.
    pub fn is_active(&self) -> bool {
        self.is_alive() && !matches!(self.state(), State::Passive)
    }

    /// Successive-failure counter carried on the current entry.
    pub fn attempts(&self) -> u32 {
        self.current().attempts
    }

    /// Append a transition, preserving the current attempts counter.
    ///
    /// Timestamps are forced strictly increasing even under clock jitter.
    /// Appending to a terminal target is an engine bug.
    pub fn push(&mut self, state: State, cause: Cause) {
        debug_assert!(!self.is_terminal(), "transition after terminal state");
        let attempts = self.attempts();
        self.push_with_attempts(state, cause, attempts);
    }

    /// Append a transition with an explicit attempts counter.
    pub fn push_with_attempts(&mut self, state: State, cause: Cause, attempts: u32) {
        let entry = StateEntry::after(self.current(), state, cause, attempts);
        self.history.push(entry);
    }

    /// Activate a passive target. No-op otherwise (activation is exactly-once
    /// per cause path; the caller checks nothing).
    pub fn activate(&mut self, cause: Cause) {
        if matches!(self.state(), State::Passive) {
            self.push(State::Activable, cause);
        }
    }

    /// Whether any activation in the history was user-initiated.
    pub fn activated_by_user(&self) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e.state, State::Activable) && matches!(e.cause, Cause::User))
    }

    /// Whether this target was activated as somebody's dependency and nothing
    /// else (the orphan sweep reaps such targets when unreachable).
    pub fn activated_as_dependency_only(&self) -> bool {
        let mut saw_dependency = false;
        for e in &self.history {
            if matches!(e.state, State::Activable) {
                match e.cause {
                    Cause::DependencyOf(_) => saw_dependency = true,
                    _ => return false,
                }
            }
        }
        saw_dependency
    }

    /// The run handle of the most recent start, if any.
    pub fn run_handle(&self) -> Option<&RunHandle> {
        self.history.iter().rev().find_map(|e| match &e.state {
            State::StartedRunning(h) => Some(h),
            _ => None,
        })
    }

    /// Whether the history passed through `Failed_from_dependencies`.
    pub fn failed_from_dependencies(&self) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e.state, State::FailedFromDependencies))
    }

    /// Creation time (first history entry).
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.history[0].at
    }

    /// Time of the terminal entry, if terminal.
    pub fn finished_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        if self.is_terminal() {
            Some(self.current().at)
        } else {
            None
        }
    }

    /// Coarse four-valued status used by query filters.
    pub fn simple_status(&self) -> SimpleStatus {
        self.state().simple_status()
    }

    /// Canonical key for equivalence indexing: the JSON of
    /// `(build_process, condition)`. Only targets opting into
    /// `Same_make_and_condition` carry a key; `None`-policy targets are
    /// neither canonical nor candidates.
    pub fn equivalence_key(&self) -> Option<String> {
        match self.equivalence {
            Equivalence::None => None,
            Equivalence::SameMakeAndCondition => Some(
                serde_json::to_string(&(&self.build_process, &self.condition))
                    .expect("build process and condition serialize"),
            ),
        }
    }

    /// Structural equivalence check per the candidate's policy.
    pub fn is_equivalent_to(&self, other: &Target) -> bool {
        match self.equivalence {
            Equivalence::None => false,
            Equivalence::SameMakeAndCondition => {
                other.equivalence == Equivalence::SameMakeAndCondition
                    && self.build_process == other.build_process
                    && self.condition == other.condition
            }
        }
    }
}
