// src/exec/mod.rs

//! Pluggable host-executor abstraction.
//!
//! The automaton only ever talks to a [`HostExecutor`]: probe a readiness
//! condition, start a build process, probe or kill a running handle, plan a
//! file copy. Production deployments plug in transport implementations (SSH
//! client, batch submission); this crate ships [`LocalExecutor`] for
//! `localhost` work, and the tests use a scripted fake.
//!
//! Every call either succeeds or fails with a *classified* [`EnvError`];
//! classification drives the engine's retry policy, so executors must not
//! panic or surface transport errors any other way.

pub mod local;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::target::{BuildProcess, Condition, Host, RunHandle};

pub use local::LocalExecutor;

/// Boxed future alias used by the executor trait.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Classification of an environmental failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvErrorKind {
    #[serde(rename = "Unix_error")]
    Unix,
    #[serde(rename = "Start_error")]
    Start,
    #[serde(rename = "Probe_error")]
    Probe,
    #[serde(rename = "Kill_error")]
    Kill,
}

/// A unix/ssh-level failure. Whether it is a non-fatal retry or counts
/// toward the target's death is the automaton's decision, not the
/// executor's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvError {
    pub kind: EnvErrorKind,
    pub message: String,
}

impl EnvError {
    pub fn new(kind: EnvErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unix(message: impl Into<String>) -> Self {
        Self::new(EnvErrorKind::Unix, message)
    }

    pub fn start(message: impl Into<String>) -> Self {
        Self::new(EnvErrorKind::Start, message)
    }

    pub fn probe(message: impl Into<String>) -> Self {
        Self::new(EnvErrorKind::Probe, message)
    }

    pub fn kill(message: impl Into<String>) -> Self {
        Self::new(EnvErrorKind::Kill, message)
    }
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            EnvErrorKind::Unix => "Unix_error",
            EnvErrorKind::Start => "Start_error",
            EnvErrorKind::Probe => "Probe_error",
            EnvErrorKind::Kill => "Kill_error",
        };
        write!(f, "{kind}: {}", self.message)
    }
}

/// Result of probing a running handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    #[serde(rename = "Still_running")]
    StillRunning,
    #[serde(rename = "Finished_successfully")]
    FinishedSuccessfully,
    #[serde(rename = "Finished_with_failure")]
    FinishedWithFailure(String),
}

/// Capability set the automaton requires of a host transport.
///
/// Implementations may suspend (SSH round-trips, batch queries); the driver
/// wraps every call in a timeout bounded by the configured
/// `host_timeout_upper_bound`.
pub trait HostExecutor: Send + Sync {
    /// Synchronous probe of a readiness condition. Hosts travel inside the
    /// condition descriptor.
    fn check_condition<'a>(&'a self, condition: &'a Condition)
        -> ExecFuture<'a, Result<bool, EnvError>>;

    /// Launch a build process, returning a handle for later probes.
    fn start<'a>(&'a self, process: &'a BuildProcess)
        -> ExecFuture<'a, Result<RunHandle, EnvError>>;

    /// Probe a previously started process.
    fn probe<'a>(&'a self, handle: &'a RunHandle)
        -> ExecFuture<'a, Result<ProcessStatus, EnvError>>;

    /// Terminate a previously started process.
    fn kill<'a>(&'a self, handle: &'a RunHandle) -> ExecFuture<'a, Result<(), EnvError>>;

    /// Plan a file transfer: returns a `(host, program)` pair the caller can
    /// run on an appropriate host. Pure planning, no IO.
    fn copy_files(
        &self,
        src_host: &Host,
        files: &[String],
        dst_host: &Host,
        dst_path: &str,
    ) -> (Host, String);

    /// Diagnostic hook backing the `Process` wire subprotocol. Transport
    /// implementations expose their connection management here; executors
    /// without one answer with an error payload.
    fn diagnostic<'a>(
        &'a self,
        payload: &'a serde_json::Value,
    ) -> ExecFuture<'a, Result<serde_json::Value, EnvError>>;
}
