// src/config/model.rs

//! Configuration data model.
//!
//! The config file is JSON: a map of named profiles. One profile is selected
//! at startup by `--profile` or the `OVERSEER_PROFILE` environment variable;
//! a file with a single profile needs no selection.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::automaton::FailurePolicy;

/// Raw config file as deserialized, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfigFile {
    pub profiles: BTreeMap<String, Profile>,
}

/// One named profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// SQL-like URI for the target store, e.g. `sqlite:./overseer.db`.
    pub database_parameters: String,

    #[serde(default)]
    pub turn_unix_ssh_failure_into_target_failure: bool,
    #[serde(default = "default_max_attempts")]
    pub maximum_successive_attempts: u32,

    #[serde(default = "default_concurrent_steps")]
    pub concurrent_automaton_steps: usize,
    #[serde(default = "default_batch_size")]
    pub engine_step_batch_size: usize,
    #[serde(default = "default_orphan_wait")]
    pub orphan_killing_wait_secs: f64,
    #[serde(default = "default_host_timeout")]
    pub host_timeout_upper_bound_secs: f64,

    pub listen: ListenConfig,
    #[serde(default)]
    pub tokens: Vec<AuthToken>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub return_error_messages: bool,
    #[serde(default = "default_max_blocking")]
    pub max_blocking_time_secs: f64,
    #[serde(default = "default_deferred_threshold")]
    pub deferred_threshold: usize,

    /// Administrative named pipe, read line by line.
    #[serde(default)]
    pub command_pipe: Option<String>,
    /// Directory for the debug log file and periodic JSON dumps.
    #[serde(default)]
    pub log_path: Option<String>,
}

/// Listen socket: plain TCP port, or TLS cert/key/port. TLS termination is
/// delegated to the fronting plumbing; the engine records the mode for the
/// status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub certificate: String,
    pub key: String,
}

/// One authorized client token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub name: String,
    /// Opaque secret over `A-Za-z0-9_=-`.
    pub secret: String,
}

impl Profile {
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            maximum_successive_attempts: self.maximum_successive_attempts,
            turn_unix_ssh_failure_into_target_failure: self
                .turn_unix_ssh_failure_into_target_failure,
        }
    }

    pub fn orphan_killing_wait(&self) -> Duration {
        Duration::from_secs_f64(self.orphan_killing_wait_secs)
    }

    pub fn host_timeout_upper_bound(&self) -> Duration {
        Duration::from_secs_f64(self.host_timeout_upper_bound_secs)
    }

    pub fn max_blocking_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_blocking_time_secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_concurrent_steps() -> usize {
    4
}

fn default_batch_size() -> usize {
    500
}

fn default_orphan_wait() -> f64 {
    120.0
}

fn default_host_timeout() -> f64 {
    60.0
}

fn default_max_blocking() -> f64 {
    30.0
}

fn default_deferred_threshold() -> usize {
    1000
}

fn default_true() -> bool {
    true
}
