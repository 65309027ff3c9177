// src/errors.rs

//! Crate-wide error types.
//!
//! Environmental failures (SSH hiccups, probe timeouts, spawn errors) are
//! *not* represented here: they are [`EnvError`](crate::exec::EnvError)
//! values that flow into the automaton as observations and become state
//! transitions. This enum covers everything that surfaces to callers of the
//! store, the protocol dispatcher, and the engine itself.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverseerError {
    #[error("target not found: {0}")]
    NotFound(String),

    /// A concurrent writer touched a row between our read and our commit.
    /// The engine is single-writer by contract; the store retries once and
    /// promotes a second occurrence to [`OverseerError::Fatal`].
    #[error("concurrent store write detected on target {0}")]
    Conflict(String),

    #[error("process failed: {0}")]
    ProcessFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("authentication failed")]
    AuthError,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invariant violation. The driver loop aborts on this and nothing else.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OverseerError>;
