// src/server/mod.rs

//! HTTP protocol surface.
//!
//! One authenticated `POST /api` route carries the versioned JSON envelope;
//! `GET /health` answers unauthenticated. TLS termination is delegated to
//! the fronting plumbing (the profile records the mode for the status
//! report); the engine itself listens on plain TCP.
//!
//! Dispatch translates `Up_message`s into engine/store operations and wraps
//! the results in `Down_message`s. Errors never escape as HTTP failures:
//! auth and protocol problems become `Error` replies (detail gated by
//! `return_error_messages`), per-query problems become `Query_error`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Profile;
use crate::engine::{Engine, EngineCommand};
use crate::errors::{OverseerError, Result};
use crate::protocol::{
    DownEnvelope, DownMessage, QueryOption, ServerStatus, TlsBackend, UpEnvelope, UpMessage,
};
use crate::target::TargetId;

/// Shared request-handling state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub cmd_tx: mpsc::Sender<EngineCommand>,
    inner: Arc<Inner>,
}

struct Inner {
    /// `name -> secret`; empty means authentication is disabled.
    tokens: HashMap<String, String>,
    read_only: bool,
    return_error_messages: bool,
    max_blocking_time: Duration,
    deferred_threshold: usize,
    tls: TlsBackend,
    /// Deferred id lists by server-generated token. In-memory only: engine
    /// restarts invalidate every token and clients re-issue their query.
    deferred: Mutex<HashMap<String, Vec<TargetId>>>,
}

impl AppState {
    pub fn new(
        engine: Arc<Engine>,
        cmd_tx: mpsc::Sender<EngineCommand>,
        profile: &Profile,
    ) -> Self {
        if profile.tokens.is_empty() {
            warn!("no authentication tokens configured; the API is open");
        }
        let tls = if profile.listen.tls.is_some() {
            TlsBackend::Native
        } else {
            TlsBackend::None
        };
        Self {
            engine,
            cmd_tx,
            inner: Arc::new(Inner {
                tokens: profile
                    .tokens
                    .iter()
                    .map(|t| (t.name.clone(), t.secret.clone()))
                    .collect(),
                read_only: profile.read_only,
                return_error_messages: profile.return_error_messages,
                max_blocking_time: profile.max_blocking_time(),
                deferred_threshold: profile.deferred_threshold,
                tls,
                deferred: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn authenticated(&self, headers: &HeaderMap) -> bool {
        if self.inner.tokens.is_empty() {
            return true;
        }
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(secret) => self.inner.tokens.values().any(|s| s == secret),
            None => false,
        }
    }

    fn error_reply(&self, error: &OverseerError) -> DownMessage {
        if self.inner.return_error_messages {
            DownMessage::Error(error.to_string())
        } else {
            DownMessage::Error("request failed".into())
        }
    }

    fn defer_if_large(&self, ids: Vec<TargetId>) -> DownMessage {
        if ids.len() <= self.inner.deferred_threshold {
            return DownMessage::ListOfTargetIds(ids);
        }
        let token = uuid::Uuid::new_v4().to_string();
        let total = ids.len();
        self.inner
            .deferred
            .lock()
            .unwrap()
            .insert(token.clone(), ids);
        debug!(%token, total, "deferring large id list");
        DownMessage::DeferredListOfTargetIds { id: token, total }
    }

    pub fn deferred_count(&self) -> usize {
        self.inner.deferred.lock().unwrap().len()
    }

    /// Blocking deadline from `Block_if_empty_at_most`, clamped to the
    /// configured maximum.
    fn blocking_window(&self, options: &[QueryOption]) -> Option<Duration> {
        options.iter().find_map(|o| match o {
            QueryOption::BlockIfEmptyAtMost(secs) => Some(
                Duration::from_secs_f64((*secs).max(0.0)).min(self.inner.max_blocking_time),
            ),
        })
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api", post(api))
        .with_state(state)
}

/// Bind and serve until the process stops.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "protocol server listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| OverseerError::Fatal(format!("server failed: {e}")))
}

async fn health() -> &'static str {
    "ok"
}

async fn api(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Json<serde_json::Value>,
) -> Json<DownEnvelope> {
    if !state.authenticated(&headers) {
        return Json(DownEnvelope::V0(state.error_reply(&OverseerError::AuthError)));
    }

    let envelope: UpEnvelope = match serde_json::from_value(body.0) {
        Ok(e) => e,
        Err(e) => {
            let err = OverseerError::ProtocolError(format!("undecodable request: {e}"));
            return Json(DownEnvelope::V0(state.error_reply(&err)));
        }
    };
    let UpEnvelope::V0(message) = envelope;

    if state.inner.read_only && message.is_mutation() {
        let err = OverseerError::ProtocolError("server is in read-only mode".into());
        return Json(DownEnvelope::V0(state.error_reply(&err)));
    }

    let reply = match dispatch(&state, message).await {
        Ok(down) => down,
        Err(e) => state.error_reply(&e),
    };
    Json(DownEnvelope::V0(reply))
}

/// Translate one request into engine operations.
pub async fn dispatch(state: &AppState, message: UpMessage) -> Result<DownMessage> {
    let engine = &state.engine;
    match message {
        UpMessage::GetTargets(ids) => {
            Ok(DownMessage::ListOfTargets(engine.get_targets(&ids).await?))
        }
        UpMessage::GetTargetSummaries(ids) => Ok(DownMessage::ListOfTargetSummaries(
            engine.get_target_summaries(&ids).await?,
        )),
        UpMessage::GetTargetFlatStates { time, ids, options } => {
            let deadline = state.blocking_window(&options).map(|w| tokio::time::Instant::now() + w);
            let mut revision = engine.revision();
            loop {
                let states = engine.get_target_flat_states(time, &ids).await?;
                let nonempty = states.iter().any(|s| !s.entries.is_empty());
                match deadline {
                    Some(d) if !nonempty => {
                        if !wait_for_commit(&mut revision, d).await {
                            return Ok(DownMessage::ListOfTargetFlatStates(states));
                        }
                    }
                    _ => return Ok(DownMessage::ListOfTargetFlatStates(states)),
                }
            }
        }
        UpMessage::GetAvailableQueries(id) => Ok(DownMessage::ListOfQueryDescriptions(
            engine.available_queries(&id).await?,
        )),
        UpMessage::CallQuery { id, query } => match engine.call_query(&id, &query).await {
            Ok(result) => Ok(DownMessage::QueryResult(result)),
            Err(e) => Ok(DownMessage::QueryError(e.to_string())),
        },
        UpMessage::SubmitTargets(targets) => {
            engine.submit_targets(targets).await?;
            Ok(DownMessage::Ok)
        }
        UpMessage::KillTargets(ids) => {
            engine.kill_targets(&ids).await?;
            Ok(DownMessage::Ok)
        }
        UpMessage::RestartTargets(ids) => {
            engine.restart_targets(&ids).await?;
            Ok(DownMessage::Ok)
        }
        UpMessage::GetTargetIds { query, options } => {
            let deadline = state.blocking_window(&options).map(|w| tokio::time::Instant::now() + w);
            let mut revision = engine.revision();
            loop {
                let ids = engine.query_target_ids(&query).await?;
                match deadline {
                    Some(d) if ids.is_empty() => {
                        if !wait_for_commit(&mut revision, d).await {
                            return Ok(DownMessage::ListOfTargetIds(ids));
                        }
                    }
                    _ => return Ok(state.defer_if_large(ids)),
                }
            }
        }
        UpMessage::GetServerStatus => {
            let (alive, active) = engine.status_gauges().await?;
            Ok(DownMessage::ServerStatus(ServerStatus {
                time: Utc::now().timestamp() as f64,
                read_only: state.inner.read_only,
                tls: state.inner.tls,
                database: engine.database_parameters().to_string(),
                alive_targets: alive,
                activable_targets: active,
                engine_step_batch_size: engine.batch_size,
                concurrent_automaton_steps: engine.concurrent_steps,
                deferred_lists: state.deferred_count(),
            }))
        }
        UpMessage::GetDeferred { id, index, length } => {
            let deferred = state.inner.deferred.lock().unwrap();
            match deferred.get(&id) {
                None => Ok(DownMessage::MissingDeferred),
                Some(ids) => {
                    let slice: Vec<TargetId> = ids
                        .iter()
                        .skip(index)
                        .take(length)
                        .cloned()
                        .collect();
                    Ok(DownMessage::ListOfTargetIds(slice))
                }
            }
        }
        UpMessage::Process(payload) => {
            let answer = engine.process_diagnostic(&payload).await?;
            Ok(DownMessage::Process(answer))
        }
    }
}

/// Wait for the next committed batch, up to `deadline`. Returns `false`
/// when the deadline passed (or the engine is gone) without a commit.
async fn wait_for_commit(
    revision: &mut tokio::sync::watch::Receiver<u64>,
    deadline: tokio::time::Instant,
) -> bool {
    matches!(
        tokio::time::timeout_at(deadline, revision.changed()).await,
        Ok(Ok(()))
    )
}
