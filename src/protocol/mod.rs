// src/protocol/mod.rs

//! Client wire protocol.
//!
//! Request/response JSON bodies. Both directions are closed sums with
//! externally tagged serde encodings, so a request looks like
//! `{"V0": {"Get_targets": ["id1"]}}` on the wire. Readers accept any known
//! envelope version; writers emit the current one.

use serde::{Deserialize, Serialize};

use crate::target::query::TargetQuery;
use crate::target::{SimpleStatus, Target, TargetId};

/// Versioned request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpEnvelope {
    V0(UpMessage),
}

/// Versioned response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownEnvelope {
    V0(DownMessage),
}

/// Options attached to listing queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOption {
    /// Wait up to this many seconds (bounded by the server's
    /// `max_blocking_time`) for a non-empty result before answering.
    #[serde(rename = "Block_if_empty_at_most")]
    BlockIfEmptyAtMost(f64),
}

/// Time selector for flat-state queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum TimeSpec {
    #[serde(rename = "All")]
    #[default]
    All,
    /// Only history entries at or after this Unix time.
    #[serde(rename = "Since")]
    Since(f64),
}

/// Request messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpMessage {
    /// Empty id list means "all targets".
    #[serde(rename = "Get_targets")]
    GetTargets(Vec<TargetId>),
    #[serde(rename = "Get_target_summaries")]
    GetTargetSummaries(Vec<TargetId>),
    #[serde(rename = "Get_target_flat_states")]
    GetTargetFlatStates {
        time: TimeSpec,
        ids: Vec<TargetId>,
        options: Vec<QueryOption>,
    },
    #[serde(rename = "Get_available_queries")]
    GetAvailableQueries(TargetId),
    #[serde(rename = "Call_query")]
    CallQuery { id: TargetId, query: String },
    #[serde(rename = "Submit_targets")]
    SubmitTargets(Vec<Target>),
    #[serde(rename = "Kill_targets")]
    KillTargets(Vec<TargetId>),
    #[serde(rename = "Restart_targets")]
    RestartTargets(Vec<TargetId>),
    #[serde(rename = "Get_target_ids")]
    GetTargetIds {
        query: TargetQuery,
        options: Vec<QueryOption>,
    },
    #[serde(rename = "Get_server_status")]
    GetServerStatus,
    /// Paginate a previously deferred id list.
    #[serde(rename = "Get_deferred")]
    GetDeferred {
        id: String,
        index: usize,
        length: usize,
    },
    /// Diagnostic SSH/process subprotocol; opaque to the engine, answered by
    /// the executor's diagnostic hook.
    #[serde(rename = "Process")]
    Process(serde_json::Value),
}

impl UpMessage {
    /// Whether the message mutates engine state (rejected in read-only
    /// mode). `Call_query` stays dispatchable: the built-in queries are
    /// pure reads, and a side-effecting plugin query fails individually
    /// with a `Query_error` rather than blocking queries as a class.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            UpMessage::SubmitTargets(_)
                | UpMessage::KillTargets(_)
                | UpMessage::RestartTargets(_)
        )
    }
}

/// Response messages, mirroring the requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownMessage {
    #[serde(rename = "List_of_targets")]
    ListOfTargets(Vec<Target>),
    #[serde(rename = "List_of_target_summaries")]
    ListOfTargetSummaries(Vec<TargetSummary>),
    #[serde(rename = "List_of_target_flat_states")]
    ListOfTargetFlatStates(Vec<TargetFlatStates>),
    #[serde(rename = "List_of_target_ids")]
    ListOfTargetIds(Vec<TargetId>),
    /// The full result exceeded the server's threshold; paginate with
    /// `Get_deferred`.
    #[serde(rename = "Deferred_list_of_target_ids")]
    DeferredListOfTargetIds { id: String, total: usize },
    #[serde(rename = "List_of_query_descriptions")]
    ListOfQueryDescriptions(Vec<QueryDescription>),
    #[serde(rename = "Query_result")]
    QueryResult(String),
    #[serde(rename = "Query_error")]
    QueryError(String),
    #[serde(rename = "Server_status")]
    ServerStatus(ServerStatus),
    #[serde(rename = "Ok")]
    Ok,
    /// The deferred token expired (engine restart); re-issue the query.
    #[serde(rename = "Missing_deferred")]
    MissingDeferred,
    #[serde(rename = "Process")]
    Process(serde_json::Value),
    #[serde(rename = "Error")]
    Error(String),
}

/// Compact projection of a target for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub id: TargetId,
    pub name: String,
    pub tags: Vec<String>,
    /// Current state wire tag (`"Started_running"`, ...).
    pub state: String,
    pub status: SimpleStatus,
}

impl TargetSummary {
    pub fn of_target(t: &Target) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            tags: t.tags.clone(),
            state: t.state().tag().to_string(),
            status: t.simple_status(),
        }
    }
}

/// Flattened state history of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetFlatStates {
    pub id: TargetId,
    pub entries: Vec<FlatStateEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatStateEntry {
    /// State wire tag.
    pub state: String,
    /// Unix seconds.
    pub time: f64,
    /// Payload of the state, when it carries one (failure reason, handle
    /// token).
    pub message: Option<String>,
    pub attempts: u32,
}

impl TargetFlatStates {
    /// Flatten a target's history, keeping entries at or after `since`.
    pub fn of_target(t: &Target, since: Option<f64>) -> Self {
        use crate::target::State;

        let entries = t
            .history
            .iter()
            .filter_map(|e| {
                let time = e.at.timestamp() as f64
                    + f64::from(e.at.timestamp_subsec_micros()) / 1e6;
                if let Some(cutoff) = since {
                    if time < cutoff {
                        return None;
                    }
                }
                let message = match &e.state {
                    State::FailedRunning(r) | State::Dead(r) => Some(r.clone()),
                    State::StartedRunning(h) => Some(h.token.clone()),
                    _ => None,
                };
                Some(FlatStateEntry {
                    state: e.state.tag().to_string(),
                    time,
                    message,
                    attempts: e.attempts,
                })
            })
            .collect();

        Self {
            id: t.id.clone(),
            entries,
        }
    }
}

/// A named per-target query (`Get_available_queries` / `Call_query`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescription {
    pub name: String,
    pub description: String,
}

/// TLS backend in use, reported in the server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsBackend {
    #[serde(rename = "OpenSSL")]
    OpenSsl,
    #[serde(rename = "Native")]
    Native,
    #[serde(rename = "None")]
    None,
}

/// Engine status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Unix seconds at the time of the reply.
    pub time: f64,
    pub read_only: bool,
    pub tls: TlsBackend,
    pub database: String,
    pub alive_targets: u64,
    pub activable_targets: u64,
    pub engine_step_batch_size: usize,
    pub concurrent_automaton_steps: usize,
    pub deferred_lists: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::query::{Filter, StringPredicate, TargetQuery, TimeConstraint};

    fn roundtrip_up(msg: UpMessage) {
        let wire = serde_json::to_string(&UpEnvelope::V0(msg.clone())).unwrap();
        let back: UpEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, UpEnvelope::V0(msg));
    }

    fn roundtrip_down(msg: DownMessage) {
        let wire = serde_json::to_string(&DownEnvelope::V0(msg.clone())).unwrap();
        let back: DownEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, DownEnvelope::V0(msg));
    }

    #[test]
    fn envelopes_are_versioned() {
        let wire = serde_json::to_string(&UpEnvelope::V0(UpMessage::GetServerStatus)).unwrap();
        assert_eq!(wire, "{\"V0\":\"Get_server_status\"}");
    }

    #[test]
    fn up_messages_roundtrip() {
        roundtrip_up(UpMessage::GetTargets(vec![]));
        roundtrip_up(UpMessage::GetTargets(vec!["a".into(), "b".into()]));
        roundtrip_up(UpMessage::KillTargets(vec!["a".into()]));
        roundtrip_up(UpMessage::GetDeferred {
            id: "tok".into(),
            index: 10,
            length: 50,
        });
        roundtrip_up(UpMessage::GetTargetFlatStates {
            time: TimeSpec::Since(1234.5),
            ids: vec![],
            options: vec![QueryOption::BlockIfEmptyAtMost(3.0)],
        });
        roundtrip_up(UpMessage::GetTargetIds {
            query: TargetQuery {
                time_constraint: TimeConstraint::CreatedAfter(99.0),
                filter: Filter::And(vec![
                    Filter::Name(StringPredicate::Matches("^agg".into())),
                    Filter::Not(Box::new(Filter::False)),
                ]),
            },
            options: vec![],
        });
        roundtrip_up(UpMessage::Process(serde_json::json!({"get": "connections"})));
    }

    #[test]
    fn down_messages_roundtrip() {
        roundtrip_down(DownMessage::Ok);
        roundtrip_down(DownMessage::MissingDeferred);
        roundtrip_down(DownMessage::ListOfTargetIds(vec!["x".into()]));
        roundtrip_down(DownMessage::DeferredListOfTargetIds {
            id: "tok".into(),
            total: 12000,
        });
        roundtrip_down(DownMessage::QueryError("no such query".into()));
        roundtrip_down(DownMessage::ServerStatus(ServerStatus {
            time: 1700000000.0,
            read_only: false,
            tls: TlsBackend::None,
            database: "sqlite::memory:".into(),
            alive_targets: 3,
            activable_targets: 1,
            engine_step_batch_size: 500,
            concurrent_automaton_steps: 4,
            deferred_lists: 0,
        }));
    }

    #[test]
    fn mutations_are_classified() {
        assert!(UpMessage::SubmitTargets(vec![]).is_mutation());
        assert!(UpMessage::KillTargets(vec![]).is_mutation());
        assert!(UpMessage::RestartTargets(vec![]).is_mutation());
        assert!(!UpMessage::GetServerStatus.is_mutation());
        assert!(!UpMessage::GetTargets(vec![]).is_mutation());
        assert!(!UpMessage::CallQuery {
            id: "t".into(),
            query: "status-log".into(),
        }
        .is_mutation());
    }

    #[test]
    fn target_roundtrips_through_the_wire() {
        use crate::target::{BuildProcess, Cause, Target};
        let mut t = Target::new("wire-1", "wire");
        t.build_process = BuildProcess::DirectCommand {
            host: "localhost".into(),
            program: "true".into(),
        };
        t.activate(Cause::User);

        let wire =
            serde_json::to_string(&UpEnvelope::V0(UpMessage::SubmitTargets(vec![t.clone()])))
                .unwrap();
        let back: UpEnvelope = serde_json::from_str(&wire).unwrap();
        match back {
            UpEnvelope::V0(UpMessage::SubmitTargets(ts)) => assert_eq!(ts, vec![t]),
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
