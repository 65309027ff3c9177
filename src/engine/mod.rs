// src/engine/mod.rs

//! The scheduling engine.
//!
//! [`Engine`] owns the shared pieces (store, executor, policy, kill
//! requests, commit-revision channel) and exposes the operations the
//! protocol dispatcher needs. The batched step loop lives in [`driver`];
//! submission, kill and restart in [`submission`].
//!
//! The split mirrors the pure-core/IO-shell structure of the automaton: the
//! engine methods here perform IO but no transition logic; every state
//! change goes through [`crate::automaton::step`] or the explicit
//! `activate` operation.

pub mod driver;
pub mod submission;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::automaton::FailurePolicy;
use crate::config::Profile;
use crate::errors::{OverseerError, Result};
use crate::exec::HostExecutor;
use crate::protocol::{QueryDescription, TargetFlatStates, TargetSummary, TimeSpec};
use crate::store::TargetStore;
use crate::target::query::TargetQuery;
use crate::target::{Cause, Target, TargetId};

pub use driver::{Driver, DriverOptions};

/// Administrative commands fed to the driver loop (protocol handlers,
/// command pipe, Ctrl-C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    KillTargets(Vec<TargetId>),
    SweepOrphans,
    Dump,
    Shutdown,
}

/// Shared engine state and operations.
pub struct Engine {
    pub(crate) store: TargetStore,
    pub(crate) executor: std::sync::Arc<dyn HostExecutor>,
    pub(crate) policy: FailurePolicy,
    pub(crate) batch_size: usize,
    pub(crate) concurrent_steps: usize,
    pub(crate) orphan_killing_wait: Duration,
    pub(crate) host_timeout: Duration,
    /// Pending kill requests, observed at the next step of each id.
    kill_requested: StdMutex<HashSet<TargetId>>,
    /// Bumped after every committed batch; blocking queries wait on it.
    revision: watch::Sender<u64>,
    dump_dir: Option<PathBuf>,
    database_parameters: String,
}

impl Engine {
    pub fn new(
        store: TargetStore,
        executor: std::sync::Arc<dyn HostExecutor>,
        profile: &Profile,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            store,
            executor,
            policy: profile.failure_policy(),
            batch_size: profile.engine_step_batch_size,
            concurrent_steps: profile.concurrent_automaton_steps,
            orphan_killing_wait: profile.orphan_killing_wait(),
            host_timeout: profile.host_timeout_upper_bound(),
            kill_requested: StdMutex::new(HashSet::new()),
            revision,
            dump_dir: profile.log_path.as_ref().map(PathBuf::from),
            database_parameters: profile.database_parameters.clone(),
        }
    }

    pub fn store(&self) -> &TargetStore {
        &self.store
    }

    pub fn database_parameters(&self) -> &str {
        &self.database_parameters
    }

    /// Subscribe to commit notifications (used by blocking queries).
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub(crate) fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    pub(crate) fn kill_is_requested(&self, id: &str) -> bool {
        self.kill_requested.lock().unwrap().contains(id)
    }

    pub(crate) fn kill_snapshot(&self) -> HashSet<TargetId> {
        self.kill_requested.lock().unwrap().clone()
    }

    pub(crate) fn request_kill(&self, ids: impl IntoIterator<Item = TargetId>) {
        let mut set = self.kill_requested.lock().unwrap();
        for id in ids {
            set.insert(id);
        }
    }

    pub(crate) fn clear_kill(&self, id: &str) {
        self.kill_requested.lock().unwrap().remove(id);
    }

    /// Activate a target. Idempotent on non-passive ones; returns whether
    /// the state actually changed. Missing ids are logged and skipped: a
    /// dangling fallback reference must not poison the dying target's own
    /// transition.
    pub(crate) async fn activate(&self, id: &str, cause: Cause) -> bool {
        let mut changed = false;
        let result = self
            .store
            .update(id, |t| {
                changed = false;
                if matches!(t.state(), crate::target::State::Passive) {
                    t.activate(cause.clone());
                    changed = true;
                }
            })
            .await;
        match result {
            Ok(_) => changed,
            Err(OverseerError::NotFound(_)) => {
                warn!(id, "activation of unknown target ignored");
                false
            }
            Err(e) => {
                warn!(id, error = %e, "activation failed");
                false
            }
        }
    }

    /// Nothing activated is alive and no kill is pending.
    pub async fn is_idle(&self) -> Result<bool> {
        if !self.kill_requested.lock().unwrap().is_empty() {
            return Ok(false);
        }
        let (_, active) = self.store.count_alive().await?;
        Ok(active == 0)
    }

    // ---- query operations (protocol dispatch) ----

    /// `ids = []` means all targets.
    pub async fn get_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>> {
        if ids.is_empty() {
            return self.store.iter_all().await;
        }
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.store.get(id).await?);
        }
        Ok(out)
    }

    pub async fn get_target_summaries(&self, ids: &[TargetId]) -> Result<Vec<TargetSummary>> {
        Ok(self
            .get_targets(ids)
            .await?
            .iter()
            .map(TargetSummary::of_target)
            .collect())
    }

    pub async fn get_target_flat_states(
        &self,
        time: TimeSpec,
        ids: &[TargetId],
    ) -> Result<Vec<TargetFlatStates>> {
        let since = match time {
            TimeSpec::All => None,
            TimeSpec::Since(t) => Some(t),
        };
        Ok(self
            .get_targets(ids)
            .await?
            .iter()
            .map(|t| TargetFlatStates::of_target(t, since))
            .collect())
    }

    /// Evaluate a target query over the whole store.
    pub async fn query_target_ids(&self, query: &TargetQuery) -> Result<Vec<TargetId>> {
        let mut out = Vec::new();
        for t in self.store.iter_all().await? {
            if query.matches(&t)? {
                out.push(t.id);
            }
        }
        Ok(out)
    }

    /// Queries available on a target. Every target exposes its rendered
    /// status log; long-running plugins may add more behind the executor.
    pub async fn available_queries(&self, id: &str) -> Result<Vec<QueryDescription>> {
        let _ = self.store.get(id).await?;
        Ok(vec![QueryDescription {
            name: "status-log".into(),
            description: "rendered state history of the target".into(),
        }])
    }

    pub async fn call_query(&self, id: &str, query: &str) -> Result<String> {
        let target = self.store.get(id).await?;
        match query {
            "status-log" => {
                let mut out = String::new();
                for e in &target.history {
                    let line = format!(
                        "{} {} (attempts: {}, cause: {:?})\n",
                        e.at.to_rfc3339(),
                        e.state.tag(),
                        e.attempts,
                        e.cause
                    );
                    out.push_str(&line);
                }
                Ok(out)
            }
            other => Err(OverseerError::ProtocolError(format!(
                "no query {other:?} on target {id}"
            ))),
        }
    }

    pub async fn status_gauges(&self) -> Result<(u64, u64)> {
        self.store.count_alive().await
    }

    /// Forward a `Process` subprotocol payload to the executor's diagnostic
    /// hook. The payload is opaque to the engine.
    pub async fn process_diagnostic(
        &self,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.executor
            .diagnostic(payload)
            .await
            .map_err(|e| OverseerError::ProtocolError(e.to_string()))
    }

    // ---- orphan reclamation ----

    /// Find alive, dependency-activated targets no alive root can reach and
    /// schedule them for killing. Returns how many were scheduled.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let alive = self.store.iter_alive().await?;
        let by_id: HashMap<&str, &Target> =
            alive.iter().map(|t| (t.id.as_str(), t)).collect();

        // Roots: alive targets that were activated deliberately (by a user
        // or as somebody's fallback), plus passive ones (not reapable).
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = alive
            .iter()
            .filter(|t| !t.activated_as_dependency_only())
            .map(|t| t.id.as_str())
            .collect();

        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(t) = by_id.get(id) {
                for dep in &t.dependencies {
                    stack.push(dep.as_str());
                }
            }
        }

        let orphans: Vec<TargetId> = alive
            .iter()
            .filter(|t| !reachable.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect();

        if !orphans.is_empty() {
            info!(count = orphans.len(), "scheduling orphaned targets for killing");
            debug!(?orphans, "orphan sweep results");
            self.request_kill(orphans.iter().cloned());
        }
        Ok(orphans.len())
    }

    // ---- periodic JSON dump ----

    /// Serialize the alive set to `<log_path>/targets-dump.json`
    /// (write-then-rename). No-op without a configured log path.
    pub async fn dump_now(&self) -> Result<()> {
        let dir = match &self.dump_dir {
            None => return Ok(()),
            Some(d) => d.clone(),
        };
        tokio::fs::create_dir_all(&dir).await?;

        let alive = self.store.iter_alive().await?;
        let json = serde_json::to_vec_pretty(&alive)?;

        let tmp = dir.join("targets-dump.json.tmp");
        let dst = dir.join("targets-dump.json");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &dst).await?;
        debug!(path = %dst.display(), targets = alive.len(), "dumped alive targets");
        Ok(())
    }
}
