// src/engine/submission.rs

//! Submission-time operations: equivalence deduplication with id rewriting,
//! cycle rejection, kill requests, and the restart policy.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::errors::{OverseerError, Result};
use crate::target::{Cause, Equivalence, StateEntry, Target, TargetId};

use super::Engine;

impl Engine {
    /// Persist a batch of submitted targets.
    ///
    /// For each target in order: if an alive equivalent exists, the
    /// submitted one is dropped and later references to its id within the
    /// batch are rewritten to the canonical id. Returns the
    /// `submitted id -> canonical id` mapping so clients can track ids.
    ///
    /// Dependency cycles within the batch are rejected before anything is
    /// stored (already-stored targets are acyclic by induction and cannot
    /// reference ids that do not exist yet).
    pub async fn submit_targets(
        &self,
        submitted: Vec<Target>,
    ) -> Result<Vec<(TargetId, TargetId)>> {
        let mut submitted = submitted;
        for t in &mut submitted {
            sanitize(t);
        }
        reject_cycles(&submitted)?;

        let mut rewrites: HashMap<TargetId, TargetId> = HashMap::new();
        let mut mapping = Vec::with_capacity(submitted.len());

        for mut target in submitted {
            rewrite_ids(&mut target.dependencies, &rewrites);
            rewrite_ids(&mut target.if_fails_activate, &rewrites);

            match self.store.find_equivalent(&target).await? {
                Some(existing) => {
                    debug!(
                        submitted = %target.id,
                        canonical = %existing,
                        "equivalent alive target found; collapsing"
                    );
                    rewrites.insert(target.id.clone(), existing.clone());
                    mapping.push((target.id, existing));
                }
                None => {
                    info!(id = %target.id, name = %target.name, "storing submitted target");
                    self.store.put(&target).await?;
                    mapping.push((target.id.clone(), target.id));
                }
            }
        }

        self.bump_revision();
        Ok(mapping)
    }

    /// Request termination of the given targets. Acknowledged immediately;
    /// the transitions happen within one driver batch. Unknown ids are an
    /// error; already-terminal targets are left alone.
    pub async fn kill_targets(&self, ids: &[TargetId]) -> Result<()> {
        let mut to_kill = Vec::with_capacity(ids.len());
        for id in ids {
            let target = self.store.get(id).await?;
            if target.is_alive() {
                to_kill.push(id.clone());
            } else {
                warn!(id = %id, "kill of terminal target ignored");
            }
        }
        info!(count = to_kill.len(), "kill requested");
        self.request_kill(to_kill);
        Ok(())
    }

    /// Restart policy: each named target is cloned into a fresh instance —
    /// new id, same prescription, empty history — which is then activated
    /// by the user. The original is never mutated, and the copy opts out of
    /// equivalence so it cannot collapse back onto what it restarts.
    pub async fn restart_targets(&self, ids: &[TargetId]) -> Result<Vec<(TargetId, TargetId)>> {
        let mut mapping = Vec::with_capacity(ids.len());
        for id in ids {
            let old = self.store.get(id).await?;
            let mut fresh = Target {
                id: uuid::Uuid::new_v4().to_string(),
                history: vec![StateEntry::initial()],
                equivalence: Equivalence::None,
                ..old
            };
            fresh.activate(Cause::User);
            info!(restarted = %id, new = %fresh.id, "restarting target as a fresh instance");
            self.store.put(&fresh).await?;
            mapping.push((id.clone(), fresh.id));
        }
        self.bump_revision();
        Ok(mapping)
    }
}

/// Normalize a submitted target: non-empty history, deduplicated edge
/// lists (first occurrence wins).
fn sanitize(t: &mut Target) {
    if t.history.is_empty() {
        t.history.push(StateEntry::initial());
    }
    dedup_preserving_order(&mut t.dependencies);
    dedup_preserving_order(&mut t.if_fails_activate);
}

fn dedup_preserving_order(ids: &mut Vec<TargetId>) {
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}

fn rewrite_ids(ids: &mut [TargetId], rewrites: &HashMap<TargetId, TargetId>) {
    for id in ids {
        if let Some(canonical) = rewrites.get(id) {
            *id = canonical.clone();
        }
    }
}

/// Reject dependency cycles within the submitted batch (iterative
/// three-color DFS over the batch's own edges).
fn reject_cycles(batch: &[Target]) -> Result<()> {
    let deps: HashMap<&str, &[TargetId]> = batch
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.as_slice()))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }
    let mut color: HashMap<&str, Color> =
        deps.keys().map(|id| (*id, Color::White)).collect();

    for start in deps.keys() {
        if color[start] != Color::White {
            continue;
        }
        // (node, next dependency index) stack.
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        color.insert(start, Color::Grey);

        while let Some((node, idx)) = stack.pop() {
            let node_deps = deps.get(node).copied().unwrap_or(&[]);
            match node_deps.get(idx) {
                None => {
                    color.insert(node, Color::Black);
                }
                Some(dep) => {
                    stack.push((node, idx + 1));
                    let dep = dep.as_str();
                    match color.get(dep).copied() {
                        // Edges into already-stored targets cannot close a
                        // cycle over the new nodes.
                        None | Some(Color::Black) => {}
                        Some(Color::Grey) => {
                            return Err(OverseerError::ProtocolError(format!(
                                "dependency cycle through target {dep:?}"
                            )));
                        }
                        Some(Color::White) => {
                            color.insert(dep, Color::Grey);
                            stack.push((dep, 0));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::BuildProcess;

    fn node(id: &str, deps: &[&str]) -> Target {
        let mut t = Target::new(id, id);
        t.build_process = BuildProcess::DirectCommand {
            host: "localhost".into(),
            program: format!("echo {id}"),
        };
        t.dependencies = deps.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn acyclic_batches_pass() {
        let batch = vec![node("a", &[]), node("b", &["a"]), node("c", &["a", "b"])];
        assert!(reject_cycles(&batch).is_ok());
    }

    #[test]
    fn self_cycle_is_rejected() {
        let batch = vec![node("a", &["a"])];
        assert!(matches!(
            reject_cycles(&batch),
            Err(OverseerError::ProtocolError(_))
        ));
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let batch = vec![node("a", &["b"]), node("b", &["a"])];
        assert!(matches!(
            reject_cycles(&batch),
            Err(OverseerError::ProtocolError(_))
        ));
    }

    #[test]
    fn references_outside_the_batch_are_not_cycles() {
        let batch = vec![node("a", &["already-stored"]), node("b", &["a"])];
        assert!(reject_cycles(&batch).is_ok());
    }

    #[test]
    fn duplicate_dependencies_are_deduplicated() {
        let mut t = node("a", &["x", "y", "x", "x"]);
        sanitize(&mut t);
        assert_eq!(t.dependencies, vec!["x".to_string(), "y".to_string()]);
    }
}
