#![allow(dead_code)]

use overseer::config::{AuthToken, ListenConfig, Profile};
use overseer::target::{
    BuildProcess, Cause, Condition, Equivalence, Target, TargetId,
};

/// Builder for `Target` to simplify test setup.
pub struct TargetBuilder {
    target: Target,
}

impl TargetBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            target: Target::new(id, id),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.target.name = name.to_string();
        self
    }

    /// Direct shell command on localhost.
    pub fn shell(mut self, program: &str) -> Self {
        self.target.build_process = BuildProcess::DirectCommand {
            host: "localhost".to_string(),
            program: program.to_string(),
        };
        self
    }

    pub fn long_running(mut self, plugin: &str, payload: serde_json::Value) -> Self {
        self.target.build_process = BuildProcess::LongRunning {
            plugin: plugin.to_string(),
            payload,
        };
        self
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.target.dependencies.push(id.to_string());
        self
    }

    pub fn if_fails_activate(mut self, id: &str) -> Self {
        self.target.if_fails_activate.push(id.to_string());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.target.tags.push(tag.to_string());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.target.condition = Some(condition);
        self
    }

    pub fn file_exists(self, path: &str) -> Self {
        let host = "localhost".to_string();
        self.condition(Condition::FileExists {
            host,
            path: path.to_string(),
        })
    }

    pub fn equivalence(mut self, equivalence: Equivalence) -> Self {
        self.target.equivalence = equivalence;
        self
    }

    /// Submit as already activated by the user.
    pub fn active(mut self) -> Self {
        self.target.activate(Cause::User);
        self
    }

    pub fn build(self) -> Target {
        self.target
    }
}

/// Builder for a test `Profile` (in-memory store, open API).
pub struct ProfileBuilder {
    profile: Profile,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        let json = serde_json::json!({
            "database_parameters": "sqlite::memory:",
            "listen": { "port": 0 }
        });
        Self {
            profile: serde_json::from_value(json).expect("minimal profile deserializes"),
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.profile.maximum_successive_attempts = n;
        self
    }

    pub fn strict_env_failures(mut self, val: bool) -> Self {
        self.profile.turn_unix_ssh_failure_into_target_failure = val;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.profile.engine_step_batch_size = n;
        self
    }

    pub fn concurrent_steps(mut self, n: usize) -> Self {
        self.profile.concurrent_automaton_steps = n;
        self
    }

    pub fn orphan_killing_wait_secs(mut self, secs: f64) -> Self {
        self.profile.orphan_killing_wait_secs = secs;
        self
    }

    pub fn read_only(mut self, val: bool) -> Self {
        self.profile.read_only = val;
        self
    }

    pub fn deferred_threshold(mut self, n: usize) -> Self {
        self.profile.deferred_threshold = n;
        self
    }

    pub fn token(mut self, name: &str, secret: &str) -> Self {
        self.profile.tokens.push(AuthToken {
            name: name.to_string(),
            secret: secret.to_string(),
        });
        self
    }

    pub fn listen(mut self, listen: ListenConfig) -> Self {
        self.profile.listen = listen;
        self
    }

    pub fn log_path(mut self, path: &str) -> Self {
        self.profile.log_path = Some(path.to_string());
        self
    }

    pub fn build(self) -> Profile {
        self.profile
    }
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Short helper: ids of a submission mapping.
pub fn canonical_ids(mapping: &[(TargetId, TargetId)]) -> Vec<TargetId> {
    mapping.iter().map(|(_, canonical)| canonical.clone()).collect()
}
