// src/config/loader.rs

use std::path::Path;

use tracing::debug;

use crate::config::model::{Profile, RawConfigFile};
use crate::errors::{OverseerError, Result};

/// Load the JSON config file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let config: RawConfigFile = serde_json::from_str(&contents)
        .map_err(|e| OverseerError::ConfigError(format!("{}: {e}", path.display())))?;
    Ok(config)
}

/// Load the config file and resolve + validate one profile.
///
/// Profile resolution order:
/// 1. explicit `profile` argument (`--profile`)
/// 2. `OVERSEER_PROFILE` environment variable
/// 3. the only profile, if the file defines exactly one
pub fn load_profile(path: impl AsRef<Path>, profile: Option<&str>) -> Result<Profile> {
    let raw = load_from_path(&path)?;

    let from_env = std::env::var("OVERSEER_PROFILE").ok();
    let wanted = profile.map(str::to_string).or(from_env);

    let (name, profile) = match wanted {
        Some(name) => {
            let p = raw.profiles.get(&name).ok_or_else(|| {
                OverseerError::ConfigError(format!(
                    "no profile {name:?} (available: {})",
                    raw.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            })?;
            (name, p.clone())
        }
        None if raw.profiles.len() == 1 => {
            let (name, p) = raw.profiles.iter().next().expect("len checked");
            (name.clone(), p.clone())
        }
        None => {
            return Err(OverseerError::ConfigError(format!(
                "config defines {} profiles; select one with --profile or OVERSEER_PROFILE",
                raw.profiles.len()
            )));
        }
    };

    validate(&profile)?;
    debug!(profile = %name, "configuration profile selected");
    Ok(profile)
}

fn validate(profile: &Profile) -> Result<()> {
    if profile.engine_step_batch_size == 0 {
        return Err(OverseerError::ConfigError(
            "engine_step_batch_size must be at least 1".into(),
        ));
    }
    if profile.concurrent_automaton_steps == 0 {
        return Err(OverseerError::ConfigError(
            "concurrent_automaton_steps must be at least 1".into(),
        ));
    }
    if profile.maximum_successive_attempts == 0 {
        return Err(OverseerError::ConfigError(
            "maximum_successive_attempts must be at least 1".into(),
        ));
    }

    let token_re = regex::Regex::new("^[A-Za-z0-9_=-]+$").expect("static regex");
    for token in &profile.tokens {
        if token.name.is_empty() {
            return Err(OverseerError::ConfigError("token with empty name".into()));
        }
        if !token_re.is_match(&token.secret) {
            return Err(OverseerError::ConfigError(format!(
                "token {:?} has a secret outside the A-Za-z0-9_=- alphabet",
                token.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(json.as_bytes()).expect("write config");
        f
    }

    const MINIMAL: &str = r#"{
        "profiles": {
            "test": {
                "database_parameters": "sqlite::memory:",
                "listen": { "port": 8443 },
                "tokens": [ { "name": "cli", "secret": "abcDEF_123=-" } ]
            }
        }
    }"#;

    #[test]
    fn single_profile_needs_no_selection() {
        let f = write_config(MINIMAL);
        let p = load_profile(f.path(), None).expect("load");
        assert_eq!(p.database_parameters, "sqlite::memory:");
        assert_eq!(p.listen.port, 8443);
        assert_eq!(p.maximum_successive_attempts, 3);
        assert_eq!(p.concurrent_automaton_steps, 4);
        assert!(!p.turn_unix_ssh_failure_into_target_failure);
        assert!(!p.read_only);
    }

    #[test]
    fn unknown_profile_is_a_config_error() {
        let f = write_config(MINIMAL);
        let err = load_profile(f.path(), Some("production")).unwrap_err();
        assert!(matches!(err, OverseerError::ConfigError(_)));
    }

    #[test]
    fn bad_token_alphabet_is_rejected() {
        let bad = MINIMAL.replace("abcDEF_123=-", "has spaces!");
        let f = write_config(&bad);
        let err = load_profile(f.path(), None).unwrap_err();
        assert!(matches!(err, OverseerError::ConfigError(_)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let bad = MINIMAL.replace(
            "\"listen\"",
            "\"engine_step_batch_size\": 0, \"listen\"",
        );
        let f = write_config(&bad);
        let err = load_profile(f.path(), None).unwrap_err();
        assert!(matches!(err, OverseerError::ConfigError(_)));
    }
}
