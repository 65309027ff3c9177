// src/target/query.rs

//! Query filter algebra over targets.
//!
//! Clients select target ids with a [`TargetQuery`]: a time constraint plus
//! a recursive boolean [`Filter`]. Evaluation is local to one target; the
//! dispatcher maps it over the store's listings.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{OverseerError, Result};

use super::{SimpleStatus, State, Target};

/// Time window a query applies to. Times are float Unix seconds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum TimeConstraint {
    #[serde(rename = "All")]
    #[default]
    All,
    /// Keep targets not finished before `t` (unfinished ones qualify).
    #[serde(rename = "Not_finished_before")]
    NotFinishedBefore(f64),
    #[serde(rename = "Created_after")]
    CreatedAfter(f64),
    #[serde(rename = "Status_changed_since")]
    StatusChangedSince(f64),
}

/// String predicate used by tag/name/id filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringPredicate {
    #[serde(rename = "Equals")]
    Equals(String),
    /// Regular expression match (full `regex` syntax, unanchored).
    #[serde(rename = "Matches")]
    Matches(String),
}

impl StringPredicate {
    fn matches(&self, s: &str) -> Result<bool> {
        match self {
            StringPredicate::Equals(expected) => Ok(s == expected),
            StringPredicate::Matches(pattern) => {
                let re = regex::Regex::new(pattern).map_err(|e| {
                    OverseerError::ProtocolError(format!("bad regex {pattern:?}: {e}"))
                })?;
                Ok(re.is_match(s))
            }
        }
    }
}

/// Status-level filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusFilter {
    #[serde(rename = "Simple")]
    Simple(SimpleStatus),
    /// The process is actually running right now.
    #[serde(rename = "Really_running")]
    ReallyRunning,
    /// Alive, hence can receive a kill.
    #[serde(rename = "Killable")]
    Killable,
    #[serde(rename = "Dead_because_of_dependencies")]
    DeadBecauseOfDependencies,
    #[serde(rename = "Activated_by_user")]
    ActivatedByUser,
}

/// Recursive boolean filter over a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    #[serde(rename = "True")]
    True,
    #[serde(rename = "False")]
    False,
    #[serde(rename = "And")]
    And(Vec<Filter>),
    #[serde(rename = "Or")]
    Or(Vec<Filter>),
    #[serde(rename = "Not")]
    Not(Box<Filter>),
    #[serde(rename = "Status")]
    Status(StatusFilter),
    #[serde(rename = "Has_tag")]
    HasTag(StringPredicate),
    #[serde(rename = "Name")]
    Name(StringPredicate),
    #[serde(rename = "Id")]
    Id(StringPredicate),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::True
    }
}

/// A full target query: time constraint plus filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetQuery {
    #[serde(default)]
    pub time_constraint: TimeConstraint,
    #[serde(default)]
    pub filter: Filter,
}

impl TargetQuery {
    pub fn matches(&self, target: &Target) -> Result<bool> {
        Ok(time_constraint_matches(self.time_constraint, target)
            && filter_matches(&self.filter, target)?)
    }
}

fn from_unix(t: f64) -> DateTime<Utc> {
    let secs = t.floor() as i64;
    let nanos = ((t - t.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

fn time_constraint_matches(tc: TimeConstraint, target: &Target) -> bool {
    match tc {
        TimeConstraint::All => true,
        TimeConstraint::NotFinishedBefore(t) => match target.finished_at() {
            None => true,
            Some(finished) => finished >= from_unix(t),
        },
        TimeConstraint::CreatedAfter(t) => target.created_at() > from_unix(t),
        TimeConstraint::StatusChangedSince(t) => target.current().at >= from_unix(t),
    }
}

fn filter_matches(filter: &Filter, target: &Target) -> Result<bool> {
    match filter {
        Filter::True => Ok(true),
        Filter::False => Ok(false),
        Filter::And(fs) => {
            for f in fs {
                if !filter_matches(f, target)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Or(fs) => {
            for f in fs {
                if filter_matches(f, target)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Filter::Not(f) => Ok(!filter_matches(f, target)?),
        Filter::Status(sf) => Ok(status_matches(sf, target)),
        Filter::HasTag(p) => {
            for tag in &target.tags {
                if p.matches(tag)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Filter::Name(p) => p.matches(&target.name),
        Filter::Id(p) => p.matches(&target.id),
    }
}

fn status_matches(sf: &StatusFilter, target: &Target) -> bool {
    match sf {
        StatusFilter::Simple(s) => target.simple_status() == *s,
        StatusFilter::ReallyRunning => target.state().is_really_running(),
        StatusFilter::Killable => target.is_alive(),
        StatusFilter::DeadBecauseOfDependencies => {
            matches!(target.state(), State::Dead(_)) && target.failed_from_dependencies()
        }
        StatusFilter::ActivatedByUser => target.activated_by_user(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Cause, Target};

    fn sample() -> Target {
        let mut t = Target::new("id-1", "build-genome");
        t.tags = vec!["genomics".into(), "urgent".into()];
        t.activate(Cause::User);
        t
    }

    #[test]
    fn contradiction_matches_nothing() {
        let t = sample();
        let f = Filter::And(vec![
            Filter::Name(StringPredicate::Equals("build-genome".into())),
            Filter::Not(Box::new(Filter::Name(StringPredicate::Equals(
                "build-genome".into(),
            )))),
        ]);
        assert!(!filter_matches(&f, &t).unwrap());
    }

    #[test]
    fn excluded_middle_matches_everything() {
        let t = sample();
        let inner = Filter::HasTag(StringPredicate::Matches("^gen".into()));
        let f = Filter::Or(vec![inner.clone(), Filter::Not(Box::new(inner))]);
        assert!(filter_matches(&f, &t).unwrap());
    }

    #[test]
    fn tag_and_name_predicates() {
        let t = sample();
        assert!(
            filter_matches(&Filter::HasTag(StringPredicate::Equals("urgent".into())), &t).unwrap()
        );
        assert!(
            !filter_matches(&Filter::HasTag(StringPredicate::Equals("slow".into())), &t).unwrap()
        );
        assert!(filter_matches(
            &Filter::Name(StringPredicate::Matches("genome$".into())),
            &t
        )
        .unwrap());
        assert!(filter_matches(&Filter::Id(StringPredicate::Equals("id-1".into())), &t).unwrap());
    }

    #[test]
    fn bad_regex_is_a_protocol_error() {
        let t = sample();
        let err = filter_matches(&Filter::Name(StringPredicate::Matches("(".into())), &t)
            .unwrap_err();
        assert!(matches!(err, OverseerError::ProtocolError(_)));
    }

    #[test]
    fn status_filters() {
        let t = sample();
        assert!(status_matches(
            &StatusFilter::Simple(SimpleStatus::Activable),
            &t
        ));
        assert!(status_matches(&StatusFilter::Killable, &t));
        assert!(status_matches(&StatusFilter::ActivatedByUser, &t));
        assert!(!status_matches(&StatusFilter::ReallyRunning, &t));
        assert!(!status_matches(&StatusFilter::DeadBecauseOfDependencies, &t));
    }

    #[test]
    fn created_after_excludes_old_targets() {
        let t = sample();
        let future = (Utc::now() + chrono::Duration::seconds(60)).timestamp() as f64;
        let q = TargetQuery {
            time_constraint: TimeConstraint::CreatedAfter(future),
            filter: Filter::True,
        };
        assert!(!q.matches(&t).unwrap());

        let q_all = TargetQuery::default();
        assert!(q_all.matches(&t).unwrap());
    }
}
