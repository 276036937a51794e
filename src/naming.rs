//! Candidate name generation
//!
//! Resources are named from a human-chosen base (project id, agent name) so
//! operators can recognise them by inspection. When the preferred name is
//! taken the provisioner walks a deterministic sequence of fallbacks:
//!
//! ```text
//! bucket:           {project}-staging
//!                   {project}-{agent}-staging
//!                   {project}-{agent}-staging-2 .. -49
//!
//! service identity: {prefix}-sa
//!                   {prefix}-sa-2 .. -49
//! ```
//!
//! The sequence is lazy and capped at [`MAX_CANDIDATES`] so a crowded
//! namespace can never make the walk unbounded. Candidates that would
//! violate the platform's length limits are skipped, never emitted.

use std::fmt;

use serde::Serialize;

use crate::{Error, Result};

/// Upper bound on the number of names tried for one resource
pub const MAX_CANDIDATES: u32 = 50;

/// Suffix appended to service identity account ids
pub const SERVICE_ACCOUNT_SUFFIX: &str = "-sa";

/// Longest prefix kept before the `-sa` suffix
///
/// 30 total - 3 for "-sa" - 2 for a "-N" retry suffix.
pub const SERVICE_ACCOUNT_PREFIX_MAX: usize = 25;

/// Service account id length bounds
pub const SERVICE_ACCOUNT_MIN_LEN: usize = 6;
/// Service account id length bounds
pub const SERVICE_ACCOUNT_MAX_LEN: usize = 30;

/// Bucket name length bounds
pub const BUCKET_MIN_LEN: usize = 3;
/// Bucket name length bounds
pub const BUCKET_MAX_LEN: usize = 63;

/// Generic trailing words dropped from agent names, first match wins
const GENERIC_SUFFIXES: &[&str] = &["agent", "analysis", "service", "processor", "engine", "app"];

/// The kinds of resource this crate provisions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    /// Object storage bucket used for staging deployment artifacts
    Bucket,
    /// Service identity (service account) the workload runs as
    ServiceIdentity,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Bucket => write!(f, "bucket"),
            ResourceKind::ServiceIdentity => write!(f, "service identity"),
        }
    }
}

/// Human-chosen inputs names are derived from
#[derive(Clone, Copy, Debug)]
pub struct NameBase<'a> {
    /// Project the resources live in
    pub project: &'a str,
    /// Agent (workload) the resources serve
    pub agent: &'a str,
}

/// Lowercase, hyphenate and strip a free-form name down to `[a-z0-9-]`
/// with no leading, trailing or doubled hyphens.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = match c {
            '_' | ' ' => '-',
            c => c,
        };
        if !(c.is_ascii_alphanumeric() || c == '-') {
            continue;
        }
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}

/// Derive the prefix shared by every service identity candidate.
fn service_account_prefix(agent: &str) -> Result<String> {
    let mut name = sanitize(agent);

    for suffix in GENERIC_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            if let Some(stripped) = stripped.strip_suffix('-') {
                name = stripped.to_string();
                break;
            }
        }
    }

    if name.len() > SERVICE_ACCOUNT_PREFIX_MAX {
        name.truncate(SERVICE_ACCOUNT_PREFIX_MAX);
    }
    let name = name.trim_end_matches('-').to_string();

    match name.chars().next() {
        None => Err(Error::validation(format!(
            "agent name '{}' has no usable characters for a service account",
            agent
        ))),
        Some(c) if !c.is_ascii_lowercase() => Err(Error::validation(format!(
            "service account name derived from '{}' must start with a letter",
            agent
        ))),
        Some(_) => Ok(name),
    }
}

/// The preferred service identity account id for an agent name.
///
/// `"Competitor Analysis Agent"` becomes `competitor-analysis-sa`.
pub fn service_account_name(agent: &str) -> Result<String> {
    Ok(format!("{}{}", service_account_prefix(agent)?, SERVICE_ACCOUNT_SUFFIX))
}

/// Build the candidate sequence for a resource kind.
pub fn candidates(base: &NameBase<'_>, kind: ResourceKind) -> Result<Candidates> {
    let shape = match kind {
        ResourceKind::Bucket => {
            let project = sanitize(base.project);
            let agent = sanitize(base.agent);
            if project.is_empty() || agent.is_empty() {
                return Err(Error::validation(format!(
                    "bucket names need a project and agent (got '{}', '{}')",
                    base.project, base.agent
                )));
            }
            Shape::Bucket { project, agent }
        }
        ResourceKind::ServiceIdentity => Shape::ServiceAccount {
            prefix: service_account_prefix(base.agent)?,
        },
    };

    Ok(Candidates {
        shape,
        slot: 0,
    })
}

#[derive(Clone, Debug)]
enum Shape {
    Bucket { project: String, agent: String },
    ServiceAccount { prefix: String },
}

/// Lazy, deterministic sequence of candidate names
///
/// Yields at most [`MAX_CANDIDATES`] names.
#[derive(Clone, Debug)]
pub struct Candidates {
    shape: Shape,
    slot: u32,
}

impl Candidates {
    /// Resource kind these candidates are for
    pub fn kind(&self) -> ResourceKind {
        match self.shape {
            Shape::Bucket { .. } => ResourceKind::Bucket,
            Shape::ServiceAccount { .. } => ResourceKind::ServiceIdentity,
        }
    }

    /// Render the name for a slot, or `None` when it breaks length limits.
    ///
    /// Slot 1 has no service account form; numbering restarts at 2 there.
    fn render(&self, slot: u32) -> Option<String> {
        let (name, min, max) = match &self.shape {
            Shape::Bucket { project, agent } => {
                let name = match slot {
                    0 => format!("{}-staging", project),
                    1 => format!("{}-{}-staging", project, agent),
                    n => format!("{}-{}-staging-{}", project, agent, n),
                };
                (name, BUCKET_MIN_LEN, BUCKET_MAX_LEN)
            }
            Shape::ServiceAccount { prefix } => {
                let name = match slot {
                    0 => format!("{}{}", prefix, SERVICE_ACCOUNT_SUFFIX),
                    1 => return None,
                    n => format!("{}{}-{}", prefix, SERVICE_ACCOUNT_SUFFIX, n),
                };
                (name, SERVICE_ACCOUNT_MIN_LEN, SERVICE_ACCOUNT_MAX_LEN)
            }
        };
        (min..=max).contains(&name.len()).then_some(name)
    }
}

impl Iterator for Candidates {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.slot < MAX_CANDIDATES {
            let slot = self.slot;
            self.slot += 1;
            if let Some(name) = self.render(slot) {
                return Some(name);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sa_base(agent: &str) -> NameBase<'_> {
        NameBase {
            project: "my-project",
            agent,
        }
    }

    #[rstest]
    #[case::spaces("Competitor Analysis Agent", "competitor-analysis-agent")]
    #[case::underscores("data__pipeline_", "data-pipeline")]
    #[case::punctuation("Hello, World!", "hello-world")]
    #[case::already_clean("report-bot", "report-bot")]
    #[case::leading_hyphens("--x--y--", "x-y")]
    #[case::non_ascii("café bot", "caf-bot")]
    fn test_sanitize(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize(raw), expected);
    }

    #[rstest]
    #[case::strips_agent("Competitor Analysis Agent", "competitor-analysis-sa")]
    #[case::strips_service("billing_service", "billing-sa")]
    #[case::only_first_match("market-analysis-app", "market-analysis-sa")]
    #[case::no_bare_suffix_strip("agent", "agent-sa")]
    #[case::keeps_unmatched("researcher", "researcher-sa")]
    fn test_service_account_name(#[case] agent: &str, #[case] expected: &str) {
        assert_eq!(service_account_name(agent).unwrap(), expected);
    }

    #[test]
    fn test_long_names_truncate_without_trailing_hyphen() {
        // 25th char lands on a hyphen
        let name = service_account_name("abcdefghijklmnopqrstuvwx-yz-long").unwrap();
        assert_eq!(name, "abcdefghijklmnopqrstuvwx-sa");
        assert!(name.len() <= SERVICE_ACCOUNT_MAX_LEN);
    }

    #[test]
    fn test_unusable_names_are_rejected() {
        assert!(service_account_name("!!!").is_err());
        assert!(service_account_name("42-things").is_err());
    }

    #[test]
    fn test_bucket_candidate_order() {
        let names: Vec<_> = candidates(
            &NameBase {
                project: "acme-prod",
                agent: "researcher",
            },
            ResourceKind::Bucket,
        )
        .unwrap()
        .collect();

        assert_eq!(names.len(), MAX_CANDIDATES as usize);
        assert_eq!(names[0], "acme-prod-staging");
        assert_eq!(names[1], "acme-prod-researcher-staging");
        assert_eq!(names[2], "acme-prod-researcher-staging-2");
        assert_eq!(names[49], "acme-prod-researcher-staging-49");
    }

    #[test]
    fn test_service_account_candidate_order() {
        let names: Vec<_> = candidates(&sa_base("Competitor Analysis Agent"), ResourceKind::ServiceIdentity)
            .unwrap()
            .collect();

        assert_eq!(names[0], "competitor-analysis-sa");
        assert_eq!(names[1], "competitor-analysis-sa-2");
        assert_eq!(names.last().unwrap(), "competitor-analysis-sa-49");
        assert_eq!(names.len(), 49);
    }

    #[test]
    fn test_service_account_candidates_skip_overlong() {
        // 25-char prefix: single-digit suffixes fit in 30, "-sa-10" and up do not
        let names: Vec<_> = candidates(
            &sa_base("abcdefghijklmnopqrstuvwxyz"),
            ResourceKind::ServiceIdentity,
        )
        .unwrap()
        .collect();
        assert_eq!(names.len(), 9);
        assert_eq!(names[0], "abcdefghijklmnopqrstuvwxy-sa");
        assert_eq!(names[1], "abcdefghijklmnopqrstuvwxy-sa-2");
        assert_eq!(names[8], "abcdefghijklmnopqrstuvwxy-sa-9");
    }

    #[test]
    fn test_service_account_candidates_skip_too_short() {
        let names: Vec<_> = candidates(&sa_base("ab"), ResourceKind::ServiceIdentity)
            .unwrap()
            .collect();
        assert_eq!(names[0], "ab-sa-2");
    }

    #[test]
    fn test_candidates_are_always_valid_identifiers() {
        let inputs = [
            "Competitor Analysis Agent",
            "x",
            "a very long agent name that keeps going and going",
            "under_score__heavy___name",
            "MiXeD CaSe 123 Processor",
            "trailing-hyphen-at-twenty-five-x",
        ];
        for input in inputs {
            let Ok(seq) = candidates(&sa_base(input), ResourceKind::ServiceIdentity) else {
                continue;
            };
            let names: Vec<_> = seq.collect();
            assert!(names.len() <= MAX_CANDIDATES as usize);
            for name in &names {
                assert!(name.len() <= SERVICE_ACCOUNT_MAX_LEN, "{name} too long");
                assert!(
                    name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
                    "{name} has invalid chars"
                );
                assert!(!name.starts_with('-') && !name.ends_with('-'), "{name}");
                assert!(!name.contains("--"), "{name} has doubled hyphen");
            }
            let mut unique = names.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), names.len());
        }
    }

    #[test]
    fn test_candidates_are_deterministic() {
        let base = NameBase {
            project: "p1",
            agent: "Agent Smith",
        };
        let a: Vec<_> = candidates(&base, ResourceKind::Bucket).unwrap().collect();
        let b: Vec<_> = candidates(&base, ResourceKind::Bucket).unwrap().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bucket_requires_agent() {
        let base = NameBase {
            project: "p1",
            agent: "***",
        };
        assert!(candidates(&base, ResourceKind::Bucket).is_err());
    }
}
