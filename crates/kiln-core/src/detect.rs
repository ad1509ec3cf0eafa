//! Group resolution.
//!
//! Candidate groups are tried in order. Within a group, buildpacks detect one
//! at a time, each seeing the environment left by the earlier ones. A group
//! qualifies when every non-optional buildpack passes and every require entry
//! is met by a provide from the same or an earlier buildpack. Optional
//! buildpacks that fail detection, or whose requires stay unmet, are dropped.
//! Every group is evaluated from a fresh copy of the base environment, so a
//! rejected group leaves nothing behind for the next one.

use crate::concurrency::check_interrupted;
use crate::CoreError;
use kiln_buildpack::{BuildpackError, BuildpackSource, DetectContext, Env};
use kiln_schema::{BuildPlan, BuildpackRef, DetectPlan, Group, Order};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

/// The group that qualified and its merged build plan.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectResult {
    pub group: Group,
    pub plan: BuildPlan,
}

/// Why one candidate group was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRejection {
    pub group: Group,
    pub reason: String,
}

/// Every candidate group was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectFailure {
    pub rejections: Vec<GroupRejection>,
}

impl fmt::Display for DetectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no buildpack group passed detection")?;
        if self.rejections.is_empty() {
            return write!(f, " (order is empty)");
        }
        for (i, r) in self.rejections.iter().enumerate() {
            write!(f, "\n  group {} {}: {}", i + 1, r.group, r.reason)?;
        }
        Ok(())
    }
}

pub struct Detector<'a> {
    source: &'a dyn BuildpackSource,
    app_dir: PathBuf,
    platform_dir: PathBuf,
    env: Env,
}

impl<'a> Detector<'a> {
    pub fn new(source: &'a dyn BuildpackSource, app_dir: impl Into<PathBuf>, platform_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            app_dir: app_dir.into(),
            platform_dir: platform_dir.into(),
            env: Env::new(),
        }
    }

    /// Base environment every group starts from.
    #[must_use]
    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    /// Return the first qualifying group of `order`.
    pub fn detect(&self, order: &Order) -> Result<DetectResult, CoreError> {
        let mut rejections = Vec::new();
        for group in &order.order {
            check_interrupted()?;
            match self.try_group(group)? {
                Ok(result) => {
                    info!("detected group {}", result.group);
                    return Ok(result);
                }
                Err(reason) => {
                    debug!("group {group} rejected: {reason}");
                    rejections.push(GroupRejection {
                        group: group.clone(),
                        reason,
                    });
                }
            }
        }
        Err(CoreError::DetectFailed(DetectFailure { rejections }))
    }

    /// `Ok(Err(reason))` rejects the group; `Err` aborts detection entirely.
    fn try_group(&self, group: &Group) -> Result<Result<DetectResult, String>, CoreError> {
        if let Err(e) = group.validate() {
            return Ok(Err(e.to_string()));
        }

        let mut env = self.env.clone();
        let mut passed: Vec<(BuildpackRef, DetectPlan)> = Vec::new();
        for entry in group {
            check_interrupted()?;
            let buildpack = self.source.resolve(entry)?;
            let ctx = DetectContext {
                app_dir: self.app_dir.clone(),
                platform_dir: self.platform_dir.clone(),
                env: env.clone(),
            };
            let outcome = match buildpack.detect(&ctx) {
                Ok(outcome) if outcome.passed => outcome,
                Ok(_) if entry.optional => {
                    debug!("optional {entry} did not pass detection, dropped");
                    continue;
                }
                Ok(_) => return Ok(Err(format!("{entry} did not pass detection"))),
                Err(e @ BuildpackError::ExecFailed { .. }) if entry.optional => {
                    debug!("optional {entry} detect errored, dropped: {e}");
                    continue;
                }
                Err(e @ BuildpackError::ExecFailed { .. }) => return Ok(Err(e.to_string())),
                Err(e) => return Err(e.into()),
            };
            debug!("{entry} passed detection");
            env.apply_all(&outcome.env_ops);
            passed.push((entry.clone(), outcome.plan));
        }

        loop {
            if passed.is_empty() {
                return Ok(Err("no buildpack passed detection".to_owned()));
            }
            let resolved = Group::new(passed.iter().map(|(r, _)| r.clone()).collect());
            let mut plan = BuildPlan::default();
            for (entry, detect_plan) in &passed {
                plan.push_detect(&entry.id, detect_plan);
            }
            let Some((buildpack, name)) = plan.first_unmet(&resolved) else {
                return Ok(Ok(DetectResult {
                    group: resolved,
                    plan,
                }));
            };
            let Some(i) = passed.iter().position(|(r, _)| r.id == buildpack) else {
                return Ok(Err(format!("unmet require {name} from unknown buildpack {buildpack}")));
            };
            if !passed[i].0.optional {
                return Ok(Err(format!(
                    "{} requires {name}, which no earlier buildpack provides",
                    passed[i].0
                )));
            }
            debug!("optional {} requires unmet {name}, dropped", passed[i].0);
            passed.remove(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_buildpack::{EnvAction, EnvOp, MapSource, MockBuildpack};
    use kiln_schema::EntryKind;
    use std::sync::Arc;

    fn detector(source: &MapSource) -> Detector<'_> {
        Detector::new(source, "/app", "/platform")
    }

    fn group(entries: Vec<BuildpackRef>) -> Group {
        Group::new(entries)
    }

    fn entry(id: &str) -> BuildpackRef {
        BuildpackRef::new(id, "1")
    }

    #[test]
    fn optional_requirer_kept_when_earlier_provide() {
        let source = MapSource::new()
            .with(Arc::new(MockBuildpack::new("A", "1").provides("node")))
            .with(Arc::new(
                MockBuildpack::new("B", "1").requires("node").provides("npm"),
            ));
        let order = Order::new(vec![group(vec![entry("A"), entry("B").optional()])]);

        let result = detector(&source).detect(&order).unwrap();
        assert_eq!(result.group.len(), 2);
        let entries: Vec<_> = result
            .plan
            .entries
            .iter()
            .map(|e| (e.kind, e.name.as_str(), e.buildpack.as_str()))
            .collect();
        assert_eq!(
            entries,
            vec![
                (EntryKind::Provide, "node", "A"),
                (EntryKind::Require, "node", "B"),
                (EntryKind::Provide, "npm", "B"),
            ]
        );
    }

    #[test]
    fn required_failure_moves_to_next_group() {
        let a = Arc::new(MockBuildpack::new("A", "1").failing_detect());
        let source = MapSource::new()
            .with(a.clone())
            .with(Arc::new(MockBuildpack::new("B", "1")))
            .with(Arc::new(MockBuildpack::new("C", "1")));
        let order = Order::new(vec![
            group(vec![entry("A"), entry("B").optional()]),
            group(vec![entry("C")]),
        ]);
        let result = detector(&source).detect(&order).unwrap();
        assert_eq!(result.group, group(vec![entry("C")]));
        assert_eq!(a.detect_count(), 1);
    }

    #[test]
    fn optional_failure_is_dropped() {
        let source = MapSource::new()
            .with(Arc::new(MockBuildpack::new("A", "1")))
            .with(Arc::new(MockBuildpack::new("B", "1").failing_detect()));
        let order = Order::new(vec![group(vec![entry("A"), entry("B").optional()])]);
        let result = detector(&source).detect(&order).unwrap();
        assert_eq!(result.group, group(vec![entry("A")]));
    }

    #[test]
    fn require_met_only_by_later_provide_rejects_group() {
        let source = MapSource::new()
            .with(Arc::new(MockBuildpack::new("A", "1").requires("npm")))
            .with(Arc::new(MockBuildpack::new("B", "1").provides("npm")));
        let order = Order::new(vec![group(vec![entry("A"), entry("B")])]);
        let err = detector(&source).detect(&order).unwrap_err();
        let CoreError::DetectFailed(failure) = err else {
            panic!("expected detect failure");
        };
        assert_eq!(failure.rejections.len(), 1);
        assert!(failure.rejections[0].reason.contains("requires npm"));
    }

    #[test]
    fn optional_with_unmet_require_dropped_then_group_passes() {
        let source = MapSource::new()
            .with(Arc::new(MockBuildpack::new("A", "1").provides("node")))
            .with(Arc::new(MockBuildpack::new("B", "1").requires("python")));
        let order = Order::new(vec![group(vec![entry("A"), entry("B").optional()])]);
        let result = detector(&source).detect(&order).unwrap();
        assert_eq!(result.group, group(vec![entry("A")]));
        assert!(result.plan.entries.iter().all(|e| e.buildpack == "A"));
    }

    #[test]
    fn self_provide_satisfies_own_require() {
        let source = MapSource::new().with(Arc::new(
            MockBuildpack::new("A", "1").provides("x").requires("x"),
        ));
        let order = Order::new(vec![group(vec![entry("A")])]);
        assert!(detector(&source).detect(&order).is_ok());
    }

    #[test]
    fn all_optional_failing_rejects_group() {
        let source = MapSource::new().with(Arc::new(MockBuildpack::new("A", "1").failing_detect()));
        let order = Order::new(vec![group(vec![entry("A").optional()])]);
        assert!(matches!(
            detector(&source).detect(&order),
            Err(CoreError::DetectFailed(_))
        ));
    }

    #[test]
    fn failure_reports_every_group() {
        let source = MapSource::new()
            .with(Arc::new(MockBuildpack::new("A", "1").failing_detect()))
            .with(Arc::new(MockBuildpack::new("B", "1").erroring_detect()));
        let order = Order::new(vec![group(vec![entry("A")]), group(vec![entry("B")])]);
        let CoreError::DetectFailed(failure) = detector(&source).detect(&order).unwrap_err() else {
            panic!("expected detect failure");
        };
        assert_eq!(failure.rejections.len(), 2);
        assert!(failure.rejections[0].reason.contains("A@1"));
        assert!(failure.rejections[1].reason.contains("mock detect error"));
        let text = failure.to_string();
        assert!(text.contains("group 1"));
        assert!(text.contains("group 2"));
    }

    #[test]
    fn env_flows_forward_within_group_only() {
        let a = Arc::new(
            MockBuildpack::new("A", "1")
                .detect_env(EnvOp::new("FROM_A", EnvAction::Override, "1")),
        );
        let b = Arc::new(MockBuildpack::new("B", "1").requires_env("FROM_A"));
        let c = Arc::new(MockBuildpack::new("C", "1").failing_detect());
        let source = MapSource::new().with(a).with(b.clone()).with(c);

        // Group 1 sets FROM_A, then fails on C; group 2 must not see FROM_A.
        let order = Order::new(vec![
            group(vec![entry("A"), entry("B"), entry("C")]),
            group(vec![entry("B")]),
        ]);
        let err = detector(&source).detect(&order).unwrap_err();
        assert!(matches!(err, CoreError::DetectFailed(_)));
        let seen = b.detect_envs();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].get("FROM_A"), Some("1"));
        assert_eq!(seen[1].get("FROM_A"), None);
    }

    #[test]
    fn duplicate_ids_reject_group() {
        let source = MapSource::new().with(Arc::new(MockBuildpack::new("A", "1")));
        let order = Order::new(vec![group(vec![entry("A"), entry("A")])]);
        assert!(matches!(
            detector(&source).detect(&order),
            Err(CoreError::DetectFailed(_))
        ));
    }

    #[test]
    fn unknown_buildpack_aborts() {
        let source = MapSource::new();
        let order = Order::new(vec![group(vec![entry("missing")])]);
        assert!(matches!(
            detector(&source).detect(&order),
            Err(CoreError::Buildpack(BuildpackError::NotFound { .. }))
        ));
    }
}
