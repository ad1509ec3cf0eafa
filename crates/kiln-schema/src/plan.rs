//! Build plan entries exchanged between buildpacks during detection.

use crate::buildpack::Group;
use crate::types::BuildpackId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Free-form metadata attached to plan entries and layers.
pub type Metadata = toml::Table;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provide {
    pub name: String,
}

impl Provide {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Require {
    pub name: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Require {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What a single buildpack's detect step declared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectPlan {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<Provide>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<Require>,
}

impl DetectPlan {
    pub fn is_empty(&self) -> bool {
        self.provides.is_empty() && self.requires.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Provide,
    Require,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPlanEntry {
    pub name: String,
    pub kind: EntryKind,
    pub buildpack: BuildpackId,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Merged plan of a group: strict union of every buildpack's entries, in group order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default)]
    pub entries: Vec<BuildPlanEntry>,
}

impl BuildPlan {
    /// Append everything `buildpack` declared. Duplicates are kept.
    pub fn push_detect(&mut self, buildpack: &BuildpackId, plan: &DetectPlan) {
        for req in &plan.requires {
            self.entries.push(BuildPlanEntry {
                name: req.name.clone(),
                kind: EntryKind::Require,
                buildpack: buildpack.clone(),
                metadata: req.metadata.clone(),
            });
        }
        for prov in &plan.provides {
            self.entries.push(BuildPlanEntry {
                name: prov.name.clone(),
                kind: EntryKind::Provide,
                buildpack: buildpack.clone(),
                metadata: Metadata::new(),
            });
        }
    }

    /// First require entry not satisfied by a provide from a buildpack at the
    /// same or an earlier position in `group`. Returns the requiring buildpack
    /// and the entry name.
    pub fn first_unmet(&self, group: &Group) -> Option<(BuildpackId, String)> {
        let position = |id: &BuildpackId| group.position(id).unwrap_or(usize::MAX);
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Require)
            .find(|req| {
                let at = position(&req.buildpack);
                !self.entries.iter().any(|p| {
                    p.kind == EntryKind::Provide && p.name == req.name && position(&p.buildpack) <= at
                })
            })
            .map(|req| (req.buildpack.clone(), req.name.clone()))
    }

    /// Entry names provided by `buildpack`.
    pub fn provided_by(&self, buildpack: &str) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Provide && e.buildpack == buildpack)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// The plan handed to `buildpack` at build time: every require whose name
    /// it provides, plus its own requires.
    pub fn for_buildpack(&self, buildpack: &str) -> BuildpackPlan {
        let provided = self.provided_by(buildpack);
        let entries = self
            .entries
            .iter()
            .filter(|e| {
                e.kind == EntryKind::Require
                    && (e.buildpack == buildpack || provided.contains(e.name.as_str()))
            })
            .map(|e| Require {
                name: e.name.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();
        BuildpackPlan { entries }
    }

    pub fn remove_buildpack(&mut self, buildpack: &str) {
        self.entries.retain(|e| e.buildpack != buildpack);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entries passed to a single buildpack's build step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackPlan {
    #[serde(default)]
    pub entries: Vec<Require>,
}

impl BuildpackPlan {
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}
