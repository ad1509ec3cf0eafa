use crate::types::BuildpackId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to one buildpack inside a group or order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackRef {
    pub id: BuildpackId,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl BuildpackRef {
    pub fn new(id: impl Into<BuildpackId>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            api: None,
            optional: false,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn with_api(mut self, api: impl Into<String>) -> Self {
        self.api = Some(api.into());
        self
    }

    /// Directory name used for this buildpack under the layers directory.
    pub fn dir_name(&self) -> String {
        escape_id(&self.id)
    }
}

impl fmt::Display for BuildpackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Ordered list of buildpacks. Order is execution order and provide visibility order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub group: Vec<BuildpackRef>,
}

impl Group {
    pub fn new(group: Vec<BuildpackRef>) -> Self {
        Self { group }
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BuildpackRef> {
        self.group.iter()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.group.iter().position(|bp| bp.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Reject empty groups and duplicate buildpack ids.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.group.is_empty() {
            return Err(SchemaError::InvalidRecord("group is empty".to_owned()));
        }
        for (i, bp) in self.group.iter().enumerate() {
            if bp.id.is_empty() {
                return Err(SchemaError::InvalidRecord(format!(
                    "group entry {i} has an empty buildpack id"
                )));
            }
            if self.group[..i].iter().any(|prev| prev.id == bp.id) {
                return Err(SchemaError::InvalidRecord(format!(
                    "buildpack {} appears more than once in group",
                    bp.id
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.group.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

impl<'a> IntoIterator for &'a Group {
    type Item = &'a BuildpackRef;
    type IntoIter = std::slice::Iter<'a, BuildpackRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.group.iter()
    }
}

/// Candidate groups, tried in order by the detector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub order: Vec<Group>,
}

impl Order {
    pub fn new(order: Vec<Group>) -> Self {
        Self { order }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackInfo {
    pub id: BuildpackId,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Contents of a buildpack's `buildpack.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    pub buildpack: BuildpackInfo,
}

impl BuildpackDescriptor {
    pub fn new(id: impl Into<BuildpackId>, version: impl Into<String>) -> Self {
        Self {
            api: None,
            buildpack: BuildpackInfo {
                id: id.into(),
                version: version.into(),
                name: String::new(),
            },
        }
    }

    pub fn id(&self) -> &BuildpackId {
        &self.buildpack.id
    }

    pub fn version(&self) -> &str {
        &self.buildpack.version
    }
}

/// Escape a buildpack id for use as a single path component.
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}
