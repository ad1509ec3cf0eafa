use crate::buildpack::BuildpackRef;
use crate::plan::Metadata;
use crate::types::BuildpackId;
use serde::{Deserialize, Serialize};

/// A launchable process declared by a buildpack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub direct: bool,
}

impl Process {
    pub fn new(kind: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            command: command.into(),
            args: Vec::new(),
            direct: false,
        }
    }
}

/// Bill-of-materials entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildpack: Option<BuildpackId>,
}

impl BomEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Metadata::new(),
            buildpack: None,
        }
    }
}

/// `launch.toml` written by a buildpack into its layers directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchToml {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<Process>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bom: Vec<BomEntry>,
}

/// Merged build output: `<layers>/config/metadata.toml` and the
/// `io.buildpacks.build.metadata` label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default)]
    pub processes: Vec<Process>,
    #[serde(default)]
    pub bom: Vec<BomEntry>,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackRef>,
}

impl BuildMetadata {
    /// Add processes, replacing any earlier process of the same type.
    pub fn merge_processes(&mut self, processes: impl IntoIterator<Item = Process>) {
        for process in processes {
            match self.processes.iter_mut().find(|p| p.kind == process.kind) {
                Some(existing) => *existing = process,
                None => self.processes.push(process),
            }
        }
    }

    /// `web` if declared, else the first process.
    pub fn default_process(&self) -> Option<&Process> {
        self.processes
            .iter()
            .find(|p| p.kind == "web")
            .or_else(|| self.processes.first())
    }

    /// Entrypoint and cmd for the image config, derived from the default process.
    pub fn entrypoint(&self) -> (Vec<String>, Vec<String>) {
        match self.default_process() {
            None => (Vec::new(), Vec::new()),
            Some(p) if p.direct => (vec![p.command.clone()], p.args.clone()),
            Some(p) => {
                let mut script = p.command.clone();
                for arg in &p.args {
                    script.push(' ');
                    script.push_str(arg);
                }
                (vec!["/bin/sh".to_owned(), "-c".to_owned()], vec![script])
            }
        }
    }
}
