//! Environment seen by buildpacks and baked into the exported image.
//!
//! Buildpacks change the environment with operations stored as files in a
//! layer's env directories:
//!
//! ```text
//! <layer>/env/NAME.append     value appended to NAME
//! <layer>/env/NAME.prepend    value prepended to NAME
//! <layer>/env/NAME.override   NAME set to value
//! <layer>/env/NAME.default    NAME set only if unset
//! <layer>/env/NAME.delim      delimiter for append/prepend
//! <layer>/env/NAME            same as .override
//! <layer>/env.build/...       build-time only
//! <layer>/env.launch/...      launch-time only
//! ```

use crate::BuildpackError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_DELIM: &str = ":";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvAction {
    Append,
    Prepend,
    Override,
    Default,
}

impl EnvAction {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "append" => Some(Self::Append),
            "prepend" => Some(Self::Prepend),
            "override" => Some(Self::Override),
            "default" => Some(Self::Default),
            _ => None,
        }
    }
}

/// One environment change declared by a buildpack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOp {
    pub name: String,
    pub action: EnvAction,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delim: Option<String>,
}

impl EnvOp {
    pub fn new(name: impl Into<String>, action: EnvAction, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action,
            value: value.into(),
            delim: None,
        }
    }

    pub fn prepend_path(name: &str, dir: &Path) -> Self {
        Self::new(name, EnvAction::Prepend, dir.to_string_lossy())
    }

    #[must_use]
    pub fn with_delim(mut self, delim: impl Into<String>) -> Self {
        self.delim = Some(delim.into());
        self
    }
}

/// Which of a layer's env directories apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvScope {
    Build,
    Launch,
}

impl EnvScope {
    fn dir_name(self) -> &'static str {
        match self {
            EnvScope::Build => "env.build",
            EnvScope::Launch => "env.launch",
        }
    }
}

/// An ordered set of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    vars: BTreeMap<String, String>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// The environment of the current process.
    pub fn from_process() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<K: Into<String>, V: Into<String>>(vars: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    pub fn apply(&mut self, op: &EnvOp) {
        let delim = op.delim.as_deref().unwrap_or(DEFAULT_DELIM);
        let existing = self.vars.get(&op.name).filter(|v| !v.is_empty());
        let value = match (op.action, existing) {
            (EnvAction::Override, _) | (EnvAction::Default | EnvAction::Append | EnvAction::Prepend, None) => {
                op.value.clone()
            }
            (EnvAction::Default, Some(_)) => return,
            (EnvAction::Append, Some(old)) => format!("{old}{delim}{}", op.value),
            (EnvAction::Prepend, Some(old)) => format!("{}{delim}{old}", op.value),
        };
        self.vars.insert(op.name.clone(), value);
    }

    pub fn apply_all<'a>(&mut self, ops: impl IntoIterator<Item = &'a EnvOp>) {
        for op in ops {
            self.apply(op);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `NAME=value` entries, sorted by name, as stored in an image config.
    pub fn to_list(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Parse an env directory into operations, sorted by variable name.
/// A missing directory yields no operations.
pub fn read_env_dir(dir: &Path) -> Result<Vec<EnvOp>, BuildpackError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    let mut ops = Vec::new();
    let mut delims: BTreeMap<String, String> = BTreeMap::new();
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let value = read_value(&entry.path())?;
        match file_name.rsplit_once('.') {
            Some((name, "delim")) => {
                delims.insert(name.to_owned(), value);
            }
            Some((name, suffix)) => match EnvAction::from_suffix(suffix) {
                Some(action) => ops.push(EnvOp::new(name, action, value)),
                None => ops.push(EnvOp::new(file_name, EnvAction::Override, value)),
            },
            None => ops.push(EnvOp::new(file_name, EnvAction::Override, value)),
        }
    }
    for op in &mut ops {
        if let Some(delim) = delims.get(&op.name) {
            op.delim = Some(delim.clone());
        }
    }
    Ok(ops)
}

/// A single trailing newline is dropped so `echo value > NAME` works.
fn read_value(path: &Path) -> Result<String, BuildpackError> {
    let mut value = fs::read_to_string(path)?;
    if value.ends_with('\n') {
        value.pop();
    }
    Ok(value)
}

/// Every operation a layer contributes in `scope`: implicit `bin`/`lib`
/// paths first, then `env/`, then `env.build/` or `env.launch/`.
///
/// `layer_dir` is where the layer lives now; `mount` is the path written
/// into the values, which differs from `layer_dir` for the launch image.
pub fn layer_env_ops(layer_dir: &Path, mount: &Path, scope: EnvScope) -> Result<Vec<EnvOp>, BuildpackError> {
    let mut ops = Vec::new();
    if layer_dir.join("bin").is_dir() {
        ops.push(EnvOp::prepend_path("PATH", &mount.join("bin")));
    }
    if layer_dir.join("lib").is_dir() {
        let lib = mount.join("lib");
        if scope == EnvScope::Build {
            ops.push(EnvOp::prepend_path("LIBRARY_PATH", &lib));
        }
        ops.push(EnvOp::prepend_path("LD_LIBRARY_PATH", &lib));
    }
    ops.extend(read_env_dir(&layer_dir.join("env"))?);
    ops.extend(read_env_dir(&layer_dir.join(scope.dir_name()))?);
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_prepend_use_delimiter() {
        let mut env = Env::from_vars([("PATH", "/usr/bin")]);
        env.apply(&EnvOp::new("PATH", EnvAction::Prepend, "/opt/bin"));
        env.apply(&EnvOp::new("PATH", EnvAction::Append, "/tail").with_delim(";"));
        assert_eq!(env.get("PATH"), Some("/opt/bin:/usr/bin;/tail"));
    }

    #[test]
    fn append_to_unset_has_no_delimiter() {
        let mut env = Env::new();
        env.apply(&EnvOp::new("NODE_PATH", EnvAction::Append, "/a"));
        assert_eq!(env.get("NODE_PATH"), Some("/a"));
    }

    #[test]
    fn default_only_sets_missing() {
        let mut env = Env::from_vars([("A", "keep")]);
        env.apply(&EnvOp::new("A", EnvAction::Default, "x"));
        env.apply(&EnvOp::new("B", EnvAction::Default, "y"));
        assert_eq!(env.get("A"), Some("keep"));
        assert_eq!(env.get("B"), Some("y"));
    }

    #[test]
    fn override_replaces() {
        let mut env = Env::from_vars([("A", "old")]);
        env.apply(&EnvOp::new("A", EnvAction::Override, "new"));
        assert_eq!(env.to_list(), vec!["A=new"]);
    }

    #[test]
    fn read_env_dir_parses_suffixes_and_delims() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("JAVA_OPTS.append"), "-Xmx1g\n").unwrap();
        fs::write(dir.path().join("JAVA_OPTS.delim"), " ").unwrap();
        fs::write(dir.path().join("HOME.default"), "/home/app").unwrap();
        fs::write(dir.path().join("PLAIN"), "v").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let ops = read_env_dir(dir.path()).unwrap();
        assert_eq!(
            ops,
            vec![
                EnvOp::new("HOME", EnvAction::Default, "/home/app"),
                EnvOp::new("JAVA_OPTS", EnvAction::Append, "-Xmx1g").with_delim(" "),
                EnvOp::new("PLAIN", EnvAction::Override, "v"),
            ]
        );
    }

    #[test]
    fn missing_env_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_dir(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn layer_ops_include_implicit_paths_and_scope() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("runtime");
        fs::create_dir_all(layer.join("bin")).unwrap();
        fs::create_dir_all(layer.join("lib")).unwrap();
        fs::create_dir_all(layer.join("env.build")).unwrap();
        fs::create_dir_all(layer.join("env.launch")).unwrap();
        fs::write(layer.join("env.build/BUILD_ONLY.override"), "1").unwrap();
        fs::write(layer.join("env.launch/LAUNCH_ONLY.override"), "1").unwrap();

        let build = layer_env_ops(&layer, &layer, EnvScope::Build).unwrap();
        let names: Vec<_> = build.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["PATH", "LIBRARY_PATH", "LD_LIBRARY_PATH", "BUILD_ONLY"]);

        let mount = Path::new("/layers/acme_node/runtime");
        let launch = layer_env_ops(&layer, mount, EnvScope::Launch).unwrap();
        assert_eq!(launch[0].value, "/layers/acme_node/runtime/bin");
        assert!(launch.iter().any(|o| o.name == "LAUNCH_ONLY"));
        assert!(!launch.iter().any(|o| o.name == "BUILD_ONLY"));
    }
}
