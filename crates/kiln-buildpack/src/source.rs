use crate::{Buildpack, BuildpackError, ProcessBuildpack};
use kiln_schema::{escape_id, verify_buildpack_api, BuildpackRef};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Resolves a group entry to a runnable buildpack.
///
/// Implementations must check the buildpack's declared API against the
/// supported range before handing it out.
pub trait BuildpackSource: Send + Sync {
    fn resolve(&self, entry: &BuildpackRef) -> Result<Arc<dyn Buildpack>, BuildpackError>;
}

fn check_api(entry: &BuildpackRef, buildpack: &dyn Buildpack) -> Result<(), BuildpackError> {
    let declared = entry
        .api
        .as_deref()
        .or(buildpack.descriptor().api.as_deref());
    verify_buildpack_api(&entry.to_string(), declared)?;
    Ok(())
}

/// Buildpacks installed as `<root>/<escaped-id>/<version>/buildpack.toml`.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn buildpack_dir(&self, entry: &BuildpackRef) -> PathBuf {
        self.root.join(escape_id(&entry.id)).join(&entry.version)
    }
}

impl BuildpackSource for DirectorySource {
    fn resolve(&self, entry: &BuildpackRef) -> Result<Arc<dyn Buildpack>, BuildpackError> {
        let dir = self.buildpack_dir(entry);
        if !dir.join("buildpack.toml").is_file() {
            return Err(BuildpackError::NotFound {
                id: entry.id.to_string(),
                version: entry.version.clone(),
            });
        }
        debug!("loading {entry} from {}", dir.display());
        let buildpack = ProcessBuildpack::load(dir)?;
        check_api(entry, &buildpack)?;
        Ok(Arc::new(buildpack))
    }
}

/// In-memory source keyed by buildpack id.
#[derive(Default)]
pub struct MapSource {
    buildpacks: HashMap<String, Arc<dyn Buildpack>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, buildpack: Arc<dyn Buildpack>) {
        self.buildpacks
            .insert(buildpack.descriptor().id().to_string(), buildpack);
    }

    #[must_use]
    pub fn with(mut self, buildpack: Arc<dyn Buildpack>) -> Self {
        self.insert(buildpack);
        self
    }
}

impl BuildpackSource for MapSource {
    fn resolve(&self, entry: &BuildpackRef) -> Result<Arc<dyn Buildpack>, BuildpackError> {
        let buildpack = self
            .buildpacks
            .get(entry.id.as_str())
            .ok_or_else(|| BuildpackError::NotFound {
                id: entry.id.to_string(),
                version: entry.version.clone(),
            })?;
        check_api(entry, buildpack.as_ref())?;
        Ok(Arc::clone(buildpack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockBuildpack;
    use std::fs;

    #[test]
    fn directory_source_uses_escaped_id_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let bp_dir = dir.path().join("acme_node").join("1.0");
        fs::create_dir_all(&bp_dir).unwrap();
        fs::write(
            bp_dir.join("buildpack.toml"),
            "api = \"0.3\"\n[buildpack]\nid = \"acme/node\"\nversion = \"1.0\"\n",
        )
        .unwrap();

        let source = DirectorySource::new(dir.path());
        let bp = source.resolve(&BuildpackRef::new("acme/node", "1.0")).unwrap();
        assert_eq!(bp.descriptor().id(), "acme/node");
    }

    #[test]
    fn directory_source_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(
            source.resolve(&BuildpackRef::new("acme/none", "1")),
            Err(BuildpackError::NotFound { .. })
        ));
    }

    #[test]
    fn incompatible_descriptor_api_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bp_dir = dir.path().join("acme_new").join("1");
        fs::create_dir_all(&bp_dir).unwrap();
        fs::write(
            bp_dir.join("buildpack.toml"),
            "api = \"9.0\"\n[buildpack]\nid = \"acme/new\"\nversion = \"1\"\n",
        )
        .unwrap();
        let source = DirectorySource::new(dir.path());
        assert!(matches!(
            source.resolve(&BuildpackRef::new("acme/new", "1")),
            Err(BuildpackError::Api(_))
        ));
    }

    #[test]
    fn map_source_defaults_undeclared_api() {
        let source = MapSource::new().with(Arc::new(MockBuildpack::new("a", "1")));
        assert!(source.resolve(&BuildpackRef::new("a", "1")).is_ok());
        assert!(source.resolve(&BuildpackRef::new("b", "1")).is_err());
    }

    #[test]
    fn group_entry_api_takes_precedence() {
        let source = MapSource::new().with(Arc::new(MockBuildpack::new("a", "1").with_api("0.3")));
        let entry = BuildpackRef::new("a", "1").with_api("0.1");
        assert!(matches!(source.resolve(&entry), Err(BuildpackError::Api(_))));
    }
}
