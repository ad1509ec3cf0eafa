//! The working layers directory shared by all phases of one build.
//!
//! ```text
//! <layers>/group.toml  plan.toml  analyzed.toml  report.toml  .kiln.lock
//! <layers>/config/metadata.toml
//! <layers>/<escaped-buildpack-id>/
//!     <layer>/          layer content
//!     <layer>.toml      facets + metadata written by the buildpack
//!     <layer>.sha       digest of the content when it was restored
//!     launch.toml       processes and bill-of-materials
//! ```

use crate::CacheError;
use kiln_schema::{escape_id, read_record, write_record, Digest, LaunchToml, LayerDescriptor, LayerName};
use std::fs;
use std::path::{Path, PathBuf};

/// Path prefix of buildpack layers inside image layer tars.
pub const IMAGE_LAYERS_PREFIX: &str = "layers";
/// Path prefix of the application layer inside its tar.
pub const IMAGE_APP_PREFIX: &str = "workspace";

#[derive(Debug, Clone)]
pub struct LayersDir {
    root: PathBuf,
}

impl LayersDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn group_path(&self) -> PathBuf {
        self.root.join("group.toml")
    }

    #[inline]
    pub fn plan_path(&self) -> PathBuf {
        self.root.join("plan.toml")
    }

    #[inline]
    pub fn analyzed_path(&self) -> PathBuf {
        self.root.join("analyzed.toml")
    }

    #[inline]
    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.toml")
    }

    #[inline]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".kiln.lock")
    }

    #[inline]
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    #[inline]
    pub fn build_metadata_path(&self) -> PathBuf {
        self.config_dir().join("metadata.toml")
    }

    pub fn buildpack_dir(&self, buildpack: &str) -> PathBuf {
        self.root.join(escape_id(buildpack))
    }

    pub fn launch_path(&self, buildpack: &str) -> PathBuf {
        self.buildpack_dir(buildpack).join("launch.toml")
    }

    pub fn layer(&self, buildpack: &str, name: &str) -> LayerDir {
        let bp_dir = self.buildpack_dir(buildpack);
        LayerDir {
            name: LayerName::new(name),
            prefix: format!("{IMAGE_LAYERS_PREFIX}/{}/{name}", escape_id(buildpack)),
            dir: bp_dir.join(name),
            toml: bp_dir.join(format!("{name}.toml")),
            sha: bp_dir.join(format!("{name}.sha")),
        }
    }

    /// Names of every layer the buildpack directory knows about, whether it
    /// has content, a TOML, or both. Sorted.
    pub fn layer_names(&self, buildpack: &str) -> Result<Vec<LayerName>, CacheError> {
        let dir = self.buildpack_dir(buildpack);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let layer = if entry.file_type()?.is_dir() {
                Some(name)
            } else {
                name.strip_suffix(".toml")
                    .filter(|stem| !LayerName::new(*stem).is_reserved())
                    .or_else(|| name.strip_suffix(".sha"))
            };
            if let Some(layer) = layer {
                let layer = LayerName::new(layer);
                if !names.contains(&layer) {
                    names.push(layer);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn read_launch(&self, buildpack: &str) -> Result<Option<LaunchToml>, CacheError> {
        let path = self.launch_path(buildpack);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_record(&path)?))
    }

    pub fn create(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Paths belonging to one layer of one buildpack.
#[derive(Debug, Clone)]
pub struct LayerDir {
    pub name: LayerName,
    /// Path prefix of this layer inside its image tar.
    pub prefix: String,
    pub dir: PathBuf,
    pub toml: PathBuf,
    pub sha: PathBuf,
}

impl LayerDir {
    pub fn has_content(&self) -> bool {
        self.dir.is_dir()
    }

    pub fn read_descriptor(&self) -> Result<Option<LayerDescriptor>, CacheError> {
        if !self.toml.exists() {
            return Ok(None);
        }
        Ok(Some(read_record(&self.toml)?))
    }

    pub fn write_descriptor(&self, descriptor: &LayerDescriptor) -> Result<(), CacheError> {
        write_record(&self.toml, descriptor)?;
        Ok(())
    }

    pub fn read_sha(&self) -> Result<Option<Digest>, CacheError> {
        if !self.sha.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.sha)?;
        Ok(Digest::parse(text.trim()).ok())
    }

    pub fn write_sha(&self, digest: &Digest) -> Result<(), CacheError> {
        if let Some(parent) = self.sha.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.sha, digest.as_str())?;
        Ok(())
    }

    /// Remove content, TOML, and digest marker.
    pub fn remove(&self) -> Result<(), CacheError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        for file in [&self.toml, &self.sha] {
            if file.exists() {
                fs::remove_file(file)?;
            }
        }
        Ok(())
    }
}
