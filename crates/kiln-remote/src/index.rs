use crate::{ImageRef, RemoteError};
use kiln_schema::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Where a tag points, and where it pointed before the last move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagEntry {
    pub manifest: Digest,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced: Option<Digest>,
}

/// Tag table of a [`LocalRegistry`](crate::LocalRegistry), stored as
/// `index.json`. Keys are `repository:tag`; untagged references use
/// `latest`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagIndex {
    tags: BTreeMap<String, TagEntry>,
}

impl TagIndex {
    pub fn key(image: &ImageRef) -> String {
        format!("{}:{}", image.repository, image.tag.as_deref().unwrap_or("latest"))
    }

    /// Read the index at `path`; a missing file is an empty index.
    pub fn read(path: &Path) -> Result<Self, RemoteError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Serialization(format!("{}: {e}", path.display())))
    }

    pub fn write(&self, path: &Path) -> Result<(), RemoteError> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| RemoteError::Io(e.error))?;
        Ok(())
    }

    /// Point the tag of `image` at `manifest`. Returns the manifest it
    /// pointed at before, if it moved.
    pub fn point(&mut self, image: &ImageRef, manifest: Digest) -> Option<Digest> {
        let key = Self::key(image);
        let replaced = self
            .tags
            .get(&key)
            .map(|e| e.manifest.clone())
            .filter(|old| *old != manifest);
        self.tags.insert(
            key,
            TagEntry {
                manifest,
                updated_at: chrono::Utc::now().to_rfc3339(),
                replaced: replaced.clone(),
            },
        );
        replaced
    }

    pub fn get(&self, image: &ImageRef) -> Option<&TagEntry> {
        self.tags.get(&Self::key(image))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    /// Keys whose tag points at `manifest`.
    pub fn tags_of<'a>(&'a self, manifest: &'a Digest) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |(_, e)| &e.manifest == manifest)
            .map(|(k, _)| k.as_str())
    }
}
