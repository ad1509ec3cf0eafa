use crate::cache::{CacheStore, DigestLocks};
use crate::layout::{CacheLayout, Slot};
use crate::{fsync_dir, CacheError};
use kiln_schema::{CacheMetadata, Digest};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Directory-backed cache.
///
/// Writes land in `staging/` and are visible to `get_layer` at once. `commit`
/// swaps staging into `committed/` by way of a `backup/` rename, so a run
/// killed mid-commit leaves either the old or the new committed state, never
/// a mix. Entries are verified against their digest on write and on read.
pub struct VolumeCache {
    layout: CacheLayout,
    locks: DigestLocks,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataEnvelope {
    checksum: String,
    saved_at: String,
    metadata: CacheMetadata,
}

fn checksum(metadata: &CacheMetadata) -> Result<String, CacheError> {
    let json = serde_json::to_string(metadata)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

impl VolumeCache {
    /// Open (creating if needed) the cache at `root`. Leftovers of an
    /// interrupted run are cleaned up: a pending commit is rolled back to the
    /// backup and stale staging content is discarded.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let layout = CacheLayout::new(root);
        fs::create_dir_all(layout.root())?;
        layout.recover()?;
        layout.stamp()?;
        Ok(Self {
            layout,
            locks: DigestLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    fn lookup(&self, digest: &Digest) -> Result<Option<PathBuf>, CacheError> {
        let staged = self.layout.blob_path(Slot::Staging, digest)?;
        if staged.exists() {
            return Ok(Some(staged));
        }
        let committed = self.layout.blob_path(Slot::Committed, digest)?;
        Ok(committed.exists().then_some(committed))
    }

    fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), CacheError> {
        let dir = dest
            .parent()
            .ok_or_else(|| CacheError::Io(io::Error::other("cache path has no parent")))?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| CacheError::Io(e.error))?;
        fsync_dir(dir)?;
        Ok(())
    }

    /// Committed layer digests, sorted.
    pub fn list_committed(&self) -> Result<Vec<Digest>, CacheError> {
        let dir = self.layout.blob_dir(Slot::Committed);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut digests = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(hex) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".tar"))
            {
                let digest = Digest::new(format!("sha256:{hex}"));
                if digest.is_valid() {
                    digests.push(digest);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }
}

impl CacheStore for VolumeCache {
    fn name(&self) -> String {
        format!("volume:{}", self.layout.root().display())
    }

    fn put_layer(&self, digest: &Digest, data: &[u8]) -> Result<(), CacheError> {
        let dest = self.layout.blob_path(Slot::Staging, digest)?;
        if !digest.matches(data) {
            return Err(CacheError::IntegrityFailure {
                digest: digest.to_string(),
                actual: Digest::of(data).to_string(),
            });
        }
        self.locks.with(digest, || {
            if dest.exists() {
                return Ok(());
            }
            debug!("cache put {}", digest.short());
            Self::write_atomic(&dest, data)
        })
    }

    fn get_layer(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        self.locks.with(digest, || {
            let path = self
                .lookup(digest)?
                .ok_or_else(|| CacheError::NotFound(digest.to_string()))?;
            let data = fs::read(&path)?;
            if !digest.matches(&data) {
                return Err(CacheError::IntegrityFailure {
                    digest: digest.to_string(),
                    actual: Digest::of(&data).to_string(),
                });
            }
            Ok(data)
        })
    }

    fn has_layer(&self, digest: &Digest) -> Result<bool, CacheError> {
        Ok(self.lookup(digest)?.is_some())
    }

    fn reuse_layer(&self, digest: &Digest) -> Result<(), CacheError> {
        let staged = self.layout.blob_path(Slot::Staging, digest)?;
        let committed = self.layout.blob_path(Slot::Committed, digest)?;
        self.locks.with(digest, || {
            if staged.exists() {
                return Ok(());
            }
            if !committed.exists() {
                return Err(CacheError::NotFound(digest.to_string()));
            }
            debug!("cache reuse {}", digest.short());
            if fs::hard_link(&committed, &staged).is_err() {
                let data = fs::read(&committed)?;
                Self::write_atomic(&staged, &data)?;
            }
            Ok(())
        })
    }

    fn set_metadata(&self, metadata: &CacheMetadata) -> Result<(), CacheError> {
        let envelope = MetadataEnvelope {
            checksum: checksum(metadata)?,
            saved_at: chrono::Utc::now().to_rfc3339(),
            metadata: metadata.clone(),
        };
        let content = serde_json::to_vec_pretty(&envelope)?;
        Self::write_atomic(&self.layout.metadata_path(Slot::Staging), &content)
    }

    fn retrieve_metadata(&self) -> Result<CacheMetadata, CacheError> {
        let path = self.layout.metadata_path(Slot::Committed);
        if !path.exists() {
            return Ok(CacheMetadata::default());
        }
        let content = fs::read(&path)?;
        let envelope: MetadataEnvelope = serde_json::from_slice(&content)?;
        let actual = checksum(&envelope.metadata)?;
        if actual != envelope.checksum {
            return Err(CacheError::MetadataCorrupt {
                expected: envelope.checksum,
                actual,
            });
        }
        Ok(envelope.metadata)
    }

    fn commit(&self) -> Result<(), CacheError> {
        self.layout.promote_staging()?;
        info!("committed cache {}", self.layout.root().display());
        Ok(())
    }
}
