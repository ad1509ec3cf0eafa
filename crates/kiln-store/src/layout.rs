use crate::{fsync_dir, CacheError};
use kiln_schema::Digest;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk format of a volume cache. Bumped on incompatible changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// The three generations a volume cache directory can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// What the last successful export left behind; read by analyze and restore.
    Committed,
    /// Written by the current export.
    Staging,
    /// The previous committed state while a commit is in flight.
    Backup,
}

impl Slot {
    fn dir_name(self) -> &'static str {
        match self {
            Slot::Committed => "committed",
            Slot::Staging => "staging",
            Slot::Backup => "backup",
        }
    }
}

/// Paths and generation moves of a volume cache.
///
/// ```text
/// <root>/format                      format version stamp
/// <root>/<slot>/metadata.json
/// <root>/<slot>/sha256/<hex>.tar
/// ```
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, slot: Slot) -> PathBuf {
        self.root.join(slot.dir_name())
    }

    pub fn blob_dir(&self, slot: Slot) -> PathBuf {
        self.dir(slot).join("sha256")
    }

    pub fn metadata_path(&self, slot: Slot) -> PathBuf {
        self.dir(slot).join("metadata.json")
    }

    /// Only well-formed digests map to a path, so a crafted digest cannot
    /// point outside the cache.
    pub fn blob_path(&self, slot: Slot, digest: &Digest) -> Result<PathBuf, CacheError> {
        if !digest.is_valid() {
            return Err(CacheError::InvalidDigest(digest.to_string()));
        }
        Ok(self.blob_dir(slot).join(format!("{}.tar", digest.hex())))
    }

    /// Undo whatever an interrupted run left: a commit that stopped after
    /// moving `committed` aside is rolled back, a finished one loses its
    /// backup, and staging from a dead export is thrown away.
    pub fn recover(&self) -> Result<(), CacheError> {
        let (committed, backup, staging) =
            (self.dir(Slot::Committed), self.dir(Slot::Backup), self.dir(Slot::Staging));
        if backup.exists() {
            if committed.exists() {
                fs::remove_dir_all(&backup)?;
            } else {
                warn!("cache {}: rolling back an interrupted commit", self.root.display());
                fs::rename(&backup, &committed)?;
            }
        }
        if staging.exists() {
            debug!("cache {}: dropping leftover staging", self.root.display());
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(self.blob_dir(Slot::Committed))?;
        fs::create_dir_all(self.blob_dir(Slot::Staging))?;
        Ok(())
    }

    /// Write the format stamp on a fresh cache, or check it on an old one.
    pub fn stamp(&self) -> Result<(), CacheError> {
        let path = self.root.join("format");
        match fs::read_to_string(&path) {
            Ok(text) => {
                let found = text.trim().parse().unwrap_or(0);
                if found == CACHE_FORMAT_VERSION {
                    Ok(())
                } else {
                    Err(CacheError::VersionMismatch {
                        expected: CACHE_FORMAT_VERSION,
                        found,
                    })
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&path, format!("{CACHE_FORMAT_VERSION}\n"))?;
                fsync_dir(&self.root)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make staging the committed generation and start an empty staging.
    /// Between the two renames the old generation sits in `backup`, which
    /// [`recover`](Self::recover) puts back.
    pub fn promote_staging(&self) -> Result<(), CacheError> {
        let (committed, backup) = (self.dir(Slot::Committed), self.dir(Slot::Backup));
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        if committed.exists() {
            fs::rename(&committed, &backup)?;
        }
        fs::rename(self.dir(Slot::Staging), &committed)?;
        fsync_dir(&self.root)?;
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        fs::create_dir_all(self.blob_dir(Slot::Staging))?;
        Ok(())
    }
}
