//! Layer cache, deterministic layer packing, and the working layers directory for kiln.
//!
//! This crate provides the storage layer: the backend-agnostic `CacheStore`
//! contract with its directory-backed `VolumeCache` implementation,
//! `pack_layer`/`unpack_layer` for turning a layer directory into a
//! reproducible tar and back, and `LayersDir` describing the on-disk working
//! layers directory that phases share.

pub mod cache;
pub mod layers;
pub mod layout;
pub mod volume;
pub mod workspace;

pub use cache::{CacheStore, DigestLocks};
pub use layers::{pack_layer, unpack_layer, unpack_layer_atomic, PackedLayer};
pub use layout::{CacheLayout, Slot, CACHE_FORMAT_VERSION};
pub use volume::VolumeCache;
pub use workspace::{LayerDir, LayersDir, IMAGE_APP_PREFIX, IMAGE_LAYERS_PREFIX};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry not found: {0}")]
    NotFound(String),
    #[error("integrity check failed for '{digest}': content hashes to {actual}")]
    IntegrityFailure { digest: String, actual: String },
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),
    #[error("cache metadata checksum mismatch: expected {expected}, got {actual}")]
    MetadataCorrupt { expected: String, actual: String },
    #[error("cache format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record error: {0}")]
    Record(#[from] kiln_schema::SchemaError),
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Misses are not failures; callers degrade to a rebuild.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguishable() {
        assert!(CacheError::NotFound("sha256:abc".to_owned()).is_not_found());
        assert!(!CacheError::Backend("down".to_owned()).is_not_found());
    }

    #[test]
    fn integrity_failure_display() {
        let e = CacheError::IntegrityFailure {
            digest: "sha256:aaa".to_owned(),
            actual: "sha256:bbb".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("sha256:aaa"));
        assert!(msg.contains("sha256:bbb"));
    }

    #[test]
    fn version_mismatch_display() {
        let e = CacheError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        assert!(e.to_string().contains('7'));
    }
}
