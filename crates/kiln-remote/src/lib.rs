//! Image transport and image-backed layer cache for kiln.
//!
//! Every registry or daemon interaction goes through the `ImageTransport`
//! trait: fetching a previous image for analysis, pushing exported and
//! rebased images, and reading or writing cache images. Two transports are
//! provided: `HttpRegistry` speaks a simplified registry HTTP API, and
//! `LocalRegistry` keeps images in a directory and plays the role of the
//! local daemon. `ImageCache` implements the store crate's `CacheStore` on
//! top of any transport.

pub mod cache;
pub mod config;
pub mod http;
pub mod index;
pub mod local;
pub mod reference;
pub mod transfer;

pub use cache::{ImageCache, CACHE_METADATA_LABEL};
pub use config::RemoteConfig;
pub use http::HttpRegistry;
pub use index::{TagEntry, TagIndex};
pub use local::LocalRegistry;
pub use reference::ImageRef;
pub use transfer::{copy_missing_blobs, push_image_with_layers, TransferReport};

use kiln_schema::{Digest, Image};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("image error: {0}")]
    Schema(#[from] kiln_schema::SchemaError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport config error: {0}")]
    Config(String),
    #[error("invalid image reference '{0}'")]
    InvalidReference(String),
    #[error("integrity failure for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
}

/// Pull, push, and inspect images by reference.
///
/// Blobs are addressed by digest within the repository of `image`.
/// Authentication is the transport's concern; callers never see credentials.
pub trait ImageTransport: Send + Sync {
    /// Human-readable transport name for logs.
    fn name(&self) -> String;

    /// Fetch manifest and config of `image`. `Ok(None)` when it does not exist.
    fn fetch_image(&self, image: &ImageRef) -> Result<Option<Image>, RemoteError>;

    /// Fetch a blob, verified against `digest`.
    fn fetch_blob(&self, image: &ImageRef, digest: &Digest) -> Result<Vec<u8>, RemoteError>;

    fn has_blob(&self, image: &ImageRef, digest: &Digest) -> Result<bool, RemoteError>;

    fn push_blob(&self, image: &ImageRef, digest: &Digest, data: &[u8]) -> Result<(), RemoteError>;

    /// Write the config blob and manifest of a sealed image under `image`'s
    /// tag. Layer blobs must already be present. Returns the manifest digest.
    fn push_image(&self, image: &ImageRef, manifest: &Image) -> Result<Digest, RemoteError>;
}

pub(crate) fn verify_blob(key: &str, digest: &Digest, data: &[u8]) -> Result<(), RemoteError> {
    if digest.matches(data) {
        Ok(())
    } else {
        Err(RemoteError::IntegrityFailure {
            key: key.to_owned(),
            expected: digest.to_string(),
            actual: Digest::of(data).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_blob_detects_mismatch() {
        let d = Digest::of(b"a");
        assert!(verify_blob("k", &d, b"a").is_ok());
        let err = verify_blob("k", &d, b"b").unwrap_err();
        assert!(matches!(err, RemoteError::IntegrityFailure { .. }));
        assert!(err.to_string().contains(d.as_str()));
    }

    #[test]
    fn not_found_display() {
        let e = RemoteError::NotFound("app:latest".to_owned());
        assert!(e.to_string().contains("app:latest"));
    }
}
