use crate::{verify_blob, ImageRef, ImageTransport, RemoteError, TagIndex};
use kiln_schema::{Digest, Image, SchemaError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::debug;

/// Directory-backed image store standing in for the local daemon.
///
/// ```text
/// <root>/blobs/sha256/<hex>   layers, configs, manifests
/// <root>/index.json           repository:tag -> manifest digest
/// ```
///
/// Blobs are shared by every repository in the directory.
pub struct LocalRegistry {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl LocalRegistry {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RemoteError> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs").join("sha256"))?;
        Ok(Self {
            root,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> Result<PathBuf, RemoteError> {
        if !digest.is_valid() {
            return Err(SchemaError::InvalidDigest(digest.to_string()).into());
        }
        Ok(self.root.join("blobs").join("sha256").join(digest.hex()))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<(), RemoteError> {
        let dir = path
            .parent()
            .ok_or_else(|| RemoteError::Config("blob path has no parent".to_owned()))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| RemoteError::Io(e.error))?;
        Ok(())
    }

    fn write_blob(&self, digest: &Digest, data: &[u8]) -> Result<(), RemoteError> {
        let path = self.blob_path(digest)?;
        if path.exists() {
            return Ok(());
        }
        Self::write_atomic(&path, data)
    }

    /// Every `repository:tag` key in the index.
    pub fn tags(&self) -> Result<Vec<String>, RemoteError> {
        Ok(TagIndex::read(&self.index_path())?
            .keys()
            .map(str::to_owned)
            .collect())
    }

    fn resolve(&self, image: &ImageRef) -> Result<Option<Digest>, RemoteError> {
        if let Some(d) = &image.digest {
            return Ok(Some(d.clone()));
        }
        Ok(TagIndex::read(&self.index_path())?
            .get(image)
            .map(|e| e.manifest.clone()))
    }
}

impl ImageTransport for LocalRegistry {
    fn name(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn fetch_image(&self, image: &ImageRef) -> Result<Option<Image>, RemoteError> {
        let Some(manifest_digest) = self.resolve(image)? else {
            return Ok(None);
        };
        let manifest_path = self.blob_path(&manifest_digest)?;
        if !manifest_path.exists() {
            return Ok(None);
        }
        let manifest = fs::read(&manifest_path)?;
        verify_blob(&image.to_string(), &manifest_digest, &manifest)?;
        let parsed: kiln_schema::ImageManifest = serde_json::from_slice(&manifest)
            .map_err(|e| RemoteError::Serialization(format!("invalid manifest: {e}")))?;
        let config = self.fetch_blob(image, &parsed.config.digest)?;
        Ok(Some(Image::from_blobs(&manifest, &config)?))
    }

    fn fetch_blob(&self, image: &ImageRef, digest: &Digest) -> Result<Vec<u8>, RemoteError> {
        let path = self.blob_path(digest)?;
        if !path.exists() {
            return Err(RemoteError::NotFound(format!("{}@{digest}", image.repository)));
        }
        let data = fs::read(&path)?;
        verify_blob(digest.as_str(), digest, &data)?;
        Ok(data)
    }

    fn has_blob(&self, _image: &ImageRef, digest: &Digest) -> Result<bool, RemoteError> {
        Ok(self.blob_path(digest)?.exists())
    }

    fn push_blob(&self, _image: &ImageRef, digest: &Digest, data: &[u8]) -> Result<(), RemoteError> {
        verify_blob(digest.as_str(), digest, data)?;
        debug!("local put blob {} ({} bytes)", digest.short(), data.len());
        self.write_blob(digest, data)
    }

    fn push_image(&self, image: &ImageRef, manifest: &Image) -> Result<Digest, RemoteError> {
        let config = manifest.config_bytes()?;
        if !manifest.manifest.config.digest.matches(&config) {
            return Err(SchemaError::InvalidRecord(format!(
                "image for {image} is not sealed: config digest is stale"
            ))
            .into());
        }
        for layer in manifest.layers() {
            if !self.blob_path(&layer.digest)?.exists() {
                return Err(RemoteError::NotFound(format!(
                    "layer {} of {image}",
                    layer.digest
                )));
            }
        }
        self.write_blob(&manifest.manifest.config.digest, &config)?;
        let manifest_bytes = manifest.manifest_bytes()?;
        let digest = Digest::of(&manifest_bytes);
        self.write_blob(&digest, &manifest_bytes)?;

        if image.digest.is_none() {
            let _guard = self.index_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut index = TagIndex::read(&self.index_path())?;
            if let Some(old) = index.point(image, digest.clone()) {
                debug!("{image} moved off {}", old.short());
            }
            index.write(&self.index_path())?;
        }
        debug!("local push {image} -> {}", digest.short());
        Ok(digest)
    }
}
