use crate::{ImageRef, ImageTransport, RemoteError};
use kiln_schema::{CacheMetadata, Digest, Image};
use kiln_store::{CacheError, CacheStore, DigestLocks};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Label on a cache image holding its JSON-encoded [`CacheMetadata`].
pub const CACHE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.cache.metadata";

impl From<RemoteError> for CacheError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(what) => CacheError::NotFound(what),
            RemoteError::Io(io) => CacheError::Io(io),
            other => CacheError::Backend(other.to_string()),
        }
    }
}

#[derive(Default)]
struct Pending {
    layers: Vec<(Digest, u64)>,
    metadata: CacheMetadata,
}

impl Pending {
    fn contains(&self, digest: &Digest) -> bool {
        self.layers.iter().any(|(d, _)| d == digest)
    }

    fn add(&mut self, digest: &Digest, size: u64) {
        if !self.contains(digest) {
            self.layers.push((digest.clone(), size));
        }
    }
}

/// A cache kept as an image: every cached layer is an image layer and the
/// metadata sits in [`CACHE_METADATA_LABEL`].
///
/// Blobs are uploaded as they are put; the cache image itself only moves on
/// [`commit`](CacheStore::commit), so an interrupted run leaves the previous
/// cache image untouched.
pub struct ImageCache {
    transport: Arc<dyn ImageTransport>,
    image: ImageRef,
    committed: Mutex<Option<Image>>,
    pending: Mutex<Pending>,
    locks: DigestLocks,
}

impl ImageCache {
    /// Open the cache image at `image`. A missing image is an empty cache.
    pub fn open(transport: Arc<dyn ImageTransport>, image: ImageRef) -> Result<Self, CacheError> {
        let committed = transport.fetch_image(&image)?;
        debug!(
            "cache image {image} via {}: {}",
            transport.name(),
            committed
                .as_ref()
                .map_or_else(|| "absent".to_owned(), |i| format!("{} layers", i.layers().len()))
        );
        Ok(Self {
            transport,
            image,
            committed: Mutex::new(committed),
            pending: Mutex::new(Pending::default()),
            locks: DigestLocks::new(),
        })
    }

    pub fn reference(&self) -> &ImageRef {
        &self.image
    }

    fn committed_size(&self, digest: &Digest) -> Option<u64> {
        let committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        committed
            .as_ref()?
            .layers()
            .iter()
            .find(|l| &l.digest == digest)
            .map(|l| l.size)
    }
}

impl CacheStore for ImageCache {
    fn name(&self) -> String {
        format!("image:{}", self.image)
    }

    fn put_layer(&self, digest: &Digest, data: &[u8]) -> Result<(), CacheError> {
        if !digest.is_valid() {
            return Err(CacheError::InvalidDigest(digest.to_string()));
        }
        if !digest.matches(data) {
            return Err(CacheError::IntegrityFailure {
                digest: digest.to_string(),
                actual: Digest::of(data).to_string(),
            });
        }
        self.locks.with(digest, || {
            if !self.transport.has_blob(&self.image, digest)? {
                self.transport.push_blob(&self.image, digest, data)?;
            }
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .add(digest, data.len() as u64);
            Ok(())
        })
    }

    fn get_layer(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        if !self.has_layer(digest)? {
            return Err(CacheError::NotFound(digest.to_string()));
        }
        Ok(self.transport.fetch_blob(&self.image, digest)?)
    }

    fn has_layer(&self, digest: &Digest) -> Result<bool, CacheError> {
        let staged = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(digest);
        Ok(staged || self.committed_size(digest).is_some())
    }

    fn reuse_layer(&self, digest: &Digest) -> Result<(), CacheError> {
        let size = self
            .committed_size(digest)
            .ok_or_else(|| CacheError::NotFound(digest.to_string()))?;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(digest, size);
        Ok(())
    }

    fn set_metadata(&self, metadata: &CacheMetadata) -> Result<(), CacheError> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metadata = metadata.clone();
        Ok(())
    }

    fn retrieve_metadata(&self) -> Result<CacheMetadata, CacheError> {
        let committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        match committed.as_ref().and_then(|i| i.label(CACHE_METADATA_LABEL)) {
            Some(label) => Ok(serde_json::from_str(label)?),
            None => Ok(CacheMetadata::default()),
        }
    }

    fn commit(&self) -> Result<(), CacheError> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));

        let mut image = Image::empty(std::env::consts::OS, std::env::consts::ARCH);
        for (digest, size) in &pending.layers {
            image.push_layer(digest.clone(), *size);
        }
        image.set_label(CACHE_METADATA_LABEL, serde_json::to_string(&pending.metadata)?);
        image.seal()?;
        let digest = self.transport.push_image(&self.image, &image)?;
        info!(
            "committed cache image {} ({} layers, {})",
            self.image,
            pending.layers.len(),
            digest.short()
        );

        *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = Some(image);
        Ok(())
    }
}
