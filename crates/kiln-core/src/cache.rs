use crate::CoreError;
use kiln_remote::{ImageCache, ImageRef, ImageTransport};
use kiln_store::{CacheStore, VolumeCache};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Which cache backend a run uses, chosen once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CacheConfig {
    #[default]
    Disabled,
    Volume(PathBuf),
    Image(ImageRef),
}

impl CacheConfig {
    /// A cache image takes precedence over a cache directory; neither
    /// disables caching.
    pub fn select(cache_dir: Option<PathBuf>, cache_image: Option<&str>) -> Result<Self, CoreError> {
        match (cache_image.filter(|s| !s.is_empty()), cache_dir) {
            (Some(image), _) => Ok(CacheConfig::Image(
                ImageRef::parse(image).map_err(|e| CoreError::InvalidInput(e.to_string()))?,
            )),
            (None, Some(dir)) => Ok(CacheConfig::Volume(dir)),
            (None, None) => Ok(CacheConfig::Disabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, CacheConfig::Disabled)
    }

    /// Open the configured backend. Callers never branch on which one it is.
    pub fn open(
        &self,
        transport: &Arc<dyn ImageTransport>,
    ) -> Result<Option<Arc<dyn CacheStore>>, CoreError> {
        let store: Arc<dyn CacheStore> = match self {
            CacheConfig::Disabled => return Ok(None),
            CacheConfig::Volume(dir) => Arc::new(VolumeCache::open(dir.clone())?),
            CacheConfig::Image(image) => {
                Arc::new(ImageCache::open(Arc::clone(transport), image.clone())?)
            }
        };
        debug!("using cache {}", store.name());
        Ok(Some(store))
    }
}
