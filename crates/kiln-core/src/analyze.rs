use crate::CoreError;
use kiln_remote::{ImageRef, ImageTransport};
use kiln_schema::{AnalyzedRecord, ImageIdentifier, LifecycleMetadata, LIFECYCLE_METADATA_LABEL};
use kiln_store::CacheStore;
use tracing::{debug, info, warn};

/// Recover layer metadata from the previously exported image and the cache.
///
/// An absent image, or one whose lifecycle label is missing or unreadable,
/// yields empty metadata. Cache metadata fills in cache-only layers; where
/// both know a layer, the image label wins. A cache whose metadata cannot be
/// read is skipped with a warning.
pub fn analyze(
    transport: &dyn ImageTransport,
    previous: Option<&ImageRef>,
    cache: Option<&dyn CacheStore>,
) -> Result<AnalyzedRecord, CoreError> {
    let mut record = AnalyzedRecord::default();

    if let Some(reference) = previous {
        match transport.fetch_image(reference)? {
            None => info!("previous image {reference} not found, starting fresh"),
            Some(image) => {
                record.image = Some(ImageIdentifier {
                    reference: reference.to_string(),
                    digest: image.digest()?,
                });
                record.metadata = match image.label(LIFECYCLE_METADATA_LABEL) {
                    None => {
                        warn!("previous image {reference} has no lifecycle metadata label");
                        LifecycleMetadata::default()
                    }
                    Some(label) => LifecycleMetadata::from_label(label).unwrap_or_else(|e| {
                        warn!("ignoring unreadable lifecycle metadata on {reference}: {e}");
                        LifecycleMetadata::default()
                    }),
                };
            }
        }
    }

    if let Some(cache) = cache {
        match cache.retrieve_metadata() {
            Ok(cached) => {
                debug!(
                    "cache {} knows {} layers",
                    cache.name(),
                    cached.layer_map().len()
                );
                record.metadata.merge_cache(&cached);
            }
            Err(e) => warn!("ignoring cache metadata from {}: {e}", cache.name()),
        }
    }

    Ok(record)
}
