use crate::concurrency::check_interrupted;
use crate::CoreError;
use kiln_schema::{Group, LayerMetadata, LifecycleMetadata};
use kiln_store::{unpack_layer_atomic, CacheStore, LayerDir, LayersDir};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What the restorer did, layer by layer (`<buildpack>:<layer>`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Content unpacked from the cache.
    pub restored: Vec<String>,
    /// Cache layers the cache did not have.
    pub missed: Vec<String>,
    /// Cache layers whose retrieval or extraction failed.
    pub failed: Vec<String>,
    /// Launch layers restored as metadata only.
    pub metadata_only: Vec<String>,
}

/// Bring back layers of the buildpacks in `group` from the previous build.
///
/// Cache failures never fail the phase: a layer that cannot be restored is
/// simply left out and its buildpack rebuilds it.
pub fn restore(
    layers: &LayersDir,
    group: &Group,
    analyzed: &LifecycleMetadata,
    cache: Option<&dyn CacheStore>,
) -> Result<RestoreReport, CoreError> {
    layers.create()?;
    let mut report = RestoreReport::default();

    for entry in group {
        let Some(previous) = analyzed.buildpack(&entry.id) else {
            continue;
        };
        for (name, meta) in &previous.layers {
            check_interrupted()?;
            let key = format!("{}:{name}", entry.id);
            let layer = layers.layer(&entry.id, name);

            if meta.facets.cache {
                match restore_cached(&layer, meta, cache) {
                    Ok(true) => report.restored.push(key),
                    Ok(false) => report.missed.push(key),
                    Err(e) => {
                        warn!("could not restore layer {key}: {e}");
                        // A half restored layer must not reach the build.
                        layer.remove()?;
                        report.failed.push(key);
                    }
                }
            } else if meta.facets.launch {
                layer.write_descriptor(&meta.descriptor())?;
                if let Some(digest) = &meta.digest {
                    layer.write_sha(digest)?;
                }
                report.metadata_only.push(key);
            }
        }
    }

    info!(
        "restored {} layers ({} missed, {} failed, {} metadata only)",
        report.restored.len(),
        report.missed.len(),
        report.failed.len(),
        report.metadata_only.len()
    );
    Ok(report)
}

/// `Ok(false)` is a miss.
fn restore_cached(
    layer: &LayerDir,
    meta: &LayerMetadata,
    cache: Option<&dyn CacheStore>,
) -> Result<bool, CoreError> {
    let (Some(cache), Some(digest)) = (cache, &meta.digest) else {
        return Ok(false);
    };
    let data = match cache.get_layer(digest) {
        Ok(data) => data,
        Err(e) if e.is_not_found() => {
            debug!("cache miss for layer {} ({})", layer.name, digest.short());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    unpack_layer_atomic(&data, &layer.dir, &layer.prefix)?;
    layer.write_descriptor(&meta.descriptor())?;
    layer.write_sha(digest)?;
    debug!("restored layer {} ({})", layer.name, digest.short());
    Ok(true)
}
