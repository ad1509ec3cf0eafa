use crate::CoreError;
use kiln_remote::{copy_missing_blobs, ImageRef, ImageTransport};
use kiln_schema::{
    Image, ImageReport, LifecycleMetadata, RebaseReport, RunImageMetadata, LIFECYCLE_METADATA_LABEL,
    STACK_ID_LABEL,
};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseOptions {
    /// The previously exported image.
    pub image: ImageRef,
    pub new_base: ImageRef,
    /// Where to write the result. Empty means back to `image`.
    pub outputs: Vec<ImageRef>,
}

/// Replace the base layers of an exported image with those of `new_base`.
///
/// The number of base layers is taken from the lifecycle label and never
/// guessed. Layers above the base are kept byte for byte, as is every config
/// field that does not come from the base.
pub fn rebase(transport: &dyn ImageTransport, opts: &RebaseOptions) -> Result<RebaseReport, CoreError> {
    rebase_inner(transport, opts).map_err(|e| e.within(CoreError::RebaseFailed))
}

fn rebase_inner(transport: &dyn ImageTransport, opts: &RebaseOptions) -> Result<RebaseReport, CoreError> {
    let old = transport
        .fetch_image(&opts.image)?
        .ok_or_else(|| CoreError::RebaseFailed(format!("image {} not found", opts.image)))?;
    let label = old.label(LIFECYCLE_METADATA_LABEL).ok_or_else(|| {
        CoreError::RebaseFailed(format!("image {} has no lifecycle metadata label", opts.image))
    })?;
    let mut metadata = LifecycleMetadata::from_label(label)
        .map_err(|e| CoreError::RebaseFailed(format!("unreadable lifecycle metadata on {}: {e}", opts.image)))?;
    let old_base = metadata.base_layer_count.ok_or_else(|| {
        CoreError::RebaseFailed(format!("image {} does not record its base layer count", opts.image))
    })?;
    if old_base > old.layers().len() {
        return Err(CoreError::RebaseFailed(format!(
            "image {} records {old_base} base layers but has only {}",
            opts.image,
            old.layers().len()
        )));
    }

    let base = transport
        .fetch_image(&opts.new_base)?
        .ok_or_else(|| CoreError::RebaseFailed(format!("new base image {} not found", opts.new_base)))?;
    if let (Some(old_stack), Some(new_stack)) = (old.label(STACK_ID_LABEL), base.label(STACK_ID_LABEL)) {
        if old_stack != new_stack {
            return Err(CoreError::RebaseFailed(format!(
                "new base image {} is for stack {new_stack}, image {} was built for {old_stack}",
                opts.new_base, opts.image
            )));
        }
    }

    let kept = &old.layers()[old_base..];
    let mut image = assemble(&old, &base, old_base);

    let base_layer_count = base.layers().len();
    metadata.base_layer_count = Some(base_layer_count);
    metadata.run_image = RunImageMetadata {
        top_layer: base.top_layer().cloned(),
        reference: opts.new_base.with_digest(base.digest()?).to_string(),
    };
    image.set_label(LIFECYCLE_METADATA_LABEL, metadata.to_label()?);
    if let Some(stack) = base.label(STACK_ID_LABEL) {
        image.set_label(STACK_ID_LABEL, stack);
    }
    image.seal()?;

    let outputs = if opts.outputs.is_empty() {
        vec![ImageRef {
            digest: None,
            ..opts.image.clone()
        }]
    } else {
        opts.outputs.clone()
    };
    let kept_digests: Vec<_> = kept.iter().map(|l| l.digest.clone()).collect();
    let mut digest = image.digest()?;
    for target in &outputs {
        copy_missing_blobs(transport, &opts.new_base, target, &base.layer_digests())?;
        copy_missing_blobs(transport, &opts.image, target, &kept_digests)?;
        digest = transport.push_image(target, &image)?;
        info!("rebased {} onto {} as {target}", opts.image, opts.new_base);
    }

    Ok(RebaseReport {
        image: ImageReport {
            tags: outputs.iter().map(ToString::to_string).collect(),
            digest,
            manifest_size: image.manifest_bytes()?.len() as u64,
        },
        base_layer_count,
    })
}

/// The old image with its bottom `old_base` layers swapped for every layer of
/// `base`. Descriptors and diff ids are copied as they are, so compressed
/// layers keep their media type and uncompressed digest.
fn assemble(old: &Image, base: &Image, old_base: usize) -> Image {
    let mut image = old.clone();
    image.manifest.layers.clear();
    image.config.rootfs = base.config.rootfs.clone();
    image.config.rootfs.diff_ids.clear();
    image.config.os.clone_from(&base.config.os);
    image.config.architecture.clone_from(&base.config.architecture);
    // history entries describe the old layer stack
    image.config.extra.remove("history");

    for (layer, diff_id) in base.layers().iter().zip(base.diff_ids()) {
        image.push_descriptor(layer.clone(), diff_id.clone());
    }
    for (layer, diff_id) in old.layers().iter().zip(old.diff_ids()).skip(old_base) {
        image.push_descriptor(layer.clone(), diff_id.clone());
    }
    image
}
