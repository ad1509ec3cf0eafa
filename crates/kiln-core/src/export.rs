//! Image assembly and publication.
//!
//! The exported image is the run image plus, in order: the launch layers of
//! every buildpack that built (group order, then layer name order), the
//! application layer, and the config layer holding the build metadata.
//! Layers whose digest the previous image already carries are referenced by
//! digest and never uploaded again. Nothing in the image depends on the time
//! of the build, so an unchanged build yields the same manifest digest.

use crate::concurrency::check_interrupted;
use crate::CoreError;
use kiln_buildpack::{layer_env_ops, Env, EnvScope};
use kiln_remote::{copy_missing_blobs, push_image_with_layers, ImageRef, ImageTransport};
use kiln_schema::{
    AnalyzedRecord, BuildMetadata, BuildReport, BuildpackLayersMetadata, CacheMetadata, Digest,
    ExportReport, Image, ImageReport, LayerMetadata, LifecycleMetadata, RunImageMetadata,
    BUILD_METADATA_LABEL, LIFECYCLE_METADATA_LABEL,
};
use kiln_store::{CacheStore, LayersDir, PackedLayer, IMAGE_APP_PREFIX, IMAGE_LAYERS_PREFIX};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Every reference the image is written to. The first is the primary one.
    pub images: Vec<ImageRef>,
    pub run_image: ImageRef,
}

pub struct Exporter<'a> {
    transport: &'a dyn ImageTransport,
    layers: &'a LayersDir,
    app_dir: PathBuf,
    cache: Option<&'a dyn CacheStore>,
}

/// Layers of the image being assembled and where their blobs come from.
struct Assembly<'p> {
    image: Image,
    previous: Option<&'p Image>,
    seen: HashSet<Digest>,
    uploads: Vec<(Digest, Vec<u8>)>,
    reused: Vec<Digest>,
}

impl Assembly<'_> {
    /// Append a packed layer, reusing the previous image's blob when it
    /// carries the same digest.
    fn add(&mut self, packed: &PackedLayer) {
        if !self.seen.insert(packed.digest.clone()) {
            debug!("layer {} already in image, skipped", packed.digest.short());
            return;
        }
        let previous = self
            .previous
            .and_then(|p| p.layers().iter().find(|l| l.digest == packed.digest));
        if let Some(desc) = previous {
            debug!("reusing layer {}", packed.digest.short());
            self.reused.push(desc.digest.clone());
        } else {
            self.uploads.push((packed.digest.clone(), packed.data.clone()));
        }
        self.image.push_layer(packed.digest.clone(), packed.size());
    }

    /// Append a layer of the previous image by digest alone, copying its
    /// descriptor and diff id.
    fn reuse(&mut self, digest: &Digest) -> bool {
        let Some((desc, diff_id)) = self.previous.and_then(|p| {
            p.layers()
                .iter()
                .zip(p.diff_ids())
                .find(|(l, _)| &l.digest == digest)
        }) else {
            return false;
        };
        if self.seen.insert(digest.clone()) {
            self.reused.push(digest.clone());
            self.image.push_descriptor(desc.clone(), diff_id.clone());
        }
        true
    }
}

impl<'a> Exporter<'a> {
    pub fn new(transport: &'a dyn ImageTransport, layers: &'a LayersDir, app_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            layers,
            app_dir: app_dir.into(),
            cache: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Option<&'a dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    /// Assemble the image, write it to every reference in `opts`, then save
    /// cache layers. A cache failure is reported in the result, not raised.
    pub fn export(
        &self,
        opts: &ExportOptions,
        analyzed: &AnalyzedRecord,
        build: &BuildMetadata,
    ) -> Result<ExportReport, CoreError> {
        self.export_inner(opts, analyzed, build)
            .map_err(|e| e.within(CoreError::ExportFailed))
    }

    fn export_inner(
        &self,
        opts: &ExportOptions,
        analyzed: &AnalyzedRecord,
        build: &BuildMetadata,
    ) -> Result<ExportReport, CoreError> {
        if opts.images.is_empty() {
            return Err(CoreError::InvalidInput("no image reference to export to".to_owned()));
        }

        let run = self
            .transport
            .fetch_image(&opts.run_image)?
            .ok_or_else(|| CoreError::ExportFailed(format!("run image {} not found", opts.run_image)))?;
        let previous = match &analyzed.image {
            Some(id) => {
                let reference = ImageRef::parse(&id.reference)?.with_digest(id.digest.clone());
                let image = self.transport.fetch_image(&reference)?;
                if image.is_none() {
                    warn!("previous image {} is gone, no layers will be reused", id.reference);
                }
                image.map(|image| (reference, image))
            }
            None => None,
        };

        let mut assembly = Assembly {
            image: run.clone(),
            previous: previous.as_ref().map(|(_, image)| image),
            seen: run.layer_digests().into_iter().collect(),
            uploads: Vec::new(),
            reused: Vec::new(),
        };
        let mut env = Env::from_vars(
            run.config
                .config
                .env
                .iter()
                .filter_map(|kv| kv.split_once('=')),
        );
        let mut metadata = LifecycleMetadata {
            base_layer_count: Some(run.layers().len()),
            run_image: RunImageMetadata {
                top_layer: run.top_layer().cloned(),
                reference: opts.run_image.with_digest(run.digest()?).to_string(),
            },
            ..LifecycleMetadata::default()
        };
        let mut cache_metadata = CacheMetadata::default();
        let mut cache_blobs = Vec::new();

        for bp in &build.buildpacks {
            let mut launch = BuildpackLayersMetadata {
                id: bp.id.clone(),
                version: bp.version.clone(),
                layers: BTreeMap::new(),
            };
            let mut cached = BuildpackLayersMetadata {
                layers: BTreeMap::new(),
                ..launch.clone()
            };

            for name in self.layers.layer_names(&bp.id)? {
                check_interrupted()?;
                let layer = self.layers.layer(&bp.id, &name);
                let Some(descriptor) = layer.read_descriptor()? else {
                    continue;
                };
                let facets = descriptor.facets;
                let packed = if layer.has_content() && (facets.launch || facets.cache) {
                    Some(PackedLayer::pack(&layer.dir, &layer.prefix)?)
                } else {
                    None
                };

                if facets.launch {
                    let digest = match &packed {
                        Some(packed) => {
                            assembly.add(packed);
                            let mount = Path::new("/").join(&layer.prefix);
                            env.apply_all(&layer_env_ops(&layer.dir, &mount, EnvScope::Launch)?);
                            packed.digest.clone()
                        }
                        None => {
                            let digest = analyzed
                                .metadata
                                .layer(&bp.id, &name)
                                .and_then(|m| m.digest.clone())
                                .filter(|d| assembly.reuse(d))
                                .ok_or_else(|| {
                                    CoreError::ExportFailed(format!(
                                        "layer {}:{name} has no content and the previous image has no layer to reuse",
                                        bp.id
                                    ))
                                })?;
                            debug!("reusing layer {}:{name} by metadata", bp.id);
                            digest
                        }
                    };
                    launch.layers.insert(
                        name.clone(),
                        LayerMetadata {
                            digest: Some(digest),
                            facets,
                            data: descriptor.metadata.clone(),
                        },
                    );
                }

                if let (true, Some(packed)) = (facets.cache, packed) {
                    cached.layers.insert(
                        name,
                        LayerMetadata {
                            digest: Some(packed.digest.clone()),
                            facets,
                            data: descriptor.metadata,
                        },
                    );
                    cache_blobs.push(packed);
                }
            }

            metadata.buildpacks.push(launch);
            if !cached.layers.is_empty() {
                cache_metadata.buildpacks.push(cached);
            }
        }

        let app = PackedLayer::pack(&self.app_dir, IMAGE_APP_PREFIX)?;
        assembly.add(&app);
        metadata.app = Some(app.digest.clone());

        let config_dir = self.layers.config_dir();
        fs::create_dir_all(&config_dir)?;
        let config = PackedLayer::pack(&config_dir, &format!("{IMAGE_LAYERS_PREFIX}/config"))?;
        assembly.add(&config);
        metadata.config = Some(config.digest.clone());

        let mut image = assembly.image;
        for (name, value) in env.iter() {
            image.set_env(name, value);
        }
        let (entrypoint, cmd) = build.entrypoint();
        image.config.config.entrypoint = entrypoint;
        image.config.config.cmd = cmd;
        image.config.config.working_dir = format!("/{IMAGE_APP_PREFIX}");
        image.set_label(LIFECYCLE_METADATA_LABEL, metadata.to_label()?);
        image.set_label(BUILD_METADATA_LABEL, serde_json::to_string(build)?);
        image.seal()?;
        let manifest_size = image.manifest_bytes()?.len() as u64;

        let run_layers = run.layer_digests();
        let mut digest = image.digest()?;
        for target in &opts.images {
            check_interrupted()?;
            copy_missing_blobs(self.transport, &opts.run_image, target, &run_layers)?;
            if let Some((reference, _)) = &previous {
                copy_missing_blobs(self.transport, reference, target, &assembly.reused)?;
            }
            let (pushed, transfer) = push_image_with_layers(self.transport, target, &image, &assembly.uploads)?;
            info!(
                "exported {target} ({}, {} layers uploaded, {} reused)",
                pushed.short(),
                transfer.copied,
                assembly.reused.len() + transfer.skipped
            );
            digest = pushed;
        }

        let cache_error = self.cache.and_then(|cache| {
            save_cache(cache, &cache_metadata, &cache_blobs)
                .err()
                .map(|e| {
                    warn!("failed to save cache {}: {e}", cache.name());
                    e.to_string()
                })
        });

        Ok(ExportReport {
            image: ImageReport {
                tags: opts.images.iter().map(ToString::to_string).collect(),
                digest,
                manifest_size,
            },
            build: BuildReport {
                bom: build.bom.clone(),
            },
            cache_error,
        })
    }
}

/// Keep unchanged layers, store new ones, and commit the cache.
fn save_cache(cache: &dyn CacheStore, metadata: &CacheMetadata, blobs: &[PackedLayer]) -> Result<(), CoreError> {
    for packed in blobs {
        match cache.reuse_layer(&packed.digest) {
            Ok(()) => debug!("cache keeps {}", packed.digest.short()),
            Err(e) if e.is_not_found() => cache.put_layer(&packed.digest, &packed.data)?,
            Err(e) => return Err(e.into()),
        }
    }
    cache.set_metadata(metadata)?;
    cache.commit()?;
    info!("saved {} layers to cache {}", blobs.len(), cache.name());
    Ok(())
}
