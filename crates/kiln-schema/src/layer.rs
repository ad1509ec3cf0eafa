//! Layer facets and the metadata that survives between builds.
//!
//! `LifecycleMetadata` is serialized as JSON into the
//! `io.buildpacks.lifecycle.metadata` label of every exported image. The next
//! analyzer reads it back to map image layers to (buildpack, layer name)
//! without re-running detection.

use crate::digest::Digest;
use crate::plan::Metadata;
use crate::types::{BuildpackId, LayerName};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The three independent facets of a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerFacets {
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub cache: bool,
}

impl LayerFacets {
    pub fn launch() -> Self {
        Self {
            launch: true,
            ..Self::default()
        }
    }

    pub fn cache() -> Self {
        Self {
            cache: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            launch: true,
            build: true,
            cache: true,
        }
    }

    pub fn is_none(&self) -> bool {
        !(self.launch || self.build || self.cache)
    }
}

/// Contents of `<layers>/<buildpack>/<layer>.toml`, written by the buildpack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    #[serde(flatten)]
    pub facets: LayerFacets,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// One layer as recorded in the lifecycle label or the cache metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(flatten)]
    pub facets: LayerFacets,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub data: Metadata,
}

impl LayerMetadata {
    pub fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor {
            facets: self.facets,
            metadata: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayersMetadata {
    pub id: BuildpackId,
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<LayerName, LayerMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(rename = "topLayer", default, skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<Digest>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Digest>,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
    #[serde(default)]
    pub run_image: RunImageMetadata,
    /// Number of bottom layers that belong to the run image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_layer_count: Option<usize>,
}

impl LifecycleMetadata {
    pub fn from_label(label: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(label)?)
    }

    pub fn to_label(&self) -> Result<String, SchemaError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn buildpack(&self, id: &str) -> Option<&BuildpackLayersMetadata> {
        find_buildpack(&self.buildpacks, id)
    }

    pub fn layer(&self, buildpack: &str, name: &str) -> Option<&LayerMetadata> {
        self.buildpack(buildpack)
            .and_then(|bp| bp.layers.get(&LayerName::new(name)))
    }

    /// Flatten into a (buildpack id, layer name) keyed map.
    pub fn layer_map(&self) -> BTreeMap<(BuildpackId, LayerName), LayerMetadata> {
        flatten(&self.buildpacks)
    }

    /// Add cache-only layers from `cache`. Entries already recorded here win.
    pub fn merge_cache(&mut self, cache: &CacheMetadata) {
        for cached in &cache.buildpacks {
            let idx = match self.buildpacks.iter().position(|bp| bp.id == cached.id) {
                Some(idx) => idx,
                None => {
                    self.buildpacks.push(BuildpackLayersMetadata {
                        id: cached.id.clone(),
                        version: cached.version.clone(),
                        layers: BTreeMap::new(),
                    });
                    self.buildpacks.len() - 1
                }
            };
            let target = &mut self.buildpacks[idx].layers;
            for (name, layer) in &cached.layers {
                target.entry(name.clone()).or_insert_with(|| layer.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buildpacks.iter().all(|bp| bp.layers.is_empty())
    }
}

/// Metadata stored alongside a cache: every cached layer by owner and name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
}

impl CacheMetadata {
    pub fn buildpack(&self, id: &str) -> Option<&BuildpackLayersMetadata> {
        find_buildpack(&self.buildpacks, id)
    }

    pub fn layer(&self, buildpack: &str, name: &str) -> Option<&LayerMetadata> {
        self.buildpack(buildpack)
            .and_then(|bp| bp.layers.get(&LayerName::new(name)))
    }

    pub fn layer_map(&self) -> BTreeMap<(BuildpackId, LayerName), LayerMetadata> {
        flatten(&self.buildpacks)
    }

    /// Whether any cached layer has `digest`.
    pub fn has_digest(&self, digest: &Digest) -> bool {
        self.buildpacks
            .iter()
            .flat_map(|bp| bp.layers.values())
            .any(|l| l.digest.as_ref() == Some(digest))
    }
}

fn find_buildpack<'a>(
    buildpacks: &'a [BuildpackLayersMetadata],
    id: &str,
) -> Option<&'a BuildpackLayersMetadata> {
    buildpacks.iter().find(|bp| bp.id == id)
}

fn flatten(
    buildpacks: &[BuildpackLayersMetadata],
) -> BTreeMap<(BuildpackId, LayerName), LayerMetadata> {
    buildpacks
        .iter()
        .flat_map(|bp| {
            bp.layers
                .iter()
                .map(|(name, layer)| ((bp.id.clone(), name.clone()), layer.clone()))
        })
        .collect()
}
