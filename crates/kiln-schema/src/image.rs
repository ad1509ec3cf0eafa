//! OCI image manifest and config model.
//!
//! Layers are uncompressed tars, so each layer descriptor digest equals its
//! diff id. Serialization is plain `serde_json` over structs with a fixed
//! field order and `BTreeMap` labels, which keeps the manifest digest stable
//! for identical inputs.

use crate::digest::Digest;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

impl Descriptor {
    pub fn layer(digest: Digest, size: u64) -> Self {
        Self {
            media_type: LAYER_MEDIA_TYPE.to_owned(),
            digest,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default = "manifest_media_type")]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

fn manifest_media_type() -> String {
    MANIFEST_MEDIA_TYPE.to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Fields kiln does not interpret (`User`, `ExposedPorts`, ...), carried
    /// through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            kind: "layers".to_owned(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An image held in memory: manifest plus decoded config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

impl Image {
    /// An image with no layers. Call [`Image::seal`] before reading the manifest.
    pub fn empty(os: &str, architecture: &str) -> Self {
        Self {
            manifest: ImageManifest {
                schema_version: 2,
                media_type: MANIFEST_MEDIA_TYPE.to_owned(),
                config: Descriptor {
                    media_type: CONFIG_MEDIA_TYPE.to_owned(),
                    digest: Digest::of(b""),
                    size: 0,
                },
                layers: Vec::new(),
            },
            config: ImageConfig {
                architecture: architecture.to_owned(),
                os: os.to_owned(),
                config: ContainerConfig::default(),
                rootfs: RootFs::default(),
                extra: serde_json::Map::new(),
            },
        }
    }

    /// Decode an image from its manifest and config blobs.
    pub fn from_blobs(manifest: &[u8], config: &[u8]) -> Result<Self, SchemaError> {
        let manifest: ImageManifest = serde_json::from_slice(manifest)?;
        if !manifest.config.digest.matches(config) {
            return Err(SchemaError::InvalidRecord(format!(
                "config blob does not match digest {}",
                manifest.config.digest
            )));
        }
        let config: ImageConfig = serde_json::from_slice(config)?;
        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(SchemaError::InvalidRecord(format!(
                "manifest lists {} layers but config lists {} diff ids",
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }
        Ok(Self { manifest, config })
    }

    pub fn push_layer(&mut self, digest: Digest, size: u64) {
        self.config.rootfs.diff_ids.push(digest.clone());
        self.manifest.layers.push(Descriptor::layer(digest, size));
    }

    /// Append a layer exactly as another image describes it. The descriptor
    /// may be compressed, so its digest and the diff id can differ.
    pub fn push_descriptor(&mut self, layer: Descriptor, diff_id: Digest) {
        self.config.rootfs.diff_ids.push(diff_id);
        self.manifest.layers.push(layer);
    }

    pub fn diff_ids(&self) -> &[Digest] {
        &self.config.rootfs.diff_ids
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.manifest.layers
    }

    pub fn layer_digests(&self) -> Vec<Digest> {
        self.manifest.layers.iter().map(|l| l.digest.clone()).collect()
    }

    pub fn has_layer(&self, digest: &Digest) -> bool {
        self.manifest.layers.iter().any(|l| &l.digest == digest)
    }

    pub fn top_layer(&self) -> Option<&Digest> {
        self.manifest.layers.last().map(|l| &l.digest)
    }

    /// Drop every layer from index `keep` upward.
    pub fn truncate_layers(&mut self, keep: usize) {
        self.manifest.layers.truncate(keep);
        self.config.rootfs.diff_ids.truncate(keep);
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.config.config.labels
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.config.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.config.labels.insert(key.into(), value.into());
    }

    /// Value of environment variable `name` in the image config.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.config.config.env.iter().find_map(|kv| {
            kv.split_once('=')
                .filter(|(k, _)| *k == name)
                .map(|(_, v)| v)
        })
    }

    /// Set `name=value`, replacing an existing entry in place.
    pub fn set_env(&mut self, name: &str, value: &str) {
        let entry = format!("{name}={value}");
        let env = &mut self.config.config.env;
        match env
            .iter_mut()
            .find(|kv| kv.split_once('=').is_some_and(|(k, _)| k == name))
        {
            Some(existing) => *existing = entry,
            None => env.push(entry),
        }
    }

    pub fn config_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec(&self.config)?)
    }

    /// Recompute the config descriptor from the current config and return the
    /// config blob that the descriptor now points at.
    pub fn seal(&mut self) -> Result<Vec<u8>, SchemaError> {
        let bytes = self.config_bytes()?;
        self.manifest.config = Descriptor {
            media_type: CONFIG_MEDIA_TYPE.to_owned(),
            digest: Digest::of(&bytes),
            size: bytes.len() as u64,
        };
        Ok(bytes)
    }

    pub fn manifest_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec(&self.manifest)?)
    }

    pub fn digest(&self) -> Result<Digest, SchemaError> {
        Ok(Digest::of(&self.manifest_bytes()?))
    }
}
