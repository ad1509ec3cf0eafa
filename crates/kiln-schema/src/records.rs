//! Cross-phase records and the codec used to persist them.
//!
//! Phases exchange state only through these files, so a phase run as a
//! separate process sees exactly what an in-process run would. Records in the
//! layers directory are TOML; a `.json` path selects the JSON codec.

use crate::digest::Digest;
use crate::launch::BomEntry;
use crate::layer::LifecycleMetadata;
use crate::SchemaError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub trait RecordCodec {
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SchemaError>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SchemaError>;
}

pub struct TomlCodec;

impl RecordCodec for TomlCodec {
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SchemaError> {
        Ok(toml::to_string_pretty(value)?.into_bytes())
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SchemaError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SchemaError::InvalidRecord(format!("record is not UTF-8: {e}")))?;
        Ok(toml::from_str(text)?)
    }
}

pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SchemaError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Atomically write `value` to `path` (temp file in the same directory, then rename).
pub fn write_record<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SchemaError> {
    let bytes = if is_json(path) {
        JsonCodec::encode(value)?
    } else {
        TomlCodec::encode(value)?
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SchemaError::Io(e.error))?;
    Ok(())
}

pub fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, SchemaError> {
    let bytes = fs::read(path)?;
    if is_json(path) {
        JsonCodec::decode(&bytes)
    } else {
        TomlCodec::decode(&bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIdentifier {
    pub reference: String,
    pub digest: Digest,
}

/// Output of the analyze phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageIdentifier>,
    #[serde(default)]
    pub metadata: LifecycleMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReport {
    #[serde(default)]
    pub tags: Vec<String>,
    pub digest: Digest,
    pub manifest_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    #[serde(default)]
    pub bom: Vec<BomEntry>,
}

/// Output of the export phase (`report.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub image: ImageReport,
    #[serde(default)]
    pub build: BuildReport,
    /// Set when saving the cache failed; the image itself was exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseReport {
    pub image: ImageReport,
    pub base_layer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildpack::{BuildpackRef, Group};
    use crate::layer::{BuildpackLayersMetadata, LayerFacets, LayerMetadata};
    use crate::types::{BuildpackId, LayerName};
    use std::collections::BTreeMap;

    #[test]
    fn group_record_roundtrip_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.toml");
        let group = Group::new(vec![BuildpackRef::new("example/node", "1.0.0")]);
        write_record(&path, &group).unwrap();
        let back: Group = read_record(&path).unwrap();
        assert_eq!(back, group);
    }

    #[test]
    fn analyzed_record_roundtrip_with_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analyzed.toml");
        let mut layers = BTreeMap::new();
        layers.insert(
            LayerName::new("deps"),
            LayerMetadata {
                digest: Some(Digest::of(b"deps")),
                facets: LayerFacets::all(),
                data: toml::Table::new(),
            },
        );
        let record = AnalyzedRecord {
            image: Some(ImageIdentifier {
                reference: "app:latest".to_owned(),
                digest: Digest::of(b"manifest"),
            }),
            metadata: LifecycleMetadata {
                buildpacks: vec![BuildpackLayersMetadata {
                    id: BuildpackId::new("example/node"),
                    version: "1.0.0".to_owned(),
                    layers,
                }],
                base_layer_count: Some(3),
                ..LifecycleMetadata::default()
            },
        };
        write_record(&path, &record).unwrap();
        let back: AnalyzedRecord = read_record(&path).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn json_extension_selects_json_codec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = RebaseReport {
            image: ImageReport {
                tags: vec!["app:latest".to_owned()],
                digest: Digest::of(b"m"),
                manifest_size: 10,
            },
            base_layer_count: 3,
        };
        write_record(&path, &report).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.trim_start().starts_with('{'));
        let back: RebaseReport = read_record(&path).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.toml");
        write_record(&path, &Group::new(vec![BuildpackRef::new("a", "1")])).unwrap();
        write_record(&path, &Group::new(vec![BuildpackRef::new("b", "1")])).unwrap();
        let back: Group = read_record(&path).unwrap();
        assert_eq!(back.group[0].id, "b");
    }

    #[test]
    fn read_missing_record_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_record::<Group>(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, SchemaError::Io(_)));
    }

    #[test]
    fn malformed_record_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.toml");
        fs::write(&path, "[[group]\nbroken").unwrap();
        assert!(matches!(
            read_record::<Group>(&path).unwrap_err(),
            SchemaError::ParseToml(_)
        ));
    }
}
