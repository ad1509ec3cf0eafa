//! Typed records, content digests, API compatibility checks, and the OCI image model for kiln.
//!
//! This crate defines the schema layer shared by every phase: buildpack references,
//! groups and orders (`Group`, `Order`), the build plan exchanged during detection
//! (`BuildPlan`), layer facets and the lifecycle metadata label that survives between
//! builds (`LifecycleMetadata`), the OCI image manifest/config model (`Image`), and the
//! cross-phase records (`AnalyzedRecord`, `ExportReport`) together with the codec that
//! reads and writes them.

pub mod api;
pub mod buildpack;
pub mod digest;
pub mod image;
pub mod launch;
pub mod layer;
pub mod plan;
pub mod records;
pub mod types;

pub use api::{
    verify_buildpack_api, verify_group_apis, verify_platform_api, ApiError, ApiKind, ApiRange,
    ApiVersion, DEFAULT_BUILDPACK_API, DEFAULT_PLATFORM_API, SUPPORTED_BUILDPACK_APIS,
    SUPPORTED_PLATFORM_APIS,
};
pub use buildpack::{escape_id, BuildpackDescriptor, BuildpackInfo, BuildpackRef, Group, Order};
pub use digest::Digest;
pub use image::{ContainerConfig, Descriptor, Image, ImageConfig, ImageManifest, RootFs};
pub use launch::{BomEntry, BuildMetadata, LaunchToml, Process};
pub use layer::{
    BuildpackLayersMetadata, CacheMetadata, LayerDescriptor, LayerFacets, LayerMetadata,
    LifecycleMetadata, RunImageMetadata,
};
pub use plan::{BuildPlan, BuildPlanEntry, BuildpackPlan, DetectPlan, EntryKind, Metadata, Provide, Require};
pub use records::{
    read_record, write_record, AnalyzedRecord, BuildReport, ExportReport, ImageIdentifier,
    ImageReport, JsonCodec, RebaseReport, RecordCodec, TomlCodec,
};
pub use types::{BuildpackId, LayerName};

/// Label carrying the per-layer lifecycle metadata of an exported image.
pub const LIFECYCLE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";
/// Label carrying processes and bill-of-materials of an exported image.
pub const BUILD_METADATA_LABEL: &str = "io.buildpacks.build.metadata";
/// Label identifying the stack a run image belongs to.
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("record I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse record: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize record: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid digest '{0}', expected sha256:<64 hex characters>")]
    InvalidDigest(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_display_invalid_digest() {
        let e = SchemaError::InvalidDigest("md5:abc".to_owned());
        assert!(e.to_string().contains("md5:abc"));
    }

    #[test]
    fn schema_error_display_invalid_record() {
        let e = SchemaError::InvalidRecord("group is empty".to_owned());
        assert!(e.to_string().contains("group is empty"));
    }

    #[test]
    fn label_keys_are_distinct() {
        assert_ne!(LIFECYCLE_METADATA_LABEL, BUILD_METADATA_LABEL);
        assert_ne!(BUILD_METADATA_LABEL, STACK_ID_LABEL);
    }
}
