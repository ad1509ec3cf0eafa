pub mod analyze;
pub mod build;
pub mod create;
pub mod detect;
pub mod export;
pub mod rebase;
pub mod restore;

use kiln_buildpack::BuildpackError;
use kiln_core::{CoreError, FailureCategory};
use kiln_remote::{HttpRegistry, ImageRef, ImageTransport, LocalRegistry, RemoteConfig, RemoteError};
use kiln_schema::{ApiKind, Digest, Image};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INVALID_INPUT: u8 = 3;
pub const EXIT_PLATFORM_API: u8 = 11;
pub const EXIT_BUILDPACK_API: u8 = 12;
pub const EXIT_CACHE_ERROR: u8 = 40;
pub const EXIT_BUILD_FAILED: u8 = 51;
pub const EXIT_EXPORT_FAILED: u8 = 62;
pub const EXIT_REBASE_FAILED: u8 = 70;
pub const EXIT_DETECT_FAILED: u8 = 100;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CoreError> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn exit_code(err: &CoreError) -> u8 {
    match err.category() {
        Some(FailureCategory::InvalidInput) => EXIT_INVALID_INPUT,
        Some(FailureCategory::ApiIncompatible) => match api_kind(err) {
            Some(ApiKind::Platform) => EXIT_PLATFORM_API,
            _ => EXIT_BUILDPACK_API,
        },
        Some(FailureCategory::DetectFailed) => EXIT_DETECT_FAILED,
        Some(FailureCategory::BuildFailed) => EXIT_BUILD_FAILED,
        Some(FailureCategory::ExportFailed) => EXIT_EXPORT_FAILED,
        Some(FailureCategory::RebaseFailed) => EXIT_REBASE_FAILED,
        Some(FailureCategory::CacheError) => EXIT_CACHE_ERROR,
        None => EXIT_FAILURE,
    }
}

fn api_kind(err: &CoreError) -> Option<ApiKind> {
    match err {
        CoreError::Api(e) | CoreError::Buildpack(BuildpackError::Api(e)) => Some(e.kind()),
        _ => None,
    }
}

pub fn parse_ref(reference: &str) -> Result<ImageRef, CoreError> {
    ImageRef::parse(reference).map_err(|e| CoreError::InvalidInput(e.to_string()))
}

pub fn parse_refs(references: &[String]) -> Result<Vec<ImageRef>, CoreError> {
    references.iter().map(|r| parse_ref(r)).collect()
}

/// Pick the image transport: an explicit registry URL, then a local image
/// directory, then the registry config file. Without any of them, phases
/// that never touch images still run.
pub fn make_transport(
    registry: Option<&str>,
    daemon_dir: Option<&Path>,
) -> Result<Arc<dyn ImageTransport>, CoreError> {
    if let Some(url) = registry {
        let config = RemoteConfig::new(url).with_env_token();
        return Ok(Arc::new(HttpRegistry::new(config)));
    }
    if let Some(dir) = daemon_dir {
        return Ok(Arc::new(LocalRegistry::open(dir)?));
    }
    match RemoteConfig::discover()? {
        Some(config) => {
            debug!("using registry {} from config file", config.host());
            Ok(Arc::new(HttpRegistry::new(config)))
        }
        None => Ok(Arc::new(Unconfigured)),
    }
}

/// Transport used when neither a registry nor an image directory is set.
/// Every call fails with a configuration error.
struct Unconfigured;

impl Unconfigured {
    fn error() -> RemoteError {
        RemoteError::Config("no image transport configured: pass --registry or --daemon-dir".to_owned())
    }
}

impl ImageTransport for Unconfigured {
    fn name(&self) -> String {
        "unconfigured".to_owned()
    }

    fn fetch_image(&self, _image: &ImageRef) -> Result<Option<Image>, RemoteError> {
        Err(Self::error())
    }

    fn fetch_blob(&self, _image: &ImageRef, _digest: &Digest) -> Result<Vec<u8>, RemoteError> {
        Err(Self::error())
    }

    fn has_blob(&self, _image: &ImageRef, _digest: &Digest) -> Result<bool, RemoteError> {
        Err(Self::error())
    }

    fn push_blob(&self, _image: &ImageRef, _digest: &Digest, _data: &[u8]) -> Result<(), RemoteError> {
        Err(Self::error())
    }

    fn push_image(&self, _image: &ImageRef, _manifest: &Image) -> Result<Digest, RemoteError> {
        Err(Self::error())
    }
}
