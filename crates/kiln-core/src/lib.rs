//! Phase engine for kiln.
//!
//! This crate ties together records, the layer cache, image transports and
//! buildpacks into the lifecycle phases: the `Detector` resolves a group and
//! build plan, `analyze`/`restore` recover state from the previous image and
//! the cache, the `Builder` runs buildpacks, `Exporter` assembles and pushes
//! the image, and `rebase` swaps the base layers of an exported image.
//! `Engine` wires the phases over a working layers directory guarded by an
//! exclusive lock, for both single-phase and combined `create` runs.

pub mod analyze;
pub mod build;
pub mod cache;
pub mod concurrency;
pub mod detect;
pub mod engine;
pub mod export;
pub mod lifecycle;
pub mod rebase;
pub mod restore;

pub use analyze::analyze;
pub use build::Builder;
pub use cache::CacheConfig;
pub use concurrency::{install_signal_handler, shutdown_requested, WorkspaceLock};
pub use detect::{DetectFailure, DetectResult, Detector, GroupRejection};
pub use engine::{CreateOptions, Engine};
pub use export::{ExportOptions, Exporter};
pub use lifecycle::{Phase, Record};
pub use rebase::{rebase, RebaseOptions};
pub use restore::{restore, RestoreReport};

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The fixed set of categories a phase failure is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    InvalidInput,
    ApiIncompatible,
    DetectFailed,
    BuildFailed,
    ExportFailed,
    RebaseFailed,
    CacheError,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCategory::InvalidInput => "invalid input",
            FailureCategory::ApiIncompatible => "incompatible API",
            FailureCategory::DetectFailed => "detection failed",
            FailureCategory::BuildFailed => "build failed",
            FailureCategory::ExportFailed => "export failed",
            FailureCategory::RebaseFailed => "rebase failed",
            FailureCategory::CacheError => "cache error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("record error: {0}")]
    Schema(#[from] kiln_schema::SchemaError),
    #[error(transparent)]
    Api(#[from] kiln_schema::ApiError),
    #[error("{0}")]
    DetectFailed(DetectFailure),
    #[error("buildpack {buildpack} failed: {source}")]
    BuildFailed {
        buildpack: String,
        #[source]
        source: kiln_buildpack::BuildpackError,
    },
    #[error("buildpack error: {0}")]
    Buildpack(#[from] kiln_buildpack::BuildpackError),
    #[error("export failed: {0}")]
    ExportFailed(String),
    #[error("rebase failed: {0}")]
    RebaseFailed(String),
    #[error("cache error: {0}")]
    Cache(#[from] kiln_store::CacheError),
    #[error("image transport error: {0}")]
    Remote(#[from] kiln_remote::RemoteError),
    #[error("layers directory {} is in use by another run ({holder})", dir.display())]
    Locked { dir: PathBuf, holder: String },
    #[error("interrupted")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Category reported to the caller. `None` is a generic failure.
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            CoreError::InvalidInput(_) | CoreError::Schema(_) | CoreError::Locked { .. } => {
                Some(FailureCategory::InvalidInput)
            }
            CoreError::Api(_) => Some(FailureCategory::ApiIncompatible),
            CoreError::DetectFailed(_) => Some(FailureCategory::DetectFailed),
            CoreError::BuildFailed { .. } => Some(FailureCategory::BuildFailed),
            CoreError::Buildpack(e) => match e {
                kiln_buildpack::BuildpackError::Api(_) => Some(FailureCategory::ApiIncompatible),
                kiln_buildpack::BuildpackError::NotFound { .. } => Some(FailureCategory::InvalidInput),
                _ => Some(FailureCategory::BuildFailed),
            },
            CoreError::ExportFailed(_) => Some(FailureCategory::ExportFailed),
            CoreError::RebaseFailed(_) => Some(FailureCategory::RebaseFailed),
            CoreError::Cache(_) => Some(FailureCategory::CacheError),
            CoreError::Remote(_)
            | CoreError::Interrupted
            | CoreError::Io(_)
            | CoreError::Serialization(_) => None,
        }
    }

    /// Fold a failure inside a phase into that phase's category, keeping
    /// categories that are already more precise.
    pub(crate) fn within(self, wrap: fn(String) -> CoreError) -> CoreError {
        match self {
            CoreError::InvalidInput(_)
            | CoreError::Api(_)
            | CoreError::Locked { .. }
            | CoreError::Interrupted
            | CoreError::ExportFailed(_)
            | CoreError::RebaseFailed(_) => self,
            CoreError::Buildpack(kiln_buildpack::BuildpackError::Api(e)) => CoreError::Api(e),
            other => wrap(other.to_string()),
        }
    }
}
