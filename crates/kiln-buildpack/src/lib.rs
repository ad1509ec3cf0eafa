//! Buildpack capability and environment operations for kiln.
//!
//! The detector and builder drive buildpacks only through the `Buildpack`
//! trait. `ProcessBuildpack` runs the `bin/detect` and `bin/build`
//! executables of an on-disk buildpack; `MockBuildpack` is an in-process
//! double. `BuildpackSource` resolves group entries to buildpacks, and the
//! `env` module models the environment each buildpack sees.

pub mod env;
pub mod mock;
pub mod process;
pub mod source;

pub use env::{layer_env_ops, read_env_dir, Env, EnvAction, EnvOp, EnvScope};
pub use mock::{MockBuildpack, MockLayer};
pub use process::ProcessBuildpack;
pub use source::{BuildpackSource, DirectorySource, MapSource};

use kiln_schema::{BuildpackDescriptor, BuildpackPlan, DetectPlan, LaunchToml};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The two steps a buildpack executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Detect,
    Build,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Detect => f.write_str("detect"),
            Step::Build => f.write_str("build"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildpackError {
    #[error("buildpack I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record error: {0}")]
    Schema(#[from] kiln_schema::SchemaError),
    #[error(transparent)]
    Api(#[from] kiln_schema::ApiError),
    #[error("buildpack {id}@{version} not found")]
    NotFound { id: String, version: String },
    #[error("buildpack {buildpack} {phase} exited with {}: {output}", .code.map_or_else(|| "signal".to_owned(), |c| format!("status {c}")))]
    ExecFailed {
        buildpack: String,
        phase: Step,
        code: Option<i32>,
        output: String,
    },
    #[error("buildpack {buildpack} produced invalid output: {reason}")]
    InvalidOutput { buildpack: String, reason: String },
}

/// What a detect step sees.
#[derive(Debug, Clone)]
pub struct DetectContext {
    pub app_dir: PathBuf,
    pub platform_dir: PathBuf,
    /// Environment accumulated from earlier buildpacks of the same group.
    pub env: Env,
}

/// Result of a detect step. A failed detect (`passed == false`) is a normal
/// outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectOutcome {
    pub passed: bool,
    pub plan: DetectPlan,
    /// Environment changes visible to later buildpacks' detect steps.
    pub env_ops: Vec<EnvOp>,
}

impl DetectOutcome {
    pub fn pass(plan: DetectPlan) -> Self {
        Self {
            passed: true,
            plan,
            env_ops: Vec::new(),
        }
    }

    pub fn fail() -> Self {
        Self::default()
    }
}

/// What a build step sees.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub app_dir: PathBuf,
    pub platform_dir: PathBuf,
    /// This buildpack's directory inside the working layers directory.
    pub layers_dir: PathBuf,
    pub plan: BuildpackPlan,
    pub env: Env,
}

/// Result of a build step. Layers are not listed here: they are the
/// `<layer>/` and `<layer>.toml` entries left in `layers_dir`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutcome {
    pub launch: LaunchToml,
}

/// A pluggable build module.
pub trait Buildpack: Send + Sync {
    fn descriptor(&self) -> &BuildpackDescriptor;

    fn detect(&self, ctx: &DetectContext) -> Result<DetectOutcome, BuildpackError>;

    fn build(&self, ctx: &BuildContext) -> Result<BuildOutcome, BuildpackError>;
}
