use crate::{
    BuildContext, BuildOutcome, Buildpack, BuildpackError, DetectContext, DetectOutcome, Env,
    EnvOp, Step,
};
use kiln_schema::{read_record, write_record, BuildpackDescriptor, DetectPlan, LaunchToml};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// Exit status of `bin/detect` meaning "does not apply".
pub const DETECT_FAIL_CODE: i32 = 100;

/// The plan file a detect executable writes. Besides the plan it may list
/// environment changes for the detect steps of later buildpacks.
#[derive(Debug, Default, Deserialize)]
struct DetectOutput {
    #[serde(flatten)]
    plan: DetectPlan,
    #[serde(default)]
    env: Vec<EnvOp>,
}

/// A buildpack on disk, run as `bin/detect` and `bin/build` subprocesses.
///
/// ```text
/// <dir>/buildpack.toml
/// <dir>/bin/detect <platform> <plan.toml>      cwd = app, exit 0 pass, 100 fail
/// <dir>/bin/build  <layers/bp> <platform> <plan.toml>
/// ```
pub struct ProcessBuildpack {
    dir: PathBuf,
    descriptor: BuildpackDescriptor,
}

impl ProcessBuildpack {
    pub fn new(dir: impl Into<PathBuf>, descriptor: BuildpackDescriptor) -> Self {
        Self {
            dir: dir.into(),
            descriptor,
        }
    }

    /// Load `<dir>/buildpack.toml`.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, BuildpackError> {
        let dir = dir.into();
        let descriptor: BuildpackDescriptor = read_record(&dir.join("buildpack.toml"))?;
        Ok(Self::new(dir, descriptor))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn label(&self) -> String {
        format!("{}@{}", self.descriptor.id(), self.descriptor.version())
    }

    fn command(&self, step: Step, cwd: &Path, env: &Env) -> Command {
        let mut cmd = Command::new(self.dir.join("bin").join(step.to_string()));
        cmd.current_dir(cwd)
            .env_clear()
            .envs(env.iter())
            .env("CNB_BUILDPACK_DIR", &self.dir);
        cmd
    }

    fn run(&self, step: Step, mut cmd: Command) -> Result<Output, BuildpackError> {
        debug!("{} {step}: {:?}", self.label(), cmd);
        let output = cmd.output()?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("[{} {step}] {line}", self.label());
        }
        Ok(output)
    }

    fn exec_failed(&self, step: Step, output: &Output) -> BuildpackError {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        BuildpackError::ExecFailed {
            buildpack: self.label(),
            phase: step,
            code: output.status.code(),
            output: text.trim().to_owned(),
        }
    }
}

impl Buildpack for ProcessBuildpack {
    fn descriptor(&self) -> &BuildpackDescriptor {
        &self.descriptor
    }

    fn detect(&self, ctx: &DetectContext) -> Result<DetectOutcome, BuildpackError> {
        let scratch = tempfile::tempdir()?;
        let plan_path = scratch.path().join("plan.toml");
        let mut cmd = self.command(Step::Detect, &ctx.app_dir, &ctx.env);
        cmd.arg(&ctx.platform_dir).arg(&plan_path);

        let output = self.run(Step::Detect, cmd)?;
        match output.status.code() {
            Some(0) => {}
            Some(DETECT_FAIL_CODE) => return Ok(DetectOutcome::fail()),
            _ => return Err(self.exec_failed(Step::Detect, &output)),
        }

        let written: DetectOutput = if plan_path.exists() {
            read_record(&plan_path).map_err(|e| BuildpackError::InvalidOutput {
                buildpack: self.label(),
                reason: format!("detect plan: {e}"),
            })?
        } else {
            DetectOutput::default()
        };
        Ok(DetectOutcome {
            passed: true,
            plan: written.plan,
            env_ops: written.env,
        })
    }

    fn build(&self, ctx: &BuildContext) -> Result<BuildOutcome, BuildpackError> {
        std::fs::create_dir_all(&ctx.layers_dir)?;
        let scratch = tempfile::tempdir()?;
        let plan_path = scratch.path().join("plan.toml");
        write_record(&plan_path, &ctx.plan)?;

        let mut cmd = self.command(Step::Build, &ctx.app_dir, &ctx.env);
        cmd.arg(&ctx.layers_dir).arg(&ctx.platform_dir).arg(&plan_path);
        let output = self.run(Step::Build, cmd)?;
        if !output.status.success() {
            return Err(self.exec_failed(Step::Build, &output));
        }

        let launch_path = ctx.layers_dir.join("launch.toml");
        let launch: LaunchToml = if launch_path.exists() {
            read_record(&launch_path).map_err(|e| BuildpackError::InvalidOutput {
                buildpack: self.label(),
                reason: format!("launch.toml: {e}"),
            })?
        } else {
            LaunchToml::default()
        };
        Ok(BuildOutcome { launch })
    }
}
