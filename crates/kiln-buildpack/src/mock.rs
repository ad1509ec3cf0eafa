use crate::{
    BuildContext, BuildOutcome, Buildpack, BuildpackError, DetectContext, DetectOutcome, Env,
    EnvAction, EnvOp, Step,
};
use kiln_schema::{
    write_record, BomEntry, BuildpackDescriptor, BuildpackPlan, DetectPlan, LaunchToml,
    LayerDescriptor, LayerFacets, Metadata, Process, Provide, Require,
};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// A layer a [`MockBuildpack`] writes during build.
#[derive(Debug, Clone)]
pub struct MockLayer {
    name: String,
    facets: LayerFacets,
    files: Vec<(String, Vec<u8>)>,
    metadata: Metadata,
    env: Vec<EnvOp>,
}

impl MockLayer {
    pub fn new(name: &str, facets: LayerFacets) -> Self {
        Self {
            name: name.to_owned(),
            facets,
            files: Vec::new(),
            metadata: Metadata::new(),
            env: Vec::new(),
        }
    }

    /// Add a file under the layer directory. A layer without files and
    /// without env operations is written as TOML only.
    #[must_use]
    pub fn file(mut self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.to_owned(), content.into()));
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn env(mut self, op: EnvOp) -> Self {
        self.env.push(op);
        self
    }

    fn write(&self, layers_dir: &Path) -> Result<(), BuildpackError> {
        let dir = layers_dir.join(&self.name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        if !self.files.is_empty() || !self.env.is_empty() {
            fs::create_dir_all(&dir)?;
        }
        for (path, content) in &self.files {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, content)?;
        }
        if !self.env.is_empty() {
            let env_dir = dir.join("env");
            fs::create_dir_all(&env_dir)?;
            for op in &self.env {
                let suffix = match op.action {
                    EnvAction::Append => "append",
                    EnvAction::Prepend => "prepend",
                    EnvAction::Override => "override",
                    EnvAction::Default => "default",
                };
                fs::write(env_dir.join(format!("{}.{suffix}", op.name)), &op.value)?;
                if let Some(delim) = &op.delim {
                    fs::write(env_dir.join(format!("{}.delim", op.name)), delim)?;
                }
            }
        }
        write_record(
            &layers_dir.join(format!("{}.toml", self.name)),
            &LayerDescriptor {
                facets: self.facets,
                metadata: self.metadata.clone(),
            },
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Calls {
    detect_envs: Vec<Env>,
    builds: Vec<(BuildpackPlan, Env)>,
    found_layers: Vec<Vec<String>>,
}

/// In-process buildpack double configured by builder methods.
///
/// Detect passes with an empty plan unless configured otherwise. Build
/// writes the configured layers into the buildpack's layers directory and
/// returns the configured processes and bill-of-materials. Every call is
/// recorded for inspection.
pub struct MockBuildpack {
    descriptor: BuildpackDescriptor,
    detect_pass: bool,
    detect_error: bool,
    plan: DetectPlan,
    detect_env: Vec<EnvOp>,
    required_env: Vec<String>,
    layers: Vec<MockLayer>,
    launch: LaunchToml,
    build_error: bool,
    calls: Mutex<Calls>,
}

impl MockBuildpack {
    pub fn new(id: &str, version: &str) -> Self {
        Self {
            descriptor: BuildpackDescriptor::new(id, version),
            detect_pass: true,
            detect_error: false,
            plan: DetectPlan::default(),
            detect_env: Vec::new(),
            required_env: Vec::new(),
            layers: Vec::new(),
            launch: LaunchToml::default(),
            build_error: false,
            calls: Mutex::new(Calls::default()),
        }
    }

    #[must_use]
    pub fn with_api(mut self, api: &str) -> Self {
        self.descriptor.api = Some(api.to_owned());
        self
    }

    #[must_use]
    pub fn provides(mut self, name: &str) -> Self {
        self.plan.provides.push(Provide::new(name));
        self
    }

    #[must_use]
    pub fn requires(mut self, name: &str) -> Self {
        self.plan.requires.push(Require::new(name));
        self
    }

    #[must_use]
    pub fn requires_with(mut self, require: Require) -> Self {
        self.plan.requires.push(require);
        self
    }

    /// Detect returns "does not apply".
    #[must_use]
    pub fn failing_detect(mut self) -> Self {
        self.detect_pass = false;
        self
    }

    /// Detect returns an execution error.
    #[must_use]
    pub fn erroring_detect(mut self) -> Self {
        self.detect_error = true;
        self
    }

    /// Environment change handed to later detect steps.
    #[must_use]
    pub fn detect_env(mut self, op: EnvOp) -> Self {
        self.detect_env.push(op);
        self
    }

    /// Detect fails unless `name` is set in the environment it sees.
    #[must_use]
    pub fn requires_env(mut self, name: &str) -> Self {
        self.required_env.push(name.to_owned());
        self
    }

    #[must_use]
    pub fn layer(mut self, layer: MockLayer) -> Self {
        self.layers.push(layer);
        self
    }

    #[must_use]
    pub fn process(mut self, process: Process) -> Self {
        self.launch.processes.push(process);
        self
    }

    #[must_use]
    pub fn bom(mut self, entry: BomEntry) -> Self {
        self.launch.bom.push(entry);
        self
    }

    #[must_use]
    pub fn failing_build(mut self) -> Self {
        self.build_error = true;
        self
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn detect_count(&self) -> usize {
        self.calls().detect_envs.len()
    }

    /// Environment seen by each detect call.
    pub fn detect_envs(&self) -> Vec<Env> {
        self.calls().detect_envs.clone()
    }

    pub fn build_count(&self) -> usize {
        self.calls().builds.len()
    }

    /// Plan and environment seen by each build call.
    pub fn builds(&self) -> Vec<(BuildpackPlan, Env)> {
        self.calls().builds.clone()
    }

    /// Layer names already present when each build started.
    pub fn found_layers(&self) -> Vec<Vec<String>> {
        self.calls().found_layers.clone()
    }

    fn label(&self) -> String {
        format!("{}@{}", self.descriptor.id(), self.descriptor.version())
    }
}

fn existing_layers(dir: &Path) -> Result<Vec<String>, BuildpackError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let layer = if entry.file_type()?.is_dir() {
            Some(name)
        } else {
            name.strip_suffix(".toml")
                .filter(|stem| *stem != "launch")
                .map(str::to_owned)
        };
        if let Some(layer) = layer {
            if !names.contains(&layer) {
                names.push(layer);
            }
        }
    }
    names.sort();
    Ok(names)
}

impl Buildpack for MockBuildpack {
    fn descriptor(&self) -> &BuildpackDescriptor {
        &self.descriptor
    }

    fn detect(&self, ctx: &DetectContext) -> Result<DetectOutcome, BuildpackError> {
        self.calls().detect_envs.push(ctx.env.clone());
        if self.detect_error {
            return Err(BuildpackError::ExecFailed {
                buildpack: self.label(),
                phase: Step::Detect,
                code: Some(1),
                output: "mock detect error".to_owned(),
            });
        }
        let env_ok = self.required_env.iter().all(|n| ctx.env.get(n).is_some());
        if !self.detect_pass || !env_ok {
            return Ok(DetectOutcome::fail());
        }
        Ok(DetectOutcome {
            passed: true,
            plan: self.plan.clone(),
            env_ops: self.detect_env.clone(),
        })
    }

    fn build(&self, ctx: &BuildContext) -> Result<BuildOutcome, BuildpackError> {
        let found = existing_layers(&ctx.layers_dir)?;
        {
            let mut calls = self.calls();
            calls.builds.push((ctx.plan.clone(), ctx.env.clone()));
            calls.found_layers.push(found);
        }
        if self.build_error {
            return Err(BuildpackError::ExecFailed {
                buildpack: self.label(),
                phase: Step::Build,
                code: Some(1),
                output: "mock build error".to_owned(),
            });
        }
        fs::create_dir_all(&ctx.layers_dir)?;
        for layer in &self.layers {
            layer.write(&ctx.layers_dir)?;
        }
        Ok(BuildOutcome {
            launch: self.launch.clone(),
        })
    }
}
