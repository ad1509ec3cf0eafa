use crate::analyze::analyze;
use crate::build::Builder;
use crate::cache::CacheConfig;
use crate::concurrency::WorkspaceLock;
use crate::detect::{DetectResult, Detector};
use crate::export::{ExportOptions, Exporter};
use crate::lifecycle::{validate_inputs, Phase, Record};
use crate::rebase::{rebase, RebaseOptions};
use crate::restore::{restore, RestoreReport};
use crate::CoreError;
use kiln_buildpack::{BuildpackSource, Env};
use kiln_remote::{ImageRef, ImageTransport};
use kiln_schema::{
    read_record, verify_group_apis, write_record, AnalyzedRecord, BuildMetadata, BuildPlan,
    ExportReport, Group, Order, RebaseReport,
};
use kiln_store::{CacheStore, LayersDir};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs lifecycle phases over one working layers directory.
///
/// Every phase records its output in the layers directory, so phases run as
/// separate processes and phases run by [`Engine::create`] see the same
/// state. Each call holds the directory's exclusive lock for its duration.
pub struct Engine {
    layers: LayersDir,
    app_dir: PathBuf,
    platform_dir: PathBuf,
    source: Arc<dyn BuildpackSource>,
    transport: Arc<dyn ImageTransport>,
    cache: CacheConfig,
    env: Env,
    records: HashMap<Record, PathBuf>,
}

/// Inputs of a combined detect, analyze, restore, build and export run.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub order: Order,
    /// Image to reuse layers from. Defaults to the first export reference.
    pub previous_image: Option<ImageRef>,
    pub export: ExportOptions,
}

impl Engine {
    pub fn new(
        layers_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
        source: Arc<dyn BuildpackSource>,
        transport: Arc<dyn ImageTransport>,
    ) -> Self {
        Self {
            layers: LayersDir::new(layers_dir),
            app_dir: app_dir.into(),
            platform_dir: PathBuf::from("/platform"),
            source,
            transport,
            cache: CacheConfig::Disabled,
            env: Env::new(),
            records: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_platform_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.platform_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Base environment handed to buildpacks.
    #[must_use]
    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    /// Read or write `record` at `path` instead of inside the layers directory.
    #[must_use]
    pub fn with_record_path(mut self, record: Record, path: impl Into<PathBuf>) -> Self {
        self.records.insert(record, path.into());
        self
    }

    pub fn layers(&self) -> &LayersDir {
        &self.layers
    }

    pub fn record_path(&self, record: Record) -> PathBuf {
        if let Some(path) = self.records.get(&record) {
            return path.clone();
        }
        match record {
            Record::Group => self.layers.group_path(),
            Record::Plan => self.layers.plan_path(),
            Record::Analyzed => self.layers.analyzed_path(),
            Record::BuildMetadata => self.layers.build_metadata_path(),
            Record::Report => self.layers.report_path(),
        }
    }

    fn prepare(&self, phase: Phase) -> Result<WorkspaceLock, CoreError> {
        self.layers.create()?;
        let lock = WorkspaceLock::acquire(&self.layers.lock_path(), phase)?;
        validate_inputs(phase, |r| self.record_path(r))?;
        info!("{phase}: layers {}", self.layers.root().display());
        Ok(lock)
    }

    fn read<T: serde::de::DeserializeOwned>(&self, record: Record) -> Result<T, CoreError> {
        Ok(read_record(&self.record_path(record))?)
    }

    fn write<T: serde::Serialize>(&self, record: Record, value: &T) -> Result<(), CoreError> {
        Ok(write_record(&self.record_path(record), value)?)
    }

    /// Open the configured cache. Failing to open it only disables caching.
    fn open_cache(&self) -> (Option<Arc<dyn CacheStore>>, Option<String>) {
        match self.cache.open(&self.transport) {
            Ok(cache) => (cache, None),
            Err(e) => {
                warn!("cache unavailable, continuing without it: {e}");
                (None, Some(e.to_string()))
            }
        }
    }

    pub fn detect(&self, order: &Order) -> Result<DetectResult, CoreError> {
        let _lock = self.prepare(Phase::Detect)?;
        self.run_detect(order)
    }

    pub fn analyze(&self, previous: Option<&ImageRef>) -> Result<AnalyzedRecord, CoreError> {
        let _lock = self.prepare(Phase::Analyze)?;
        self.run_analyze(previous)
    }

    pub fn restore(&self) -> Result<RestoreReport, CoreError> {
        let _lock = self.prepare(Phase::Restore)?;
        let group: Group = self.read(Record::Group)?;
        let analyzed: AnalyzedRecord = self.read(Record::Analyzed)?;
        self.run_restore(&group, &analyzed)
    }

    pub fn build(&self) -> Result<BuildMetadata, CoreError> {
        let _lock = self.prepare(Phase::Build)?;
        let group: Group = self.read(Record::Group)?;
        let plan: BuildPlan = self.read(Record::Plan)?;
        self.run_build(&group, &plan)
    }

    pub fn export(&self, opts: &ExportOptions) -> Result<ExportReport, CoreError> {
        let _lock = self.prepare(Phase::Export)?;
        let analyzed: AnalyzedRecord = self.read(Record::Analyzed)?;
        let build: BuildMetadata = self.read(Record::BuildMetadata)?;
        self.run_export(opts, &analyzed, &build)
    }

    /// Rebase works on images only and leaves the layers directory alone.
    pub fn rebase(&self, opts: &RebaseOptions) -> Result<RebaseReport, CoreError> {
        info!("{}: {} onto {}", Phase::Rebase, opts.image, opts.new_base);
        rebase(self.transport.as_ref(), opts)
    }

    /// Run detect, analyze, restore, build and export under one lock.
    pub fn create(&self, opts: &CreateOptions) -> Result<ExportReport, CoreError> {
        let _lock = self.prepare(Phase::Create)?;
        let detected = self.run_detect(&opts.order)?;
        let previous = opts
            .previous_image
            .as_ref()
            .or_else(|| opts.export.images.first());
        let analyzed = self.run_analyze(previous)?;
        self.run_restore(&detected.group, &analyzed)?;
        let build = self.run_build(&detected.group, &detected.plan)?;
        self.run_export(&opts.export, &analyzed, &build)
    }

    fn run_detect(&self, order: &Order) -> Result<DetectResult, CoreError> {
        let result = Detector::new(self.source.as_ref(), &self.app_dir, &self.platform_dir)
            .with_env(self.env.clone())
            .detect(order)?;
        self.write(Record::Group, &result.group)?;
        self.write(Record::Plan, &result.plan)?;
        Ok(result)
    }

    fn run_analyze(&self, previous: Option<&ImageRef>) -> Result<AnalyzedRecord, CoreError> {
        let (cache, _) = self.open_cache();
        let record = analyze(self.transport.as_ref(), previous, cache.as_deref())?;
        self.write(Record::Analyzed, &record)?;
        Ok(record)
    }

    fn run_restore(&self, group: &Group, analyzed: &AnalyzedRecord) -> Result<RestoreReport, CoreError> {
        verify_group_apis(&group.group)?;
        let (cache, _) = self.open_cache();
        restore(&self.layers, group, &analyzed.metadata, cache.as_deref())
    }

    fn run_build(&self, group: &Group, plan: &BuildPlan) -> Result<BuildMetadata, CoreError> {
        let build = Builder::new(self.source.as_ref(), &self.layers, &self.app_dir, &self.platform_dir)
            .with_env(self.env.clone())
            .build(group, plan)?;
        let default_path = self.layers.build_metadata_path();
        let path = self.record_path(Record::BuildMetadata);
        if path != default_path {
            self.write(Record::BuildMetadata, &build)?;
        }
        Ok(build)
    }

    fn run_export(
        &self,
        opts: &ExportOptions,
        analyzed: &AnalyzedRecord,
        build: &BuildMetadata,
    ) -> Result<ExportReport, CoreError> {
        verify_group_apis(&build.buildpacks)?;
        let (cache, open_error) = if self.cache.is_enabled() {
            self.open_cache()
        } else {
            (None, None)
        };
        let mut report = Exporter::new(self.transport.as_ref(), &self.layers, &self.app_dir)
            .with_cache(cache.as_deref())
            .export(opts, analyzed, build)?;
        report.cache_error = report.cache_error.or(open_error);
        self.write(Record::Report, &report)?;
        Ok(report)
    }
}
