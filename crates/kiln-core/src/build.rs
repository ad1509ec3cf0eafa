use crate::concurrency::check_interrupted;
use crate::CoreError;
use kiln_buildpack::{layer_env_ops, BuildContext, BuildpackSource, Env, EnvScope};
use kiln_schema::{
    verify_group_apis, write_record, BuildMetadata, BuildPlan, Group, LayerDescriptor,
};
use kiln_store::{LayerDir, LayersDir};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Runs the build step of every buildpack in a resolved group.
pub struct Builder<'a> {
    source: &'a dyn BuildpackSource,
    layers: &'a LayersDir,
    app_dir: PathBuf,
    platform_dir: PathBuf,
    env: Env,
}

impl<'a> Builder<'a> {
    pub fn new(
        source: &'a dyn BuildpackSource,
        layers: &'a LayersDir,
        app_dir: impl Into<PathBuf>,
        platform_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            layers,
            app_dir: app_dir.into(),
            platform_dir: platform_dir.into(),
            env: Env::new(),
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    /// Build `group` in order and write the merged result to
    /// `<layers>/config/metadata.toml`.
    ///
    /// Every entry is resolved, and its API checked, before the first build
    /// step runs. Each buildpack sees the environment contributed by the build
    /// layers of the buildpacks before it. A failing optional buildpack is
    /// dropped; any other failure aborts the build.
    pub fn build(&self, group: &Group, plan: &BuildPlan) -> Result<BuildMetadata, CoreError> {
        verify_group_apis(&group.group)?;
        let resolved = group
            .iter()
            .map(|entry| Ok((entry, self.source.resolve(entry)?)))
            .collect::<Result<Vec<_>, CoreError>>()?;

        self.layers.create()?;
        let mut env = self.env.clone();
        let mut metadata = BuildMetadata::default();

        for (entry, buildpack) in resolved {
            check_interrupted()?;
            let layers_dir = self.layers.buildpack_dir(&entry.id);
            fs::create_dir_all(&layers_dir)?;

            info!("building {entry}");
            let ctx = BuildContext {
                app_dir: self.app_dir.clone(),
                platform_dir: self.platform_dir.clone(),
                layers_dir,
                plan: plan.for_buildpack(&entry.id),
                env: env.clone(),
            };
            let outcome = match buildpack.build(&ctx) {
                Ok(outcome) => outcome,
                Err(e) if entry.optional => {
                    warn!("optional buildpack {entry} failed and was dropped: {e}");
                    continue;
                }
                Err(e) => {
                    return Err(CoreError::BuildFailed {
                        buildpack: entry.to_string(),
                        source: e,
                    })
                }
            };

            for (layer, descriptor) in self.reconcile(&entry.id)? {
                if descriptor.facets.build && layer.has_content() {
                    env.apply_all(&layer_env_ops(&layer.dir, &layer.dir, EnvScope::Build)?);
                }
            }

            metadata.merge_processes(outcome.launch.processes);
            metadata.bom.extend(outcome.launch.bom.into_iter().map(|mut bom| {
                bom.buildpack = Some(entry.id.clone());
                bom
            }));
            metadata.buildpacks.push(entry.clone());
        }

        write_record(&self.layers.build_metadata_path(), &metadata)?;
        info!(
            "build finished: {} buildpacks, {} processes",
            metadata.buildpacks.len(),
            metadata.processes.len()
        );
        Ok(metadata)
    }

    /// Bring the buildpack's directory in line with what the buildpack
    /// returned: a layer without a TOML was dropped and is removed, and a
    /// digest marker without content is stale. Returns the kept layers.
    fn reconcile(&self, buildpack: &str) -> Result<Vec<(LayerDir, LayerDescriptor)>, CoreError> {
        let mut kept = Vec::new();
        for name in self.layers.layer_names(buildpack)? {
            let layer = self.layers.layer(buildpack, &name);
            match layer.read_descriptor()? {
                None => {
                    debug!("removing layer {buildpack}:{name} not returned by the buildpack");
                    layer.remove()?;
                }
                Some(descriptor) => {
                    if !layer.has_content() && layer.sha.exists() {
                        fs::remove_file(&layer.sha)?;
                    }
                    kept.push((layer, descriptor));
                }
            }
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_buildpack::{EnvOp, MapSource, MockBuildpack, MockLayer};
    use kiln_schema::{
        read_record, BomEntry, BuildpackRef, DetectPlan, LayerFacets, Process, Provide, Require,
    };
    use std::sync::Arc;

    fn build_layer(name: &str) -> MockLayer {
        MockLayer::new(
            name,
            LayerFacets {
                build: true,
                ..LayerFacets::default()
            },
        )
    }

    #[test]
    fn buildpacks_run_in_order_with_earlier_build_env() {
        let dir = tempfile::tempdir().unwrap();
        let layers = LayersDir::new(dir.path().join("layers"));
        let a = Arc::new(
            MockBuildpack::new("acme/node", "1")
                .layer(build_layer("runtime").file("bin/node", "#!/bin/sh\n").env(EnvOp::new(
                    "NODE_HOME",
                    kiln_buildpack::EnvAction::Override,
                    "/node",
                )))
                .process(Process::new("web", "node server.js")),
        );
        let b = Arc::new(MockBuildpack::new("acme/npm", "1").process(Process::new("web", "npm start")));
        let source = MapSource::new().with(a.clone()).with(b.clone());

        let group = Group::new(vec![BuildpackRef::new("acme/node", "1"), BuildpackRef::new("acme/npm", "1")]);
        let builder = Builder::new(&source, &layers, dir.path(), dir.path())
            .with_env(Env::from_vars([("PATH", "/usr/bin")]));
        let metadata = builder.build(&group, &BuildPlan::default()).unwrap();

        let (_, a_env) = &a.builds()[0];
        assert_eq!(a_env.get("PATH"), Some("/usr/bin"));
        let (_, b_env) = &b.builds()[0];
        let runtime = layers.layer("acme/node", "runtime").dir;
        assert_eq!(
            b_env.get("PATH"),
            Some(format!("{}:/usr/bin", runtime.join("bin").display()).as_str())
        );
        assert_eq!(b_env.get("NODE_HOME"), Some("/node"));

        assert_eq!(metadata.processes.len(), 1);
        assert_eq!(metadata.processes[0].command, "npm start");
        assert_eq!(metadata.buildpacks.len(), 2);
        let on_disk: BuildMetadata = read_record(&layers.build_metadata_path()).unwrap();
        assert_eq!(on_disk, metadata);
    }

    #[test]
    fn each_buildpack_gets_its_plan_entries() {
        let dir = tempfile::tempdir().unwrap();
        let layers = LayersDir::new(dir.path());
        let a = Arc::new(MockBuildpack::new("a", "1"));
        let b = Arc::new(MockBuildpack::new("b", "1"));
        let source = MapSource::new().with(a.clone()).with(b.clone());
        let mut plan = BuildPlan::default();
        plan.push_detect(
            &"a".into(),
            &DetectPlan {
                provides: vec![Provide::new("node")],
                requires: vec![],
            },
        );
        plan.push_detect(
            &"b".into(),
            &DetectPlan {
                provides: vec![],
                requires: vec![Require::new("node")],
            },
        );
        let group = Group::new(vec![BuildpackRef::new("a", "1"), BuildpackRef::new("b", "1")]);
        Builder::new(&source, &layers, dir.path(), dir.path())
            .build(&group, &plan)
            .unwrap();

        assert!(a.builds()[0].0.entries.is_empty());
        assert_eq!(b.builds()[0].0.names(), vec!["node"]);
    }

    #[test]
    fn required_failure_is_build_failed() {
        let dir = tempfile::tempdir().unwrap();
        let layers = LayersDir::new(dir.path());
        let source = MapSource::new().with(Arc::new(MockBuildpack::new("a", "1").failing_build()));
        let group = Group::new(vec![BuildpackRef::new("a", "1")]);
        let err = Builder::new(&source, &layers, dir.path(), dir.path())
            .build(&group, &BuildPlan::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::BuildFailed { ref buildpack, .. } if buildpack == "a@1"));
        assert!(!layers.build_metadata_path().exists());
    }

    #[test]
    fn incompatible_api_later_in_group_stops_before_any_build() {
        let dir = tempfile::tempdir().unwrap();
        let layers = LayersDir::new(dir.path().join("layers"));
        let a = Arc::new(MockBuildpack::new("a", "1"));
        let b = Arc::new(MockBuildpack::new("b", "1"));
        let source = MapSource::new().with(a.clone()).with(b.clone());

        let group = Group::new(vec![BuildpackRef::new("a", "1"), BuildpackRef::new("b", "1").with_api("0.1")]);
        let err = Builder::new(&source, &layers, dir.path(), dir.path())
            .build(&group, &BuildPlan::default())
            .unwrap_err();
        assert_eq!(err.category(), Some(crate::FailureCategory::ApiIncompatible));
        assert_eq!(a.build_count(), 0);
        assert_eq!(b.build_count(), 0);
        assert!(!layers.build_metadata_path().exists());

        let declared = Arc::new(MockBuildpack::new("c", "1").with_api("9.9"));
        let source = MapSource::new().with(a.clone()).with(declared.clone());
        let group = Group::new(vec![BuildpackRef::new("a", "1"), BuildpackRef::new("c", "1")]);
        let err = Builder::new(&source, &layers, dir.path(), dir.path())
            .build(&group, &BuildPlan::default())
            .unwrap_err();
        assert_eq!(err.category(), Some(crate::FailureCategory::ApiIncompatible));
        assert_eq!(a.build_count(), 0);
        assert_eq!(declared.build_count(), 0);
    }

    #[test]
    fn optional_failure_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let layers = LayersDir::new(dir.path());
        let b = Arc::new(MockBuildpack::new("b", "1"));
        let source = MapSource::new()
            .with(Arc::new(MockBuildpack::new("a", "1").failing_build()))
            .with(b.clone());
        let group = Group::new(vec![BuildpackRef::new("a", "1").optional(), BuildpackRef::new("b", "1")]);
        let metadata = Builder::new(&source, &layers, dir.path(), dir.path())
            .build(&group, &BuildPlan::default())
            .unwrap();
        assert_eq!(metadata.buildpacks, vec![BuildpackRef::new("b", "1")]);
        assert_eq!(b.build_count(), 1);
    }

    #[test]
    fn layers_without_toml_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let layers = LayersDir::new(dir.path());
        let stale = layers.layer("a", "stale");
        fs::create_dir_all(stale.dir.join("bin")).unwrap();
        stale.write_sha(&kiln_schema::Digest::of(b"old")).unwrap();
        let kept = layers.layer("a", "meta-only");
        kept.write_descriptor(&LayerDescriptor {
            facets: LayerFacets::launch(),
            metadata: kiln_schema::Metadata::new(),
        })
        .unwrap();
        kept.write_sha(&kiln_schema::Digest::of(b"prev")).unwrap();

        let a = Arc::new(MockBuildpack::new("a", "1").bom(BomEntry::new("node")));
        let source = MapSource::new().with(a.clone());
        let group = Group::new(vec![BuildpackRef::new("a", "1")]);
        let metadata = Builder::new(&source, &layers, dir.path(), dir.path())
            .build(&group, &BuildPlan::default())
            .unwrap();

        assert_eq!(a.found_layers()[0], vec!["meta-only", "stale"]);
        assert!(!stale.dir.exists());
        assert!(!stale.sha.exists());
        assert!(kept.toml.exists());
        assert!(!kept.sha.exists());
        assert_eq!(metadata.bom[0].buildpack.as_deref(), Some("a"));
    }
}
