mod commands;

use clap::{Args, Parser, Subcommand};
use commands::{EXIT_INVALID_INPUT, EXIT_PLATFORM_API, EXIT_SUCCESS};
use kiln_buildpack::{DirectorySource, Env};
use kiln_core::{install_signal_handler, CacheConfig, CoreError, Engine, Phase, Record};
use kiln_schema::{verify_platform_api, DEFAULT_PLATFORM_API};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Cloud Native Buildpacks lifecycle: turn application source into an OCI image"
)]
struct Cli {
    /// Platform API version the caller speaks.
    #[arg(long, env = "CNB_PLATFORM_API", default_value = DEFAULT_PLATFORM_API, global = true)]
    platform_api: String,

    /// Working layers directory shared by the phases of one build.
    #[arg(long, env = "CNB_LAYERS_DIR", default_value = "/layers", global = true)]
    layers: PathBuf,

    /// Application source directory.
    #[arg(long, env = "CNB_APP_DIR", default_value = "/workspace", global = true)]
    app: PathBuf,

    #[arg(long, env = "CNB_PLATFORM_DIR", default_value = "/platform", global = true)]
    platform: PathBuf,

    /// Installed buildpacks, laid out as `<id>/<version>/buildpack.toml`.
    #[arg(long, env = "CNB_BUILDPACKS_DIR", default_value = "/cnb/buildpacks", global = true)]
    buildpacks: PathBuf,

    #[arg(long, env = "CNB_GROUP_PATH", global = true)]
    group: Option<PathBuf>,

    #[arg(long, env = "CNB_PLAN_PATH", global = true)]
    plan: Option<PathBuf>,

    #[arg(long, env = "CNB_ANALYZED_PATH", global = true)]
    analyzed: Option<PathBuf>,

    #[arg(long, env = "CNB_REPORT_PATH", global = true)]
    report: Option<PathBuf>,

    /// Registry base URL. Overrides the registry config file.
    #[arg(long, env = "CNB_REGISTRY_URL", global = true)]
    registry: Option<String>,

    /// Write and read images in a local image directory instead of a registry.
    #[arg(long, env = "CNB_DAEMON_DIR", global = true, conflicts_with = "registry")]
    daemon_dir: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    phase: PhaseCommand,
}

#[derive(Debug, Args)]
struct CacheArgs {
    /// Directory holding a volume cache.
    #[arg(long, env = "CNB_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Image holding the cache. Takes precedence over --cache-dir.
    #[arg(long, env = "CNB_CACHE_IMAGE")]
    cache_image: Option<String>,
}

impl CacheArgs {
    fn config(&self) -> Result<CacheConfig, CoreError> {
        CacheConfig::select(self.cache_dir.clone(), self.cache_image.as_deref())
    }
}

#[derive(Debug, Subcommand)]
enum PhaseCommand {
    /// Find the first group of buildpacks that applies to the app.
    Detect {
        #[arg(long, env = "CNB_ORDER_PATH", default_value = "/cnb/order.toml")]
        order: PathBuf,
    },
    /// Read layer metadata from the previous image and the cache.
    Analyze {
        #[arg(long, env = "CNB_PREVIOUS_IMAGE")]
        previous_image: Option<String>,
        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Put cached layers back into the layers directory.
    Restore {
        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Run the build step of every buildpack in the detected group.
    Build,
    /// Assemble the image from the layers directory and write it.
    Export {
        /// Image references to write, all with the same content.
        #[arg(required = true)]
        images: Vec<String>,
        #[arg(long, env = "CNB_RUN_IMAGE")]
        run_image: String,
        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Swap the run image under an exported image.
    Rebase {
        /// Image to rebase; every reference given receives the result.
        #[arg(required = true)]
        images: Vec<String>,
        /// The new run image.
        #[arg(long, env = "CNB_RUN_IMAGE")]
        run_image: String,
    },
    /// Run detect, analyze, restore, build and export in one go.
    Create {
        #[arg(required = true)]
        images: Vec<String>,
        #[arg(long, env = "CNB_ORDER_PATH", default_value = "/cnb/order.toml")]
        order: PathBuf,
        #[arg(long, env = "CNB_PREVIOUS_IMAGE")]
        previous_image: Option<String>,
        #[arg(long, env = "CNB_RUN_IMAGE")]
        run_image: String,
        #[command(flatten)]
        cache: CacheArgs,
    },
}

/// Command line with the phase spliced in when invoked through a phase
/// binary name such as `detector`.
fn phase_args(mut args: Vec<OsString>) -> Vec<OsString> {
    let invoked = args
        .first()
        .and_then(|a| Path::new(a).file_name())
        .and_then(|n| n.to_str())
        .and_then(Phase::parse);
    if let Some(phase) = invoked {
        args.insert(1, OsString::from(phase.name()));
    }
    args
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let args: Vec<OsString> = std::env::args_os().collect();
    if args.get(1).is_some_and(|a| a == "-version") {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::from(EXIT_SUCCESS);
    }
    let cli = match Cli::try_parse_from(phase_args(args)) {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                EXIT_INVALID_INPUT
            } else {
                EXIT_SUCCESS
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = verify_platform_api(&cli.platform_api) {
        eprintln!("error: {e}");
        return ExitCode::from(EXIT_PLATFORM_API);
    }

    install_signal_handler();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(commands::exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<u8, CoreError> {
    let transport = commands::make_transport(cli.registry.as_deref(), cli.daemon_dir.as_deref())?;
    let mut engine = Engine::new(
        &cli.layers,
        &cli.app,
        Arc::new(DirectorySource::new(&cli.buildpacks)),
        transport,
    )
    .with_platform_dir(&cli.platform)
    .with_env(Env::from_process());
    let overrides = [
        (Record::Group, cli.group),
        (Record::Plan, cli.plan),
        (Record::Analyzed, cli.analyzed),
        (Record::Report, cli.report),
    ];
    for (record, path) in overrides {
        if let Some(path) = path {
            engine = engine.with_record_path(record, path);
        }
    }
    let json = cli.json;

    match cli.phase {
        PhaseCommand::Detect { order } => commands::detect::run(&engine, &order, json),
        PhaseCommand::Analyze {
            previous_image,
            cache,
        } => commands::analyze::run(
            &engine.with_cache(cache.config()?),
            previous_image.as_deref(),
            json,
        ),
        PhaseCommand::Restore { cache } => {
            commands::restore::run(&engine.with_cache(cache.config()?), json)
        }
        PhaseCommand::Build => commands::build::run(&engine, json),
        PhaseCommand::Export {
            images,
            run_image,
            cache,
        } => commands::export::run(
            &engine.with_cache(cache.config()?),
            &images,
            &run_image,
            json,
        ),
        PhaseCommand::Rebase { images, run_image } => {
            commands::rebase::run(&engine, &images, &run_image, json)
        }
        PhaseCommand::Create {
            images,
            order,
            previous_image,
            run_image,
            cache,
        } => commands::create::run(
            &engine.with_cache(cache.config()?),
            commands::create::CreateArgs {
                order: &order,
                images: &images,
                previous_image: previous_image.as_deref(),
                run_image: &run_image,
            },
            json,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn phase_binary_name_selects_phase() {
        assert_eq!(
            phase_args(os(&["/cnb/lifecycle/detector", "--json"])),
            os(&["/cnb/lifecycle/detector", "detect", "--json"])
        );
        assert_eq!(phase_args(os(&["creator"]))[1], "create");
    }

    #[test]
    fn main_binary_name_is_left_alone() {
        let args = os(&["/usr/bin/kiln", "build"]);
        assert_eq!(phase_args(args.clone()), args);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn rebase_requires_an_image() {
        let err = Cli::try_parse_from(os(&["kiln", "rebase", "--run-image", "acme/run"])).unwrap_err();
        assert!(err.use_stderr());
    }
}
