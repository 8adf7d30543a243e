use anyhow::Result;
use buildkit_bootstrap::{AppConfig, CliArgs, ConsoleFormat, EngineOverride, ProviderId};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;

use std::path::PathBuf;
use std::time::Duration;

mod commands;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// please-buildkit - BuildKit image builds for the Please build system
#[derive(Parser)]
#[command(name = "please-buildkit")]
#[command(about = "Builds, pushes and rewrites container images through an ephemeral buildkitd")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long = "print_config", global = true)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Console log format: console or json
    #[arg(long = "log_format", default_value = "console", global = true)]
    log_format: ConsoleFormat,

    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Backend overrides shared by every command that starts buildkitd
#[derive(Args)]
struct BackendArgs {
    #[arg(long = "buildctl_binary", global = true)]
    buildctl_binary: Option<String>,

    /// Deadline for buildkitd to report a registered worker, e.g. `5s`
    #[arg(long = "buildkitd_timeout", value_parser = parse_duration, global = true)]
    buildkitd_timeout: Option<Duration>,

    /// Upper bound on concurrent builds; 0 disables the bound
    #[arg(long = "max_concurrent_builds", global = true)]
    max_concurrent_builds: Option<usize>,

    #[arg(long = "docker_binary", global = true)]
    docker_binary: Option<String>,
    #[arg(long = "docker_image", global = true)]
    docker_image: Option<String>,
    #[arg(long = "rootless_docker_binary", global = true)]
    rootless_docker_binary: Option<String>,
    #[arg(long = "rootless_docker_image", global = true)]
    rootless_docker_image: Option<String>,
    #[arg(long = "podman_binary", global = true)]
    podman_binary: Option<String>,
    #[arg(long = "podman_image", global = true)]
    podman_image: Option<String>,
}

impl BackendArgs {
    fn engines(&self) -> Vec<(ProviderId, EngineOverride)> {
        [
            (ProviderId::Docker, &self.docker_binary, &self.docker_image),
            (
                ProviderId::RootlessDocker,
                &self.rootless_docker_binary,
                &self.rootless_docker_image,
            ),
            (ProviderId::Podman, &self.podman_binary, &self.podman_image),
        ]
        .into_iter()
        .filter(|(_, binary, image)| binary.is_some() || image.is_some())
        .map(|(id, binary, image)| {
            (
                id,
                EngineOverride {
                    binary: binary.clone(),
                    image: image.clone(),
                },
            )
        })
        .collect()
    }
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

#[derive(Subcommand)]
enum Commands {
    /// Serve build requests from Please over stdin/stdout
    Worker,
    /// Build an image directly, outside the worker protocol
    Build(commands::build::BuildArgs),
    /// Push an image tarball to its tags
    Push(commands::push::PushArgs),
    /// Replace image references in a file with the image's most specific tag
    Replace(commands::replace::ReplaceArgs),
    /// Validate configuration and probe every container engine
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
        buildctl_binary: cli.backend.buildctl_binary.clone(),
        readiness_timeout: cli.backend.buildkitd_timeout,
        max_concurrent_builds: cli.backend.max_concurrent_builds,
        engines: cli.backend.engines(),
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (PLEASE_BUILDKIT__*) -> 4) CLI overrides
    let mut config = AppConfig::load_layered(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let is_worker = matches!(cli.command, Commands::Worker);
    if is_worker {
        commands::worker::route_logs_to_file(&mut config, cli.verbose);
    }

    let starts_backend = matches!(cli.command, Commands::Worker | Commands::Build(_));
    let log_dir = buildkit_bootstrap::paths::log_dir::resolve_log_dir(
        &config.buildkit.log_dir,
        /*create*/ starts_backend,
    )?;
    if is_worker {
        commands::worker::reset_log(&config, &log_dir)?;
    }
    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    let guard = buildkit_bootstrap::init_logging(&logging_config, &log_dir, cli.log_format);

    let cancel = buildkit_bootstrap::shutdown_token();

    let result = match cli.command {
        Commands::Worker => commands::worker::run(&config, &log_dir, &cancel).await,
        Commands::Build(build) => commands::build::run(&config, &log_dir, &build, &cancel).await,
        Commands::Push(push) => commands::push::run(&push, &cancel).await,
        Commands::Replace(replace) => commands::replace::run(&replace),
        Commands::Check => commands::check::run(&config, &log_dir).await,
    };

    if is_worker {
        if let Err(e) = &result {
            tracing::error!(error = %format!("{e:#}"), "worker failed");
        }
        // The stdin reader may still be parked in a blocking read; leave
        // without waiting for it once logs are flushed.
        drop(guard);
        std::process::exit(i32::from(result.is_err()));
    }

    drop(guard);
    result
}
