use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::paths::log_dir::resolve_log_dir;

/// Environment prefix for configuration overrides, e.g.
/// `PLEASE_BUILDKIT__BUILDKIT__BUILDCTL_BINARY=/opt/bin/buildctl`.
pub const ENV_PREFIX: &str = "PLEASE_BUILDKIT__";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Backend lifecycle and worker session settings.
    #[serde(default)]
    pub buildkit: BuildkitConfig,
    /// Container engines able to host the buildkitd backend.
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildkitConfig {
    /// Binary used both for builds and for the worker-listing readiness query.
    pub buildctl_binary: String,
    /// Hard deadline for the backend to report a registered worker.
    #[serde(with = "humantime_serde")]
    pub readiness_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub readiness_interval: Duration,
    /// Attempt budget for the allocate-then-start sequence.
    pub start_attempts: u32,
    /// Base delay between start attempts, doubled per attempt.
    #[serde(with = "humantime_serde")]
    pub start_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub start_backoff_max: Duration,
    /// Upper bound on concurrent build invocations; 0 disables the bound.
    pub max_concurrent_builds: usize,
    /// How long in-flight requests may keep running after cancellation.
    #[serde(with = "humantime_serde")]
    pub drain_grace: Duration,
    /// Directory for worker and backend log files; normalized to an absolute path on load.
    pub log_dir: String,
    pub container_name_prefix: String,
}

impl Default for BuildkitConfig {
    fn default() -> Self {
        Self {
            buildctl_binary: "buildctl".to_string(),
            readiness_timeout: Duration::from_secs(5),
            readiness_interval: Duration::from_millis(250),
            start_attempts: 10,
            start_backoff: Duration::from_millis(100),
            start_backoff_max: Duration::from_secs(5),
            max_concurrent_builds: 8,
            drain_grace: Duration::from_secs(10),
            log_dir: "plz-out/log".to_string(),
            container_name_prefix: "please-buildkit".to_string(),
        }
    }
}

/// Identifies one configured container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Docker,
    RootlessDocker,
    Podman,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub binary: String,
    pub image: String,
}

impl EngineConfig {
    fn new(binary: &str, image: &str) -> Self {
        Self {
            binary: binary.to_string(),
            image: image.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvidersConfig {
    /// Probe order; the first supported engine wins.
    pub order: Vec<ProviderId>,
    pub docker: EngineConfig,
    pub rootless_docker: EngineConfig,
    pub podman: EngineConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            order: vec![
                ProviderId::Podman,
                ProviderId::RootlessDocker,
                ProviderId::Docker,
            ],
            docker: EngineConfig::new("docker", "moby/buildkit:master"),
            rootless_docker: EngineConfig::new("docker", "moby/buildkit:master-rootless"),
            podman: EngineConfig::new("podman", "docker.io/moby/buildkit:master"),
        }
    }
}

impl ProvidersConfig {
    pub fn engine(&self, id: ProviderId) -> &EngineConfig {
        match id {
            ProviderId::Docker => &self.docker,
            ProviderId::RootlessDocker => &self.rootless_docker,
            ProviderId::Podman => &self.podman,
        }
    }

    fn engine_mut(&mut self, id: ProviderId) -> &mut EngineConfig {
        match id {
            ProviderId::Docker => &mut self.docker,
            ProviderId::RootlessDocker => &mut self.rootless_docker,
            ProviderId::Podman => &mut self.podman,
        }
    }
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "please-buildkit-worker.log", relative to buildkit.log_dir
    #[serde(default)]
    pub file_level: String,
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>, // How many files to keep
    #[serde(default)]
    pub max_size_mb: Option<u64>, // Max size of the file in MB
}

/// Create a default logging configuration: console only.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: String::new(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl AppConfig {
    /// Layered loading: defaults → YAML file (if any) → `PLEASE_BUILDKIT__*` environment.
    /// Also normalizes `buildkit.log_dir` into an absolute path.
    pub fn load_layered(config_path: Option<&Path>) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| "Failed to extract config from figment".to_string())?;

        let log_dir = resolve_log_dir(&config.buildkit.log_dir, /*create*/ false)
            .context("Failed to resolve buildkit.log_dir")?;
        config.buildkit.log_dir = log_dir.to_string_lossy().to_string();

        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(buildctl) = &args.buildctl_binary {
            self.buildkit.buildctl_binary = buildctl.clone();
        }
        if let Some(timeout) = args.readiness_timeout {
            self.buildkit.readiness_timeout = timeout;
        }
        if let Some(max) = args.max_concurrent_builds {
            self.buildkit.max_concurrent_builds = max;
        }
        for (id, engine) in &args.engines {
            let target = self.providers.engine_mut(*id);
            if let Some(binary) = &engine.binary {
                target.binary = binary.clone();
            }
            if let Some(image) = &engine.image {
                target.image = image.clone();
            }
        }

        // Set logging level based on verbose flags for "default" section.
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }
}

/// Per-engine overrides coming from the command line.
#[derive(Debug, Clone, Default)]
pub struct EngineOverride {
    pub binary: Option<String>,
    pub image: Option<String>,
}

/// Command line arguments structure.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
    pub buildctl_binary: Option<String>,
    pub readiness_timeout: Option<Duration>,
    pub max_concurrent_builds: Option<usize>,
    pub engines: Vec<(ProviderId, EngineOverride)>,
}
