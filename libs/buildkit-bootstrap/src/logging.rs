use crate::config::{LoggingConfig, Section};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::{fmt, util::SubscriberInitExt, Layer};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleFormat {
    /// Human-friendly, ANSI colours when stderr is a terminal.
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for ConsoleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("invalid format: {other}")),
        }
    }
}

/// Keeps the non-blocking console writer alive; drop it last in `main`.
#[must_use = "dropping the guard stops console log delivery"]
pub struct LoggingGuard {
    _console: Option<tracing_appender::non_blocking::WorkerGuard>,
}

// ================= level helpers =================

fn parse_tracing_level(s: &str) -> Option<tracing::Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

/// Returns true if target == crate_name or target starts with "crate_name::"
fn matches_crate_prefix(target: &str, crate_name: &str) -> bool {
    target == crate_name
        || (target.starts_with(crate_name) && target[crate_name.len()..].starts_with("::"))
}

// ================= rotating writer for files =================

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

#[derive(Clone)]
struct RotWriterHandle(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut w) => w.write(buf),
            // A panicked writer must not take the process down with it.
            Err(_) => Ok(buf.len()),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut w) => w.flush(),
            Err(_) => Ok(()),
        }
    }
}

// A writer handle that may be None (drops writes)
#[derive(Clone)]
struct RoutedWriterHandle(Option<RotWriterHandle>);

impl Write for RoutedWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(w) = &mut self.0 {
            w.write(buf)
        } else {
            Ok(buf.len())
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(w) = &mut self.0 {
            w.flush()
        } else {
            Ok(())
        }
    }
}

/// Route log records to different files by target prefix:
/// keys are *full* prefixes like "buildkit_runtime::session"
#[derive(Clone)]
struct MultiFileRouter {
    default: Option<RotWriter>,
    by_prefix: HashMap<String, RotWriter>,
}

impl MultiFileRouter {
    fn resolve_for(&self, target: &str) -> Option<RotWriterHandle> {
        for (crate_name, wr) in &self.by_prefix {
            if matches_crate_prefix(target, crate_name) {
                return Some(RotWriterHandle(wr.0.clone()));
            }
        }
        self.default.as_ref().map(|w| RotWriterHandle(w.0.clone()))
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for MultiFileRouter {
    type Writer = RoutedWriterHandle;

    fn make_writer(&'a self) -> Self::Writer {
        RoutedWriterHandle(self.default.as_ref().map(|w| RotWriterHandle(w.0.clone())))
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        RoutedWriterHandle(self.resolve_for(meta.target()))
    }
}

// ================= config extraction =================

struct ConfigData<'a> {
    default_section: Option<&'a Section>,
    crate_sections: Vec<(String, &'a Section)>,
}

fn extract_config_data(cfg: &LoggingConfig) -> ConfigData<'_> {
    let crate_sections = cfg
        .iter()
        .filter(|(k, _)| k.as_str() != "default")
        .map(|(k, v)| (k.clone(), v))
        .collect::<Vec<_>>();

    ConfigData {
        default_section: cfg.get("default"),
        crate_sections,
    }
}

// ================= path helpers =================

fn resolve_log_path(file: &str, log_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        log_dir.join(p)
    }
}

/// Opens a rotating writer, creating parent directories. Existing content is
/// appended to.
fn create_rotating_writer_at_path(
    log_path: &Path,
    section: &Section,
) -> Result<RotWriter, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let max_bytes = section.max_size_mb.unwrap_or(100) as usize * 1024 * 1024;
    let age = chrono::Duration::days(section.max_age_days.unwrap_or(1) as i64);
    let limit = if let Some(n) = section.max_backups {
        FileLimit::MaxFiles(n)
    } else {
        FileLimit::Age(age)
    };

    let rot = FileRotate::new(
        log_path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );

    Ok(RotWriter(Arc::new(Mutex::new(rot))))
}

/// Empties the log file `file` names under `log_dir`, creating it if missing.
///
/// Rotated backups are left alone.
pub fn truncate_log_file(file: &str, log_dir: &Path) -> std::io::Result<PathBuf> {
    let log_path = resolve_log_path(file, log_dir);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::File::create(&log_path)?;
    Ok(log_path)
}

// ================= public init =================

/// Installs the global subscriber: console on stderr (never stdout, which
/// carries worker responses) plus optional JSON files under `log_dir`.
///
/// `RUST_LOG`, when set, caps every sink.
pub fn init_logging(cfg: &LoggingConfig, log_dir: &Path, format: ConsoleFormat) -> LoggingGuard {
    // Bridge `log` → `tracing` *before* installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let data = extract_config_data(cfg);

    if data.crate_sections.is_empty() && data.default_section.is_none() {
        init_minimal(format);
        return LoggingGuard { _console: None };
    }

    let file_router = build_file_router(&data, log_dir);

    let console_targets = build_targets(&data, SinkKind::Console);
    let file_targets = build_targets(
        &data,
        SinkKind::File {
            has_default_file: file_router.default.is_some(),
        },
    );

    install_subscriber(console_targets, file_targets, file_router, format)
}

// ================= generic targets builder =================

use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;

enum SinkKind {
    Console,
    File { has_default_file: bool },
}

fn build_targets(config: &ConfigData, kind: SinkKind) -> Targets {
    match kind {
        SinkKind::Console => {
            let default_level = config
                .default_section
                .and_then(|s| parse_tracing_level(s.console_level.as_str()))
                .map(LevelFilter::from_level)
                .unwrap_or(LevelFilter::INFO);

            let mut targets = Targets::new().with_default(default_level);
            for (crate_name, section) in &config.crate_sections {
                if let Some(level) =
                    parse_tracing_level(section.console_level.as_str()).map(LevelFilter::from_level)
                {
                    targets = targets.with_target(crate_name.clone(), level);
                }
            }
            targets
        }

        SinkKind::File { has_default_file } => {
            let default_level = config
                .default_section
                .and_then(|s| parse_tracing_level(s.file_level.as_str()))
                .map(LevelFilter::from_level)
                .unwrap_or(if has_default_file {
                    LevelFilter::INFO
                } else {
                    LevelFilter::OFF
                });

            let mut targets = Targets::new().with_default(default_level);

            // per-crate rules: file sink is "active" only when path is present
            for (crate_name, section) in &config.crate_sections {
                if section.file.trim().is_empty() {
                    continue;
                }
                if let Some(level) =
                    parse_tracing_level(section.file_level.as_str()).map(LevelFilter::from_level)
                {
                    targets = targets.with_target(crate_name.clone(), level);
                }
            }
            targets
        }
    }
}

// ================= building routers =================

fn build_file_router(config: &ConfigData, log_dir: &Path) -> MultiFileRouter {
    let mut router = MultiFileRouter {
        default: None,
        by_prefix: HashMap::new(),
    };

    if let Some(section) = config.default_section {
        router.default = create_file_writer("default", section, log_dir);
    }

    for (crate_name, section) in &config.crate_sections {
        if let Some(writer) = create_file_writer(crate_name, section, log_dir) {
            router.by_prefix.insert(crate_name.clone(), writer);
        }
    }

    router
}

fn create_file_writer(subsystem: &str, section: &Section, log_dir: &Path) -> Option<RotWriter> {
    if section.file.trim().is_empty() {
        return None;
    }

    let log_path = resolve_log_path(&section.file, log_dir);
    match create_rotating_writer_at_path(&log_path, section) {
        Ok(writer) => Some(writer),
        Err(e) => {
            eprintln!(
                "Failed to init log file for subsystem '{}': {} ({})",
                subsystem,
                log_path.to_string_lossy(),
                e
            );
            None
        }
    }
}

// ================= registry & layers =================

fn install_subscriber(
    console_targets: Targets,
    file_targets: Targets,
    file_router: MultiFileRouter,
    format: ConsoleFormat,
) -> LoggingGuard {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

    let env: Option<EnvFilter> = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());

    let console_layer = match format {
        ConsoleFormat::Pretty => fmt::layer()
            .with_writer(nb_stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(console_targets)
            .boxed(),
        ConsoleFormat::Json => fmt::layer()
            .json()
            .with_writer(nb_stderr)
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_filter(console_targets)
            .boxed(),
    };

    let file_layer_opt = if !file_router.is_empty() {
        Some(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(file_router)
                .with_filter(file_targets),
        )
    } else {
        None
    };

    let subscriber = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer_opt);

    let _ = subscriber.try_init();

    LoggingGuard {
        _console: Some(guard),
    }
}

fn init_minimal(format: ConsoleFormat) {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

    let env = EnvFilter::try_from_default_env().ok();

    let fmt_layer = match format {
        ConsoleFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .boxed(),
        ConsoleFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .boxed(),
    };

    let _ = Registry::default().with(env).with(fmt_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.to_string(),
            file: file.to_string(),
            file_level: file_level.to_string(),
            max_age_days: None,
            max_backups: Some(1),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn crate_prefix_matching() {
        assert!(matches_crate_prefix("buildkit_runtime", "buildkit_runtime"));
        assert!(matches_crate_prefix(
            "buildkit_runtime::session",
            "buildkit_runtime"
        ));
        assert!(!matches_crate_prefix("buildkit_runtimex", "buildkit_runtime"));
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_tracing_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_tracing_level("off"), None);
        assert_eq!(parse_tracing_level("bogus"), Some(Level::INFO));
    }

    #[test]
    fn console_format_parsing() {
        assert_eq!("console".parse::<ConsoleFormat>(), Ok(ConsoleFormat::Pretty));
        assert_eq!("JSON".parse::<ConsoleFormat>(), Ok(ConsoleFormat::Json));
        assert!("xml".parse::<ConsoleFormat>().is_err());
    }

    #[test]
    fn file_router_resolves_relative_to_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = LoggingConfig::new();
        cfg.insert(
            "default".to_string(),
            section("error", "please-buildkit-worker.log", "info"),
        );
        cfg.insert(
            "buildkit_runtime::session".to_string(),
            section("info", "session.log", "debug"),
        );

        let data = extract_config_data(&cfg);
        let router = build_file_router(&data, tmp.path());
        assert!(router.default.is_some());
        assert!(router
            .resolve_for("buildkit_runtime::session::handler")
            .is_some());
        assert!(!router.is_empty());
    }

    #[test]
    fn file_sink_is_off_without_default_file() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".to_string(), section("info", "", ""));
        let data = extract_config_data(&cfg);
        let router = build_file_router(&data, Path::new("/nonexistent"));
        assert!(router.is_empty());
    }

    #[test]
    fn truncating_empties_existing_log() {
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("worker.log");
        std::fs::write(&existing, "previous run\n").unwrap();

        let path = truncate_log_file("worker.log", tmp.path()).unwrap();
        assert_eq!(path, existing);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "");

        let nested = truncate_log_file("nested/fresh.log", tmp.path()).unwrap();
        assert!(nested.is_file());
    }
}
