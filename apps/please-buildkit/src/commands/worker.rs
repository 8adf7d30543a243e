//! Long-lived Please worker
//!
//! Please treats anything the worker prints on stdout as a response and on
//! stderr as an error, so logs go to a file and stderr only carries errors.

use anyhow::{Context, Result};
use buildkit_bootstrap::{default_logging_config, truncate_log_file, AppConfig};
use buildkit_runtime::{BuildHandler, Session};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const WORKER_LOG_FILE: &str = "please-buildkit-worker.log";

/// Point the default log section at the worker log file and quiet the console.
///
/// An explicitly configured file is kept; `-v` keeps its console level.
pub fn route_logs_to_file(config: &mut AppConfig, verbose: u8) {
    let logging = config.logging.get_or_insert_with(default_logging_config);
    if !logging.contains_key("default") {
        logging.extend(default_logging_config());
    }
    let Some(section) = logging.get_mut("default") else {
        return;
    };

    if verbose == 0 {
        section.console_level = "error".to_string();
    }
    if section.file.trim().is_empty() {
        section.file = WORKER_LOG_FILE.to_string();
        section.file_level = "info".to_string();
    }
}

/// Start every worker run with an empty default log file.
pub fn reset_log(config: &AppConfig, log_dir: &Path) -> Result<()> {
    let Some(section) = config.logging.as_ref().and_then(|l| l.get("default")) else {
        return Ok(());
    };
    if section.file.trim().is_empty() {
        return Ok(());
    }
    truncate_log_file(&section.file, log_dir)
        .with_context(|| format!("could not truncate worker log {}", section.file))?;
    Ok(())
}

pub async fn run(config: &AppConfig, log_dir: &Path, cancel: &CancellationToken) -> Result<()> {
    let lifecycle = super::backend_lifecycle(config, log_dir);
    let backend = lifecycle
        .start(cancel)
        .await
        .context("could not start buildkitd")?;

    let handler = Arc::new(BuildHandler::new(
        config.buildkit.buildctl_binary.clone(),
        *backend.address(),
    ));
    let session = Session::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        handler,
        super::session_options(config),
    );

    tracing::info!(address = %backend.address(), "started please worker");
    let served = session.run(cancel).await;
    backend.shutdown().await;

    let summary = served.context("please worker stopped")?;
    tracing::info!(
        accepted = summary.accepted,
        written = summary.written,
        "please worker has stopped"
    );
    Ok(())
}
