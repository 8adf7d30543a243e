use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Errors for resolving the log directory
#[derive(Debug, thiserror::Error)]
pub enum LogDirError {
    #[error("HOME environment variable is not set")]
    HomeMissing,
    #[error("log_dir must not be empty")]
    Empty,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalize the configured log directory into an absolute path.
///
/// Rules:
/// - a leading `~` expands to `$HOME`;
/// - relative paths are anchored at the current working directory, which is the
///   repository root when the worker is launched by Please (`plz-out/log`);
/// - absolute paths are kept as-is.
///
/// If `create` is true, the directory is created if missing.
pub fn resolve_log_dir(raw: &str, create: bool) -> Result<PathBuf, LogDirError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(LogDirError::Empty);
    }

    let expanded = if let Some(stripped) = raw.strip_prefix("~/") {
        let home = env::var("HOME").map_err(|_| LogDirError::HomeMissing)?;
        Path::new(&home).join(stripped)
    } else if raw == "~" {
        let home = env::var("HOME").map_err(|_| LogDirError::HomeMissing)?;
        PathBuf::from(home)
    } else {
        PathBuf::from(raw)
    };

    let path = if expanded.is_absolute() {
        expanded
    } else {
        env::current_dir()?.join(expanded)
    };

    if create {
        fs::create_dir_all(&path)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn relative_dir_is_anchored_at_cwd() {
        let resolved = resolve_log_dir("plz-out/log", false).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved, env::current_dir().unwrap().join("plz-out/log"));
    }

    #[test]
    fn absolute_dir_is_kept_and_created() {
        let tmp = tempdir().unwrap();
        let target = tmp.path().join("nested/logs");
        let resolved = resolve_log_dir(target.to_str().unwrap(), true).unwrap();
        assert_eq!(resolved, target);
        assert!(target.is_dir());
    }

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn tilde_expands_to_home() {
        let home = env::var("HOME").expect("HOME must be set for this test");
        let resolved = resolve_log_dir("~/pbk-logs", false).unwrap();
        assert_eq!(resolved, Path::new(&home).join("pbk-logs"));
    }

    #[test]
    fn empty_dir_is_rejected() {
        assert!(matches!(resolve_log_dir("  ", false), Err(LogDirError::Empty)));
    }
}
