//! Centralized external command execution.
//!
//! Every subprocess the runtime launches goes through [`Invocation`], which
//! guarantees:
//! - stdin is detached (the worker's stdin carries the request stream);
//! - stderr is always captured and attached to failures;
//! - the child is killed when the invocation is cancelled or dropped.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::backend::BackendAddress;

/// Environment variable buildctl reads the daemon address from.
pub const BUILDKIT_HOST_ENV: &str = "BUILDKIT_HOST";

/// A non-zero exit of an external tool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not run '{command}': {}\n{stderr}", describe_exit(.code))]
pub struct SubprocessFailure {
    pub command: String,
    /// Exit code, or None if terminated by signal.
    pub code: Option<i32>,
    pub stderr: String,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to execute '{program}'. Is it installed?")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Failed(#[from] SubprocessFailure),
    #[error("'{command}' was cancelled")]
    Cancelled { command: String },
}

impl InvocationError {
    /// Captured diagnostic text, if the tool got far enough to produce any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            InvocationError::Failed(f) => Some(f.stderr.as_str()),
            _ => None,
        }
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    pub status: ExitStatus,
    /// Captured stdout; empty when stdout was redirected to a file.
    pub stdout: String,
    pub stderr: String,
}

impl InvocationOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Builder for one external command.
pub struct Invocation {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    stdout: Option<File>,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.command_line())
            .field("envs", &self.envs)
            .field("current_dir", &self.current_dir)
            .finish()
    }
}

impl Invocation {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Adds a variable on top of the inherited environment.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    /// Points buildctl at the given backend.
    pub fn buildkit_host(self, address: &BackendAddress) -> Self {
        self.env(BUILDKIT_HOST_ENV, address.connect_url())
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Send stdout into `file` instead of capturing it.
    pub fn stdout_to(mut self, file: File) -> Self {
        self.stdout = Some(file);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Program and arguments joined for diagnostics.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run to completion, killing the child if `cancel` fires first.
    pub async fn run(self, cancel: &CancellationToken) -> Result<InvocationOutput, InvocationError> {
        let command_line = self.command_line();
        let mut cmd = self.command();
        cmd.stderr(Stdio::piped());
        match self.stdout {
            Some(file) => cmd.stdout(Stdio::from(file)),
            None => cmd.stdout(Stdio::piped()),
        };

        tracing::debug!(command = %command_line, "running");

        let child = cmd.spawn().map_err(|source| InvocationError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Dropping the wait future drops the child, and kill_on_drop reaps it.
        let output = tokio::select! {
            res = child.wait_with_output() => res.map_err(|source| InvocationError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                return Err(InvocationError::Cancelled { command: command_line });
            }
        };

        let result = InvocationOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.status.success() {
            return Err(SubprocessFailure {
                command: command_line,
                code: result.status.code(),
                stderr: result.stderr.trim().to_string(),
            }
            .into());
        }

        Ok(result)
    }

    /// Run to completion without an external cancellation signal.
    pub async fn output(self) -> Result<InvocationOutput, InvocationError> {
        self.run(&CancellationToken::new()).await
    }

    /// Start a long-running child with stdout and stderr appended to `log`.
    ///
    /// The returned child is killed when dropped.
    pub fn spawn_logging_to(self, log: File) -> Result<Child, InvocationError> {
        let stderr = log.try_clone().map_err(|source| InvocationError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let mut cmd = self.command();
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(stderr));
        cmd.spawn().map_err(|source| InvocationError::Spawn {
            program: self.program.clone(),
            source,
        })
    }
}

/// `buildctl build` against a running backend.
#[derive(Debug, Clone)]
pub struct BuildctlBuild<'a> {
    pub buildctl: &'a str,
    pub address: &'a BackendAddress,
    pub context_dir: &'a Path,
    pub dockerfile_dir: &'a Path,
    pub tags: &'a [String],
    /// Write the image tar here instead of to stdout.
    pub dest: Option<&'a Path>,
    pub extra_args: &'a [String],
}

impl BuildctlBuild<'_> {
    /// `type=docker,"name=a,b"[,dest=path]`
    pub fn output_arg(&self) -> String {
        let mut out = format!("type=docker,\"name={}\"", self.tags.join(","));
        if let Some(dest) = self.dest {
            out.push_str(&format!(",dest={}", dest.display()));
        }
        out
    }

    pub fn invocation(&self) -> Invocation {
        Invocation::new(self.buildctl)
            .arg("build")
            .arg("--frontend=dockerfile.v0")
            .args(self.extra_args)
            .arg("--local")
            .arg(format!("context={}", self.context_dir.display()))
            .arg("--local")
            .arg(format!("dockerfile={}", self.dockerfile_dir.display()))
            .arg("--output")
            .arg(self.output_arg())
            .buildkit_host(self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_run_success_captures_stdout() {
        let out = Invocation::new("echo").arg("hello").output().await.unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout_trimmed(), "hello");
    }

    #[tokio::test]
    async fn test_failure_includes_stderr() {
        let err = Invocation::new("ls")
            .arg("/nonexistent_path_12345")
            .output()
            .await
            .unwrap_err();

        let stderr = err.stderr().expect("failure should carry stderr").to_string();
        assert!(!stderr.is_empty());
        let msg = err.to_string();
        assert!(msg.contains("could not run 'ls /nonexistent_path_12345'"));
        assert!(msg.contains(&stderr));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = Invocation::new("nonexistent_program_12345")
            .output()
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_env_is_injected() {
        let out = Invocation::new("sh")
            .args(["-c", "echo $BUILDKIT_HOST"])
            .buildkit_host(&BackendAddress::new(4321))
            .output()
            .await
            .unwrap();
        assert_eq!(out.stdout_trimmed(), "tcp://127.0.0.1:4321");
    }

    #[tokio::test]
    async fn test_stdin_is_detached() {
        // `cat` would block forever on an inherited terminal/pipe.
        let out = Invocation::new("cat").output().await.unwrap();
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_stdout_to_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.tar");
        let file = File::create(&path).unwrap();

        Invocation::new("echo")
            .arg("image-bytes")
            .stdout_to(file)
            .output()
            .await
            .unwrap();

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.trim(), "image-bytes");
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });

        let started = Instant::now();
        let err = Invocation::new("sleep")
            .arg("30")
            .run(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_buildctl_build_arguments() {
        let address = BackendAddress::new(1234);
        let tags = vec![
            "example.com/foo:bar".to_string(),
            "example.com/foo:latest".to_string(),
        ];
        let build = BuildctlBuild {
            buildctl: "buildctl",
            address: &address,
            context_dir: Path::new("/tmp/ctx"),
            dockerfile_dir: Path::new("/tmp/ctx/dockerfile"),
            tags: &tags,
            dest: None,
            extra_args: &[],
        };

        assert_eq!(
            build.invocation().command_line(),
            "buildctl build --frontend=dockerfile.v0 \
             --local context=/tmp/ctx --local dockerfile=/tmp/ctx/dockerfile \
             --output type=docker,\"name=example.com/foo:bar,example.com/foo:latest\""
        );

        let dest = PathBuf::from("/tmp/out/image.tar");
        let with_dest = BuildctlBuild {
            dest: Some(&dest),
            ..build
        };
        assert!(with_dest
            .output_arg()
            .ends_with(",dest=/tmp/out/image.tar"));
    }
}
