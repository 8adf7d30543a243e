//! Per-request build handling

use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::protocol::BuildRequest;
use crate::backend::BackendAddress;
use crate::process::{BuildctlBuild, InvocationError, SubprocessFailure};

pub const IMAGE_OUT_OPTION: &str = "--image_out";
pub const FQN_TAGS_FILE_OPTION: &str = "--fqn_tags_file";
pub const DOCKERFILE_OPTION: &str = "--dockerfile";

/// Directory under the request's temp dir holding the build description.
const DOCKERFILE_DIR: &str = "dockerfile";

/// Request-level failures. These become a `success=false` response and never
/// end the session.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("could not get option '{name}' from: {available:?}")]
    MissingOption { name: String, available: Vec<String> },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    BuildFailure(#[from] SubprocessFailure),

    #[error("failed to execute '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build was cancelled")]
    Cancelled,
}

impl From<InvocationError> for RequestError {
    fn from(e: InvocationError) -> Self {
        match e {
            InvocationError::Spawn { program, source } => RequestError::Launch { program, source },
            InvocationError::Failed(failure) => RequestError::BuildFailure(failure),
            InvocationError::Cancelled { .. } => RequestError::Cancelled,
        }
    }
}

fn io_error(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> RequestError {
    let context = context.into();
    move |source| RequestError::Io { context, source }
}

/// Handles one decoded request
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<(), RequestError>;
}

/// Builds the request's image with `buildctl` against the active backend
#[derive(Debug, Clone)]
pub struct BuildHandler {
    buildctl: String,
    address: BackendAddress,
}

impl BuildHandler {
    pub fn new(buildctl: impl Into<String>, address: BackendAddress) -> Self {
        Self {
            buildctl: buildctl.into(),
            address,
        }
    }
}

/// Non-empty lines of a tags file.
pub fn read_tags(path: &Path) -> Result<Vec<String>, RequestError> {
    let contents = std::fs::read_to_string(path)
        .map_err(io_error(format!("could not read '{}'", path.display())))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Move the build description to `<temp_dir>/dockerfile/Dockerfile`.
///
/// Returns the directory to pass as the dockerfile local. A failed move is
/// logged only; Please may reuse a temp dir where the file is already in place.
pub fn stage_dockerfile(temp_dir: &Path, dockerfile: &str) -> Result<PathBuf, RequestError> {
    let (dir, moved) = move_dockerfile(temp_dir, dockerfile)?;
    if let Err(e) = moved {
        tracing::warn!(dockerfile = %dockerfile, error = %e, "could not move dockerfile");
    }
    Ok(dir)
}

/// Like [`stage_dockerfile`] but a failed move is an error.
pub fn stage_dockerfile_strict(temp_dir: &Path, dockerfile: &str) -> Result<PathBuf, RequestError> {
    let (dir, moved) = move_dockerfile(temp_dir, dockerfile)?;
    moved.map_err(io_error(format!(
        "could not move dockerfile '{}'",
        temp_dir.join(dockerfile).display()
    )))?;
    Ok(dir)
}

fn move_dockerfile(
    temp_dir: &Path,
    dockerfile: &str,
) -> Result<(PathBuf, std::io::Result<()>), RequestError> {
    let dir = temp_dir.join(DOCKERFILE_DIR);
    std::fs::create_dir_all(&dir).map_err(io_error("could not create 'dockerfile' dir"))?;
    let moved = std::fs::rename(temp_dir.join(dockerfile), dir.join("Dockerfile"));
    Ok((dir, moved))
}

#[async_trait]
impl RequestHandler for BuildHandler {
    async fn handle(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<(), RequestError> {
        let temp_dir = Path::new(&request.temp_dir);

        let image_out = temp_dir.join(request.option(IMAGE_OUT_OPTION)?);
        let out = File::create(&image_out)
            .map_err(io_error(format!("could not open '{}'", image_out.display())))?;

        let tags = read_tags(&temp_dir.join(request.option(FQN_TAGS_FILE_OPTION)?))?;
        let dockerfile_dir = stage_dockerfile(temp_dir, &request.option(DOCKERFILE_OPTION)?)?;

        let build = BuildctlBuild {
            buildctl: &self.buildctl,
            address: &self.address,
            context_dir: temp_dir,
            dockerfile_dir: &dockerfile_dir,
            tags: &tags,
            dest: None,
            extra_args: &[],
        };

        tracing::debug!(tags = ?tags, "invoking buildctl");
        build.invocation().stdout_to(out).run(cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(temp_dir: &Path, opts: &[&str]) -> BuildRequest {
        BuildRequest {
            rule: "//img:img".to_string(),
            labels: Vec::new(),
            temp_dir: temp_dir.to_string_lossy().into_owned(),
            sources: Vec::new(),
            options: opts.iter().map(|s| s.to_string()).collect(),
            test: false,
        }
    }

    fn fixture(dir: &Path) {
        std::fs::write(dir.join("tags"), "example.com/img:abc\n\nexample.com/img:latest\n").unwrap();
        std::fs::write(dir.join("Dockerfile.img"), "FROM scratch\n").unwrap();
    }

    #[test]
    fn tags_skip_blank_lines() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        assert_eq!(
            read_tags(&tmp.path().join("tags")).unwrap(),
            vec!["example.com/img:abc", "example.com/img:latest"]
        );
    }

    #[test]
    fn dockerfile_is_staged() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let dir = stage_dockerfile(tmp.path(), "Dockerfile.img").unwrap();
        assert!(dir.join("Dockerfile").exists());
        assert!(!tmp.path().join("Dockerfile.img").exists());

        // Already moved: logged, not fatal.
        assert!(stage_dockerfile(tmp.path(), "Dockerfile.img").is_ok());
    }

    #[test]
    fn strict_staging_rejects_missing_dockerfile() {
        let tmp = tempfile::tempdir().unwrap();
        let err = stage_dockerfile_strict(tmp.path(), "Dockerfile.missing").unwrap_err();
        match err {
            RequestError::Io { context, source } => {
                assert!(context.contains("Dockerfile.missing"), "{context}");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected io error, got {other:?}"),
        }

        fixture(tmp.path());
        let dir = stage_dockerfile_strict(tmp.path(), "Dockerfile.img").unwrap();
        assert!(dir.join("Dockerfile").exists());
    }

    #[tokio::test]
    async fn successful_build_creates_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let handler = BuildHandler::new("true", BackendAddress::new(1234));
        let req = request(
            tmp.path(),
            &["--image_out=\"img.tar\"", "--fqn_tags_file=tags", "--dockerfile=Dockerfile.img"],
        );

        handler.handle(&req, &CancellationToken::new()).await.unwrap();
        assert!(tmp.path().join("img.tar").exists());
        assert!(tmp.path().join("dockerfile/Dockerfile").exists());
    }

    #[tokio::test]
    async fn missing_image_out_is_named() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let handler = BuildHandler::new("true", BackendAddress::new(1234));
        let req = request(tmp.path(), &["--fqn_tags_file=tags", "--dockerfile=Dockerfile.img"]);

        let err = handler.handle(&req, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RequestError::MissingOption { ref name, .. } if name == "--image_out"));
    }

    #[tokio::test]
    async fn failing_build_carries_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let handler = BuildHandler::new("false", BackendAddress::new(1234));
        let req = request(
            tmp.path(),
            &["--image_out=img.tar", "--fqn_tags_file=tags", "--dockerfile=Dockerfile.img"],
        );

        let err = handler.handle(&req, &CancellationToken::new()).await.unwrap_err();
        match err {
            RequestError::BuildFailure(failure) => {
                assert_eq!(failure.code, Some(1));
                assert!(failure.command.starts_with("false build --frontend=dockerfile.v0"));
            }
            other => panic!("expected build failure, got {other:?}"),
        }
    }
}
