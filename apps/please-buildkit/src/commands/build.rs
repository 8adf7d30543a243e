//! One-shot image build outside the worker protocol

use anyhow::{Context, Result};
use buildkit_bootstrap::AppConfig;
use buildkit_runtime::process::BuildctlBuild;
use buildkit_runtime::session::{read_tags, stage_dockerfile_strict};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Where to write the image tarball
    #[arg(long = "image_out")]
    pub image_out: PathBuf,

    /// File listing the fully-qualified tags, one per line
    #[arg(long = "fqn_tags_file")]
    pub fqn_tags_file: PathBuf,

    /// Build description, relative to the build directory
    #[arg(long = "dockerfile")]
    pub dockerfile: String,
}

/// Extra `buildctl build` flags for direct builds.
fn direct_build_flags(build_dir: &Path) -> Vec<String> {
    vec![
        "--no-cache".to_string(),
        "--trace".to_string(),
        build_dir.join("buildctl.trace").display().to_string(),
    ]
}

pub async fn run(
    config: &AppConfig,
    log_dir: &Path,
    args: &BuildArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let build_dir = std::env::temp_dir();

    let tags = read_tags(&args.fqn_tags_file)?;
    let dockerfile_dir = stage_dockerfile_strict(&build_dir, &args.dockerfile)?;

    let backend = super::backend_lifecycle(config, log_dir)
        .start(cancel)
        .await
        .context("could not start buildkitd")?;

    let extra_args = direct_build_flags(&build_dir);
    let build = BuildctlBuild {
        buildctl: &config.buildkit.buildctl_binary,
        address: backend.address(),
        context_dir: &build_dir,
        dockerfile_dir: &dockerfile_dir,
        tags: &tags,
        dest: Some(&args.image_out),
        extra_args: &extra_args,
    };
    let outcome = build.invocation().run(cancel).await;
    backend.shutdown().await;

    outcome?;
    tracing::info!(out = %args.image_out.display(), "built image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildkit_runtime::BackendAddress;

    #[test]
    fn direct_build_writes_to_dest() {
        let dir = Path::new("/tmp/build");
        let tags = vec!["example.com/app:abc".to_string()];
        let extra_args = direct_build_flags(dir);
        let build = BuildctlBuild {
            buildctl: "buildctl",
            address: &BackendAddress::new(4321),
            context_dir: dir,
            dockerfile_dir: &dir.join("dockerfile"),
            tags: &tags,
            dest: Some(Path::new("out/app.tar")),
            extra_args: &extra_args,
        };

        let line = build.invocation().command_line();
        assert!(line.starts_with("buildctl build --frontend=dockerfile.v0 --no-cache --trace /tmp/build/buildctl.trace"));
        assert!(line.ends_with("--output type=docker,\"name=example.com/app:abc\",dest=out/app.tar"));
    }

    #[tokio::test]
    async fn missing_dockerfile_fails_before_starting_buildkitd() {
        let tmp = tempfile::tempdir().unwrap();
        let tags = tmp.path().join("tags");
        std::fs::write(&tags, "example.com/app:abc\n").unwrap();
        let args = BuildArgs {
            image_out: tmp.path().join("app.tar"),
            fqn_tags_file: tags,
            dockerfile: format!("missing-{}.Dockerfile", std::process::id()),
        };
        // An empty provider order would fail selection if staging were skipped.
        let mut config = AppConfig::default();
        config.providers.order.clear();

        let err = run(&config, tmp.path(), &args, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("could not move dockerfile"), "{err:#}");
    }
}
