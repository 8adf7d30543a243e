//! Push an image tarball to the tags it was built with

use anyhow::{Context, Result};
use buildkit_image::{load_repo_tags, translate_tags, Pusher};
use clap::Args;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Targets may rewrite where the image goes:
///
///  - `index.docker.io/foo/bar:other-tag` pushes to exactly that reference;
///  - `index.docker.io/foo/bar:` pushes to that repository with the image's tags;
///  - `:other-tag` pushes to the image's repositories with that tag;
///  - `localhost:5000` pushes to that registry with the image's repositories and tags.
#[derive(Args, Debug, Clone)]
pub struct PushArgs {
    #[arg(long = "crane_tool")]
    pub crane_tool: String,

    #[arg(long = "img_tar_path")]
    pub img_tar_path: PathBuf,

    #[arg(long = "fqn_tags_path")]
    pub fqn_tags_path: PathBuf,

    /// Push target overrides
    pub targets: Vec<String>,
}

pub async fn run(args: &PushArgs, cancel: &CancellationToken) -> Result<()> {
    let image_tags = load_repo_tags(&args.fqn_tags_path).context("could not load image tags")?;
    let tags = translate_tags(&image_tags, &args.targets);
    tracing::debug!(tags = ?tags, "resolved push targets");

    Pusher::new(args.crane_tool.clone())
        .push_tar(&args.img_tar_path, &tags, cancel)
        .await?;
    Ok(())
}
