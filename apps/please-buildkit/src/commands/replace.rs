//! Rewrite image references in a file to the image's most specific tag

use anyhow::{Context, Result};
use buildkit_image::{load_repo_tags, most_granular_tag, replace_references_for_aliases, translate_tags};
use clap::Args;
use std::path::PathBuf;

/// Replacement prefers a `srcsha256-` tag, then any non-latest tag, then
/// `latest`. An optional target rewrites the reference the same way `push`
/// does.
#[derive(Args, Debug, Clone)]
pub struct ReplaceArgs {
    #[arg(long = "file_path")]
    pub file_path: PathBuf,

    /// References to replace; repeat the flag or separate with commas
    #[arg(long = "aliases", value_delimiter = ',')]
    pub aliases: Vec<String>,

    #[arg(long = "fqn_tags_path")]
    pub fqn_tags_path: PathBuf,

    /// Reference override
    pub target: Option<String>,
}

pub fn run(args: &ReplaceArgs) -> Result<()> {
    let image_tags = load_repo_tags(&args.fqn_tags_path).context("could not load image tags")?;
    let tags = translate_tags(&image_tags, args.target.as_slice());
    let Some(replacement) = most_granular_tag(&tags) else {
        anyhow::bail!("no tags found in '{}'", args.fqn_tags_path.display());
    };

    if args.aliases.is_empty() {
        tracing::warn!(file = %args.file_path.display(), "no aliases given, nothing to replace");
        return Ok(());
    }

    let path = &args.file_path;
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not read '{}'", path.display()))?;
    let permissions = std::fs::metadata(path)
        .with_context(|| format!("could not stat '{}'", path.display()))?
        .permissions();

    let replaced = replace_references_for_aliases(&contents, replacement, &args.aliases)
        .with_context(|| format!("could not replace references in '{}'", path.display()))?;

    std::fs::write(path, replaced).with_context(|| format!("could not write '{}'", path.display()))?;
    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("could not restore permissions of '{}'", path.display()))?;

    tracing::info!(file = %path.display(), replacement = %replacement, "replaced image references");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(dir: &Path, manifest: &str) -> ReplaceArgs {
        std::fs::write(
            dir.join("fqn_tags"),
            "example.com/app:latest\nexample.com/app:srcsha256-abc\n",
        )
        .unwrap();
        std::fs::write(dir.join("deploy.yaml"), manifest).unwrap();
        ReplaceArgs {
            file_path: dir.join("deploy.yaml"),
            aliases: vec!["app".to_string()],
            fqn_tags_path: dir.join("fqn_tags"),
            target: None,
        }
    }

    #[test]
    fn alias_becomes_most_granular_tag() {
        let tmp = tempfile::tempdir().unwrap();
        let args = fixture(tmp.path(), "image: app:dev\n");

        run(&args).unwrap();

        let out = std::fs::read_to_string(&args.file_path).unwrap();
        assert_eq!(out, "image: example.com/app:srcsha256-abc\n");
    }

    #[test]
    fn target_override_is_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let mut args = fixture(tmp.path(), "image: app\n");
        args.target = Some("localhost:5000".to_string());

        run(&args).unwrap();

        let out = std::fs::read_to_string(&args.file_path).unwrap();
        assert_eq!(out, "image: localhost:5000/app:srcsha256-abc\n");
    }

    #[cfg(unix)]
    #[test]
    fn file_mode_is_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let args = fixture(tmp.path(), "image: app\n");
        std::fs::set_permissions(&args.file_path, std::fs::Permissions::from_mode(0o750)).unwrap();

        run(&args).unwrap();

        let mode = std::fs::metadata(&args.file_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn unmatched_aliases_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let mut args = fixture(tmp.path(), "image: other\n");
        args.aliases = vec!["missing".to_string()];

        assert!(run(&args).is_err());
        let out = std::fs::read_to_string(&args.file_path).unwrap();
        assert_eq!(out, "image: other\n");
    }
}
