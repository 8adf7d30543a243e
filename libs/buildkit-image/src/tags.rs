//! Tag selection and translation of user-supplied push targets

use anyhow::Context;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use crate::repotag::RepoTag;

/// Tag prefix of content-addressed tags.
pub const CONTENT_HASH_TAG_PREFIX: &str = "srcsha256-";

const LATEST_TAG: &str = "latest";

/// Pick the most specific tag: a content-hash tag, else the first tag that
/// is not `latest`, else the first tag.
pub fn most_granular_tag<S: AsRef<str>>(tags: &[S]) -> Option<&str> {
    let mut non_latest: Option<&str> = None;
    for candidate in tags.iter().map(AsRef::as_ref) {
        let tag = RepoTag::new(candidate).tag();
        if tag.starts_with(CONTENT_HASH_TAG_PREFIX) {
            return Some(candidate);
        }
        if tag != LATEST_TAG && non_latest.is_none() {
            non_latest = Some(candidate);
        }
    }
    non_latest.or_else(|| tags.first().map(AsRef::as_ref))
}

fn repo_and_tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^.+:?.+/.+:.+").ok()).as_ref()
}

fn registry_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^:/]+:?[^:]*$").ok()).as_ref()
}

/// Resolve user-supplied push targets against the image's own tags.
///
/// - `:tag` pushes every image repository with the user's tag;
/// - `registry/repo:tag` is used verbatim;
/// - `registry/repo:` pushes the user's repository with every image tag;
/// - `registry[:port]` pushes every image path and tag to that registry.
///
/// With no overrides the image tags are returned unchanged. Otherwise the
/// result is de-duplicated and sorted.
pub fn translate_tags<S: AsRef<str>, U: AsRef<str>>(image_tags: &[S], overrides: &[U]) -> Vec<String> {
    if overrides.is_empty() {
        return image_tags.iter().map(|t| t.as_ref().to_string()).collect();
    }

    let parsed: Vec<RepoTag<'_>> = image_tags.iter().map(|t| RepoTag::new(t.as_ref())).collect();
    let mut translated = BTreeSet::new();

    for user in overrides.iter().map(AsRef::as_ref) {
        if user.is_empty() {
            continue;
        }

        if user.starts_with(':') {
            for image in &parsed {
                translated.insert(format!("{}{user}", image.repository()));
            }
        } else if repo_and_tag_pattern().is_some_and(|re| re.is_match(user)) {
            translated.insert(user.to_string());
        } else if user.ends_with(':') {
            for image in &parsed {
                translated.insert(format!("{user}{}", image.tag()));
            }
        } else if registry_pattern().is_some_and(|re| re.is_match(user)) {
            for path in parsed.iter().filter_map(RepoTag::path) {
                for image in &parsed {
                    translated.insert(format!("{user}/{path}:{}", image.tag()));
                }
            }
        } else {
            tracing::warn!(target = %user, "ignoring unrecognised push target");
        }
    }

    translated.into_iter().collect()
}

/// Non-empty lines of a fully-qualified tags file.
pub fn load_repo_tags(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not read '{}'", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
