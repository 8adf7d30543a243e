//! Rewriting image references inside arbitrary text

use regex::{NoExpand, Regex};
use thiserror::Error;

use crate::repotag::RepoTag;

/// Characters that may follow an untagged repository in a reference.
const REFERENCE_SUFFIX: &str = r"[a-z0-9:@.\-_]*";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplaceError {
    #[error("could not replace image '{reference}': no replacements made")]
    NoReplacementsMade { reference: String },

    #[error("invalid image reference pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{}", describe_aliases(.failures))]
    NoAliasReplaced { failures: Vec<(String, ReplaceError)> },
}

fn describe_aliases(failures: &[(String, ReplaceError)]) -> String {
    failures
        .iter()
        .map(|(alias, e)| format!("replacing alias '{alias}' encountered error: {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ReplaceError {
    /// Whether nothing matched, directly or for every alias.
    pub fn is_no_replacements(&self) -> bool {
        match self {
            ReplaceError::NoReplacementsMade { .. } => true,
            ReplaceError::NoAliasReplaced { failures } => {
                failures.iter().all(|(_, e)| e.is_no_replacements())
            }
            ReplaceError::InvalidPattern { .. } => false,
        }
    }
}

/// Replace `old` with `new` in `content`.
///
/// An untagged `old` also swallows whatever tag or digest follows it; a
/// tagged `old` is replaced literally. Zero matches is an error.
pub fn replace_references(content: &str, old: &str, new: &str) -> Result<String, ReplaceError> {
    if RepoTag::new(old).tag().is_empty() {
        let pattern = format!("{}{REFERENCE_SUFFIX}", regex::escape(old));
        let re = Regex::new(&pattern).map_err(|e| ReplaceError::InvalidPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        if !re.is_match(content) {
            return Err(ReplaceError::NoReplacementsMade {
                reference: old.to_string(),
            });
        }
        return Ok(re.replace_all(content, NoExpand(new)).into_owned());
    }

    if !content.contains(old) {
        return Err(ReplaceError::NoReplacementsMade {
            reference: old.to_string(),
        });
    }
    Ok(content.replace(old, new))
}

/// Replace every alias with `new`. Succeeds if at least one alias matched.
pub fn replace_references_for_aliases<S: AsRef<str>>(
    content: &str,
    new: &str,
    aliases: &[S],
) -> Result<String, ReplaceError> {
    let mut current = content.to_string();
    let mut replaced = false;
    let mut failures = Vec::new();

    for alias in aliases.iter().map(AsRef::as_ref) {
        match replace_references(&current, alias, new) {
            Ok(next) => {
                current = next;
                replaced = true;
            }
            Err(e) => failures.push((alias.to_string(), e)),
        }
    }

    if replaced {
        for (alias, e) in &failures {
            tracing::debug!(alias = %alias, error = %e, "alias not replaced");
        }
        Ok(current)
    } else {
        Err(ReplaceError::NoAliasReplaced { failures })
    }
}
