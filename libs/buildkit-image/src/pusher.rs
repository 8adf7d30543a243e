//! Pushing an image tarball to one or more tags with `crane`

use std::path::Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use buildkit_runtime::process::Invocation;

/// Every tag that failed to push, with the reason
#[derive(Debug, Error)]
#[error("{}", describe_failures(.failures))]
pub struct PushError {
    pub failures: Vec<(String, String)>,
}

fn describe_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(tag, reason)| format!("could not push image to '{tag}': {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct Pusher {
    crane: String,
}

impl Pusher {
    pub fn new(crane: impl Into<String>) -> Self {
        Self {
            crane: crane.into(),
        }
    }

    /// Push `tar` to every tag. All tags are attempted even after a failure.
    pub async fn push_tar<S: AsRef<str>>(
        &self,
        tar: &Path,
        tags: &[S],
        cancel: &CancellationToken,
    ) -> Result<(), PushError> {
        let mut failures = Vec::new();

        for tag in tags.iter().map(AsRef::as_ref) {
            let push = Invocation::new(&self.crane)
                .arg("push")
                .arg_path(tar)
                .arg(tag);

            match push.run(cancel).await {
                Ok(out) => {
                    tracing::info!(tag = %tag, digest = %out.stdout_trimmed(), "pushed image");
                }
                Err(e) => {
                    tracing::error!(tag = %tag, tar = %tar.display(), error = %e, "could not push image");
                    failures.push((tag.to_string(), e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PushError { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_tag_is_pushed() {
        let pusher = Pusher::new("true");
        pusher
            .push_tar(
                Path::new("/tmp/image.tar"),
                &["example.com/foo:a", "example.com/foo:b"],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failures_are_aggregated() {
        let pusher = Pusher::new("false");
        let err = pusher
            .push_tar(
                Path::new("/tmp/image.tar"),
                &["example.com/foo:a", "example.com/foo:b"],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.failures.len(), 2);
        let msg = err.to_string();
        assert!(msg.contains("could not push image to 'example.com/foo:a'"));
        assert!(msg.contains("could not push image to 'example.com/foo:b'"));
    }
}
