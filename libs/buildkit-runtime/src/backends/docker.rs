//! Docker with a privileged buildkitd container

use anyhow::Context;

use crate::process::Invocation;

pub(super) const RUN_FLAGS: &[&str] = &["--privileged"];
pub(super) const DAEMON_FLAGS: &[&str] = &[];

/// The daemon must answer `docker ps`.
pub(super) async fn probe(binary: &str) -> anyhow::Result<()> {
    Invocation::new(binary)
        .arg("ps")
        .output()
        .await
        .with_context(|| format!("'{binary}' daemon is not reachable"))?;
    Ok(())
}
