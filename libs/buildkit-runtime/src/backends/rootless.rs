//! Docker running the rootless buildkitd image without a process sandbox

use anyhow::{bail, Context};

use crate::process::Invocation;

pub(super) const RUN_FLAGS: &[&str] = &[
    "--security-opt",
    "seccomp=unconfined",
    "--security-opt",
    "apparmor=unconfined",
    "--security-opt",
    "systempaths=unconfined",
];
pub(super) const DAEMON_FLAGS: &[&str] = &["--oci-worker-no-process-sandbox"];

const SECURITY_OPTIONS_FORMAT: &str =
    r#"{{ range $opt := .SecurityOptions }}{{ $opt }}{{"\n"}}{{ end }}"#;
const DRIVER_STATUS_FORMAT: &str = r#"{{ range $opt := .DriverStatus }}{{ $opt }}{{"\n"}}{{ end }}"#;

pub(super) async fn probe(binary: &str) -> anyhow::Result<()> {
    Invocation::new(binary)
        .arg("ps")
        .output()
        .await
        .with_context(|| format!("'{binary}' daemon is not reachable"))?;

    let security = info(binary, SECURITY_OPTIONS_FORMAT)
        .await
        .context("could not get docker security options")?;
    check_security_options(&security)?;

    let driver = info(binary, DRIVER_STATUS_FORMAT)
        .await
        .context("could not get docker driver status")?;
    check_driver_status(&driver)
}

async fn info(binary: &str, format: &str) -> anyhow::Result<String> {
    let out = Invocation::new(binary)
        .args(["info", "--format", format])
        .output()
        .await?;
    Ok(out.stdout)
}

fn check_security_options(out: &str) -> anyhow::Result<()> {
    if out.contains("rootless") {
        bail!("cannot run rootless inside rootless (the engine is already rootless)");
    }
    Ok(())
}

fn check_driver_status(out: &str) -> anyhow::Result<()> {
    if !out.contains("userxattr true") {
        bail!("userxattr=true must be supported by the docker storage driver");
    }
    Ok(())
}
