//! Container engine backend: runs buildkitd as a detached container

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{docker, podman, rootless, BackendProvider};
use crate::backend::{BackendAddress, BackendDescriptor, BackendHandle, BackendKind};
use crate::error::StartError;
use crate::process::{Invocation, InvocationError};

/// Diagnostics engines print when the published port cannot be bound.
const ADDRESS_IN_USE_MARKERS: &[&str] = &["address already in use", "port is already allocated"];

/// Per-engine settings resolved from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub binary: String,
    pub image: String,
    /// Containers are named `<name_prefix>-<port>`.
    pub name_prefix: String,
    /// File the container's log stream is tailed into. Truncated on start.
    pub log_path: PathBuf,
}

struct ContainerInstance {
    handle: BackendHandle,
    log_tail: Option<Child>,
}

/// Provider for docker, rootless docker and podman.
///
/// The variants share the container lifecycle and differ in their host probe
/// and the flags passed to `run` and to the daemon.
pub struct ContainerEngineProvider {
    kind: BackendKind,
    settings: EngineSettings,
    instances: Arc<RwLock<HashMap<String, ContainerInstance>>>,
}

impl ContainerEngineProvider {
    pub fn new(kind: BackendKind, settings: EngineSettings) -> Self {
        Self {
            kind,
            settings,
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn container_name(&self, address: &BackendAddress) -> String {
        format!("{}-{}", self.settings.name_prefix, address.port())
    }

    fn run_flags(&self) -> &'static [&'static str] {
        match self.kind {
            BackendKind::Docker => docker::RUN_FLAGS,
            BackendKind::RootlessDocker => rootless::RUN_FLAGS,
            BackendKind::Podman => podman::RUN_FLAGS,
        }
    }

    fn daemon_flags(&self) -> &'static [&'static str] {
        match self.kind {
            BackendKind::Docker => docker::DAEMON_FLAGS,
            BackendKind::RootlessDocker => rootless::DAEMON_FLAGS,
            BackendKind::Podman => podman::DAEMON_FLAGS,
        }
    }

    fn engine(&self) -> Invocation {
        Invocation::new(&self.settings.binary)
    }

    /// `run` invocation for a container named `name` listening on `address`.
    pub fn run_invocation(&self, name: &str, address: &BackendAddress) -> Invocation {
        let port = address.port();
        self.engine()
            .args(["run", "-d", "--rm", "--name", name])
            .args(self.run_flags())
            .arg("--publish")
            .arg(format!("{port}:{port}"))
            .arg(&self.settings.image)
            .arg("--addr")
            .arg(address.listen_url())
            .args(self.daemon_flags())
    }

    async fn remove_container(&self, name: &str) {
        if let Err(e) = self.engine().args(["rm", "-f", name]).output().await {
            tracing::debug!(backend = %self.kind, container = %name, error = %e, "container removal failed");
        }
    }

    async fn ensure_image(&self, cancel: &CancellationToken) -> Result<(), StartError> {
        let image = self.settings.image.as_str();
        match self.engine().args(["image", "inspect", image]).run(cancel).await {
            Ok(_) => {
                tracing::debug!(backend = %self.kind, image = %image, "image already present");
                return Ok(());
            }
            Err(InvocationError::Cancelled { .. }) => return Err(StartError::Cancelled),
            Err(_) => {}
        }

        tracing::info!(backend = %self.kind, image = %image, "pulling image");
        match self.engine().args(["pull", image]).run(cancel).await {
            Ok(_) => Ok(()),
            Err(InvocationError::Cancelled { .. }) => Err(StartError::Cancelled),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("could not pull image '{image}'"))
                .into()),
        }
    }

    fn open_log_file(&self) -> anyhow::Result<File> {
        let path = &self.settings.log_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("could not create log dir {}", parent.display()))?;
            }
        }
        File::create(path).with_context(|| format!("could not open log file {}", path.display()))
    }

    fn tail_logs(&self, name: &str) -> anyhow::Result<Child> {
        let file = self.open_log_file()?;
        let child = self
            .engine()
            .args(["logs", "-f", name])
            .spawn_logging_to(file)?;
        Ok(child)
    }
}

fn is_address_in_use(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ADDRESS_IN_USE_MARKERS.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl BackendProvider for ContainerEngineProvider {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn is_supported(&self) -> anyhow::Result<()> {
        let binary = self.settings.binary.as_str();
        match self.kind {
            BackendKind::Docker => docker::probe(binary).await,
            BackendKind::RootlessDocker => rootless::probe(binary).await,
            BackendKind::Podman => podman::probe(binary).await,
        }
    }

    async fn start(
        &self,
        address: &BackendAddress,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, StartError> {
        let name = self.container_name(address);

        // A crashed earlier run may have left a container with this name behind.
        self.remove_container(&name).await;
        self.ensure_image(cancel).await?;

        let run = self.run_invocation(&name, address);
        tracing::info!(backend = %self.kind, container = %name, command = %run.command_line(), "starting container");

        match run.run(cancel).await {
            Ok(_) => {}
            Err(InvocationError::Cancelled { .. }) => {
                self.remove_container(&name).await;
                return Err(StartError::Cancelled);
            }
            Err(InvocationError::Failed(failure)) if is_address_in_use(&failure.stderr) => {
                self.remove_container(&name).await;
                return Err(StartError::AddressInUse {
                    address: address.listen_url(),
                    detail: failure.stderr,
                });
            }
            Err(e) => {
                self.remove_container(&name).await;
                return Err(anyhow::Error::new(e)
                    .context(format!("could not start container '{name}'"))
                    .into());
            }
        }

        let log_tail = match self.tail_logs(&name) {
            Ok(child) => child,
            Err(e) => {
                if let Err(stop_err) = self.engine().args(["stop", name.as_str()]).output().await {
                    tracing::debug!(
                        backend = %self.kind,
                        container = %name,
                        error = %stop_err,
                        "could not stop container after log capture failed"
                    );
                }
                return Err(e.context(format!("could not capture logs of '{name}'")).into());
            }
        };

        let handle = BackendHandle {
            instance_id: Uuid::now_v7().to_string(),
            descriptor: BackendDescriptor {
                kind: self.kind,
                binary: self.settings.binary.clone(),
                name: name.clone(),
                image: self.settings.image.clone(),
                address: *address,
                log_path: self.settings.log_path.clone(),
            },
            log_tail_pid: log_tail.id(),
            created_at: std::time::Instant::now(),
        };

        {
            let mut instances = self.instances.write();
            instances.insert(
                handle.instance_id.clone(),
                ContainerInstance {
                    handle: handle.clone(),
                    log_tail: Some(log_tail),
                },
            );
        }

        tracing::info!(
            backend = %self.kind,
            container = %name,
            address = %address,
            log = %self.settings.log_path.display(),
            "started container"
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &BackendHandle) -> anyhow::Result<()> {
        // Take the instance out so the lock is not held across awaits.
        let instance = {
            let mut instances = self.instances.write();
            instances.remove(&handle.instance_id)
        };

        let Some(mut instance) = instance else {
            tracing::debug!(
                backend = %self.kind,
                instance_id = %handle.instance_id,
                "stop called for unknown instance, ignoring"
            );
            return Ok(());
        };

        let name = instance.handle.descriptor.name.clone();
        tracing::info!(backend = %self.kind, container = %name, "stopping container");

        let result = self
            .engine()
            .args(["stop", name.as_str()])
            .output()
            .await
            .map(|_| ())
            .with_context(|| format!("could not stop container '{name}'"));

        if let Some(mut tail) = instance.log_tail.take() {
            if let Err(e) = tail.kill().await {
                tracing::debug!(container = %name, error = %e, "log tail already exited");
            }
        }

        result
    }
}
