//! Backend provider abstraction for the container engines that can host buildkitd

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendAddress, BackendHandle, BackendKind};
use crate::error::StartError;

/// One way of running `buildkitd` on this host.
///
/// `start` returns once the daemon process is launched and its log stream is
/// captured; it does not wait for readiness.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Probe the host. `Err` carries the human-readable rejection reason.
    async fn is_supported(&self) -> anyhow::Result<()>;

    async fn start(
        &self,
        address: &BackendAddress,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, StartError>;

    /// Stop a backend this provider started. Unknown handles are a no-op.
    async fn stop(&self, handle: &BackendHandle) -> anyhow::Result<()>;
}

pub mod container;
mod docker;
mod podman;
mod rootless;

pub use container::{ContainerEngineProvider, EngineSettings};
