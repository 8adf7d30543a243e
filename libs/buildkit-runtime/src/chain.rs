//! Ordered provider selection

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backend::{BackendAddress, BackendHandle, BackendKind};
use crate::backends::BackendProvider;
use crate::error::{LifecycleError, ProviderRejection, StartError};

/// Providers in priority order
pub struct ProviderChain {
    providers: Vec<Arc<dyn BackendProvider>>,
}

/// Outcome of probing one provider without committing to it
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub kind: BackendKind,
    pub outcome: Result<(), String>,
}

impl ProbeReport {
    pub fn is_supported(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn BackendProvider>>) -> Self {
        Self { providers }
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        self.providers.iter().map(|p| p.kind()).collect()
    }

    /// Commit to the first provider whose probe succeeds.
    ///
    /// Probing stops at the first success. If nothing qualifies, the error
    /// carries every provider's rejection reason.
    pub async fn select(&self) -> Result<SelectedProvider, LifecycleError> {
        async {
            let mut rejections = Vec::with_capacity(self.providers.len());

            for provider in &self.providers {
                let kind = provider.kind();
                match provider.is_supported().await {
                    Ok(()) => {
                        tracing::info!(backend = %kind, "selected buildkitd provider");
                        return Ok(SelectedProvider {
                            provider: Arc::clone(provider),
                        });
                    }
                    Err(e) => {
                        tracing::debug!(backend = %kind, reason = %format!("{e:#}"), "provider not supported");
                        rejections.push(ProviderRejection {
                            kind,
                            reason: format!("{e:#}"),
                        });
                    }
                }
            }

            Err(LifecycleError::UnsupportedEnvironment { rejections })
        }
        .instrument(tracing::info_span!("backend.select"))
        .await
    }

    /// Probe every provider and report each outcome.
    pub async fn probe_all(&self) -> Vec<ProbeReport> {
        let mut reports = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            reports.push(ProbeReport {
                kind: provider.kind(),
                outcome: provider.is_supported().await.map_err(|e| format!("{e:#}")),
            });
        }
        reports
    }
}

/// The committed provider. Only this wrapper can start or stop a backend,
/// so unselected providers are never started.
#[derive(Clone)]
pub struct SelectedProvider {
    provider: Arc<dyn BackendProvider>,
}

impl SelectedProvider {
    pub fn kind(&self) -> BackendKind {
        self.provider.kind()
    }

    pub async fn start(
        &self,
        address: &BackendAddress,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, StartError> {
        self.provider.start(address, cancel).await
    }

    pub async fn stop(&self, handle: &BackendHandle) -> anyhow::Result<()> {
        self.provider.stop(handle).await
    }
}

impl std::fmt::Debug for SelectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedProvider")
            .field("kind", &self.kind())
            .finish()
    }
}
