//! Backend lifecycle: select, start with retry, wait for readiness, shut down once

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::address::{start_tracked, PortAllocator, RetryPolicy};
use crate::backend::{BackendAddress, BackendHandle, BackendKind, ReadinessState};
use crate::chain::{ProviderChain, SelectedProvider};
use crate::error::LifecycleError;
use crate::readiness::{wait_tracked, ReadinessOptions, WorkerProbe};

#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleOptions {
    pub retry: RetryPolicy,
    pub readiness: ReadinessOptions,
}

/// Brings a backend up through its readiness phases
pub struct BackendLifecycle {
    chain: ProviderChain,
    allocator: Arc<PortAllocator>,
    probe: Arc<dyn WorkerProbe>,
    opts: LifecycleOptions,
}

impl BackendLifecycle {
    pub fn new(chain: ProviderChain, probe: Arc<dyn WorkerProbe>, opts: LifecycleOptions) -> Self {
        Self {
            chain,
            allocator: Arc::new(PortAllocator::new()),
            probe,
            opts,
        }
    }

    /// Share an allocator across lifecycles so no port is handed out twice.
    pub fn with_allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Run select → start → readiness.
    ///
    /// A failure after the backend was launched stops it exactly once before
    /// the error is returned.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<ActiveBackend, LifecycleError> {
        let mut state = ReadinessState::Unstarted;

        let provider = self.chain.select().await?;

        let started = start_tracked(&provider, &self.allocator, &self.opts.retry, cancel, &mut state)
            .instrument(tracing::info_span!("backend.start", backend = %provider.kind()))
            .await;
        let (handle, attempts) = match started {
            Ok(started) => started,
            Err(e) => {
                tracing::debug!(failed_in = ?state, "backend start failed");
                return Err(e);
            }
        };

        let address = handle.descriptor.address;
        tracing::info!(
            backend = %provider.kind(),
            address = %address,
            attempts,
            "buildkitd launched"
        );

        let ready = wait_tracked(self.probe.as_ref(), &address, &self.opts.readiness, cancel, &mut state)
            .instrument(tracing::info_span!("backend.readiness", address = %address))
            .await;

        match ready {
            Ok(()) => Ok(ActiveBackend {
                provider,
                handle: Some(handle),
                address,
                state,
            }),
            Err(e) => {
                let failed_in = state;
                state.advance(ReadinessState::Failed);
                tracing::debug!(failed_in = ?failed_in, "backend readiness failed");
                if failed_in.needs_cleanup() {
                    stop_quietly(&provider, &handle).await;
                }
                Err(e)
            }
        }
    }
}

async fn stop_quietly(provider: &SelectedProvider, handle: &BackendHandle) {
    if let Err(e) = provider.stop(handle).await {
        tracing::warn!(
            backend = %provider.kind(),
            container = %handle.descriptor.name,
            error = %format!("{e:#}"),
            "failed to stop buildkitd"
        );
    }
}

/// A protocol-ready backend.
///
/// The address is fixed for the lifetime of the value.
pub struct ActiveBackend {
    provider: SelectedProvider,
    handle: Option<BackendHandle>,
    address: BackendAddress,
    state: ReadinessState,
}

impl ActiveBackend {
    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    pub fn kind(&self) -> BackendKind {
        self.provider.kind()
    }

    pub fn state(&self) -> ReadinessState {
        self.state
    }

    pub fn handle(&self) -> Option<&BackendHandle> {
        self.handle.as_ref()
    }

    /// Stop the backend. Teardown errors are logged, not returned.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            stop_quietly(&self.provider, &handle).await;
            tracing::info!(backend = %self.provider.kind(), "buildkitd stopped");
        }
    }
}

impl Drop for ActiveBackend {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            tracing::warn!(
                container = %handle.descriptor.name,
                "active backend dropped without shutdown"
            );
        }
    }
}
