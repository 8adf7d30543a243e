//! Readiness polling: the backend is ready once it lists a registered worker

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendAddress, ReadinessState};
use crate::error::{LifecycleError, ProbeFailure};
use crate::process::{Invocation, InvocationError};

/// One readiness check against a running backend
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    async fn probe(&self, address: &BackendAddress) -> Result<(), ProbeFailure>;
}

/// Checks TCP reachability, then asks `buildctl debug workers` for at least
/// one registered worker.
#[derive(Debug, Clone)]
pub struct BuildctlWorkersProbe {
    buildctl: String,
}

impl BuildctlWorkersProbe {
    pub fn new(buildctl: impl Into<String>) -> Self {
        Self {
            buildctl: buildctl.into(),
        }
    }
}

/// Count worker rows in `buildctl debug workers` output, skipping the header.
fn count_workers(out: &str) -> usize {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.starts_with("ID"))
        .count()
}

#[async_trait]
impl WorkerProbe for BuildctlWorkersProbe {
    async fn probe(&self, address: &BackendAddress) -> Result<(), ProbeFailure> {
        TcpStream::connect(address.socket_addr())
            .await
            .map_err(|e| ProbeFailure::ConnectionRefused(e.to_string()))?;

        let out = Invocation::new(&self.buildctl)
            .args(["debug", "workers"])
            .buildkit_host(address)
            .output()
            .await
            .map_err(|e| match e {
                InvocationError::Failed(f) => ProbeFailure::QueryFailed(f.stderr),
                other => ProbeFailure::QueryFailed(other.to_string()),
            })?;

        if count_workers(&out.stdout) == 0 {
            return Err(ProbeFailure::NoWorkers);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Poll `probe` every interval until it succeeds, the timeout passes or
/// `cancel` fires.
pub async fn wait_until_ready(
    probe: &dyn WorkerProbe,
    address: &BackendAddress,
    opts: &ReadinessOptions,
    cancel: &CancellationToken,
) -> Result<(), LifecycleError> {
    let mut state = ReadinessState::ProcessLaunched;
    wait_tracked(probe, address, opts, cancel, &mut state).await
}

/// [`wait_until_ready`], recording `NetworkReachable` on the first probe that
/// got past the TCP connect and `ProtocolReady` on success.
pub(crate) async fn wait_tracked(
    probe: &dyn WorkerProbe,
    address: &BackendAddress,
    opts: &ReadinessOptions,
    cancel: &CancellationToken,
    state: &mut ReadinessState,
) -> Result<(), LifecycleError> {
    let deadline = Instant::now() + opts.timeout;
    let mut last: Option<ProbeFailure> = None;

    tracing::info!(address = %address, timeout = ?opts.timeout, "waiting for buildkitd workers");

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LifecycleError::ReadinessTimeout {
                address: address.connect_url(),
                timeout: opts.timeout,
                last,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
            _ = tokio::time::sleep(opts.interval.min(remaining)) => {}
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
            res = tokio::time::timeout(remaining, probe.probe(address)) => res,
        };

        match outcome {
            Ok(Ok(())) => {
                state.advance(ReadinessState::NetworkReachable);
                state.advance(ReadinessState::ProtocolReady);
                tracing::info!(address = %address, "buildkitd is ready");
                return Ok(());
            }
            Ok(Err(failure)) => {
                if !matches!(failure, ProbeFailure::ConnectionRefused(_)) {
                    state.advance(ReadinessState::NetworkReachable);
                }
                tracing::debug!(address = %address, reason = %failure, "buildkitd not ready yet");
                last = Some(failure);
            }
            // The probe itself overran the deadline; loop once more to report the timeout.
            Err(_) => {}
        }
    }
}
