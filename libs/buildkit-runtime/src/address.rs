//! Address allocation and start retry

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendAddress, BackendHandle, ReadinessState};
use crate::chain::SelectedProvider;
use crate::error::{LifecycleError, StartError};

/// OS-assigned attempts before giving up on finding an unseen port.
const MAX_PORT_DRAWS: usize = 16;

/// Hands out ephemeral ports, never the same one twice per process.
///
/// The probe socket is released before the port is returned, so another
/// process may grab it before the backend binds. Callers absorb that through
/// [`start_with_retry`].
#[derive(Debug, Default)]
pub struct PortAllocator {
    issued: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> std::io::Result<BackendAddress> {
        for _ in 0..MAX_PORT_DRAWS {
            let port = {
                let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
                listener.local_addr()?.port()
            };
            if self.issued.lock().insert(port) {
                return Ok(BackendAddress::new(port));
            }
            tracing::debug!(port, "port already issued by this process, drawing again");
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "could not draw an unused ephemeral port",
        ))
    }

    pub fn issued(&self) -> usize {
        self.issued.lock().len()
    }
}

/// Bounded exponential backoff for start attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the 1-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Allocate an address and start the backend, retrying only on bind collisions.
///
/// Returns the handle and the number of attempts it took.
pub async fn start_with_retry(
    provider: &SelectedProvider,
    allocator: &PortAllocator,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(BackendHandle, u32), LifecycleError> {
    let mut state = ReadinessState::Unstarted;
    start_tracked(provider, allocator, policy, cancel, &mut state).await
}

/// [`start_with_retry`], recording `AddressAllocated` once a port is held and
/// `ProcessLaunched` once the provider has started.
pub(crate) async fn start_tracked(
    provider: &SelectedProvider,
    allocator: &PortAllocator,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    state: &mut ReadinessState,
) -> Result<(BackendHandle, u32), LifecycleError> {
    let attempts = policy.attempts.max(1);
    let mut last = String::from("no attempt made");

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        let address = match allocator.allocate() {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "address allocation failed");
                last = e.to_string();
                if !backoff(policy, attempt, attempts, cancel).await {
                    return Err(LifecycleError::Cancelled);
                }
                continue;
            }
        };

        state.advance(ReadinessState::AddressAllocated);
        tracing::debug!(attempt, address = %address, backend = %provider.kind(), "starting backend");

        match provider.start(&address, cancel).await {
            Ok(handle) => {
                state.advance(ReadinessState::ProcessLaunched);
                return Ok((handle, attempt));
            }
            Err(StartError::AddressInUse { address, detail }) => {
                tracing::warn!(attempt, address = %address, "address already in use, retrying");
                last = format!("{address}: {detail}");
            }
            Err(StartError::Cancelled) => return Err(LifecycleError::Cancelled),
            Err(StartError::Other(source)) => {
                return Err(LifecycleError::StartFailed {
                    kind: provider.kind(),
                    source,
                })
            }
        }

        if !backoff(policy, attempt, attempts, cancel).await {
            return Err(LifecycleError::Cancelled);
        }
    }

    Err(LifecycleError::AddressAllocationExhausted { attempts, last })
}

/// Sleeps before the next attempt. Returns false if cancelled.
async fn backoff(policy: &RetryPolicy, attempt: u32, attempts: u32, cancel: &CancellationToken) -> bool {
    if attempt >= attempts {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(policy.delay_for(attempt)) => true,
        _ = cancel.cancelled() => false,
    }
}
