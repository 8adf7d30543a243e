//! Lifecycle error taxonomy

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendKind;

/// One provider's reason for declining the current host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRejection {
    pub kind: BackendKind,
    pub reason: String,
}

impl fmt::Display for ProviderRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Why a single readiness probe did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("no buildkit workers registered yet")]
    NoWorkers,
    #[error("worker query failed: {0}")]
    QueryFailed(String),
}

/// Failure of a provider's `start`
#[derive(Debug, Error)]
pub enum StartError {
    /// The backend could not bind its address; the caller may retry with a new one.
    #[error("address {address} is already in use: {detail}")]
    AddressInUse { address: String, detail: String },
    #[error("backend start was cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fatal startup failures. Any of these aborts the process.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("no supported buildkitd providers:\n{}", join_rejections(.rejections))]
    UnsupportedEnvironment { rejections: Vec<ProviderRejection> },

    #[error("could not start buildkitd after {attempts} attempts: {last}")]
    AddressAllocationExhausted { attempts: u32, last: String },

    #[error("could not start buildkitd provider '{kind}': {source:#}")]
    StartFailed {
        kind: BackendKind,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "buildkitd at {address} did not report a registered worker within {timeout:?} (last: {})",
        describe_last(.last)
    )]
    ReadinessTimeout {
        address: String,
        timeout: Duration,
        last: Option<ProbeFailure>,
    },

    #[error("backend startup was cancelled")]
    Cancelled,
}

fn join_rejections(rejections: &[ProviderRejection]) -> String {
    rejections
        .iter()
        .map(|r| format!("  - {r}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_last(last: &Option<ProbeFailure>) -> String {
    match last {
        Some(failure) => failure.to_string(),
        None => "never probed".to_string(),
    }
}
