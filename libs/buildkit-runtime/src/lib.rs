//! # buildkit-runtime
//!
//! Lifecycle orchestration for an ephemeral `buildkitd` backend and the worker
//! session that serves build requests against it.
//!
//! Phase order: **select → allocate/start (retried) → readiness → serve → stop**.
//!
//! - [`ProviderChain`] probes container engines in priority order and commits to
//!   the first supported one.
//! - [`BackendLifecycle`] allocates an address, starts the backend through the
//!   committed provider and blocks until `buildctl debug workers` reports a
//!   registered worker.
//! - [`Session`] reads newline-delimited build requests, dispatches each one
//!   concurrently and writes exactly one correlated response per request.
//! - [`ActiveBackend::shutdown`] tears the backend down exactly once.

mod address;
mod backend;
mod chain;
mod error;
mod readiness;
mod runner;

pub mod backends;
pub mod process;
pub mod session;

pub use address::{start_with_retry, PortAllocator, RetryPolicy};
pub use backend::{BackendAddress, BackendDescriptor, BackendHandle, BackendKind, ReadinessState};
pub use backends::{BackendProvider, ContainerEngineProvider, EngineSettings};
pub use chain::{ProbeReport, ProviderChain, SelectedProvider};
pub use error::{LifecycleError, ProbeFailure, ProviderRejection, StartError};
pub use readiness::{wait_until_ready, BuildctlWorkersProbe, ReadinessOptions, WorkerProbe};
pub use runner::{ActiveBackend, BackendLifecycle, LifecycleOptions};
pub use session::{
    BuildHandler, BuildRequest, BuildResponse, RequestError, RequestHandler, Session,
    SessionError, SessionOptions, SessionSummary,
};
