//! Backend data model: kinds, addresses, descriptors and handles

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Instant;

/// The container runtime variant hosting `buildkitd`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Docker with `--privileged`
    Docker,
    /// Docker running buildkitd's rootless image without a process sandbox
    RootlessDocker,
    /// Podman with `--privileged`
    Podman,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::RootlessDocker => "rootless-docker",
            BackendKind::Podman => "podman",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A TCP port handed to the backend.
///
/// The daemon listens on every interface; clients connect over loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    port: u16,
}

impl BackendAddress {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for buildkitd's `--addr`.
    pub fn listen_url(&self) -> String {
        format!("tcp://0.0.0.0:{}", self.port)
    }

    /// Value for `BUILDKIT_HOST`.
    pub fn connect_url(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port))
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connect_url())
    }
}

/// What the committed provider launched. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub binary: String,
    pub name: String,
    pub image: String,
    pub address: BackendAddress,
    pub log_path: PathBuf,
}

/// A handle to a running backend instance, owned by the provider that created it
#[derive(Clone)]
pub struct BackendHandle {
    pub instance_id: String,
    pub descriptor: BackendDescriptor,
    /// PID of the log tail process, if one is attached
    pub log_tail_pid: Option<u32>,
    pub created_at: Instant,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("instance_id", &self.instance_id)
            .field("kind", &self.descriptor.kind)
            .field("name", &self.descriptor.name)
            .field("address", &self.descriptor.address.connect_url())
            .field("log_tail_pid", &self.log_tail_pid)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Startup progress of the backend.
///
/// `Failed` is reachable from any state; only failures from `ProcessLaunched`
/// onward require the provider to be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadinessState {
    Unstarted,
    AddressAllocated,
    ProcessLaunched,
    NetworkReachable,
    ProtocolReady,
    Failed,
}

impl ReadinessState {
    /// Whether a failure in this state leaves something behind to clean up.
    pub fn needs_cleanup(&self) -> bool {
        matches!(
            self,
            ReadinessState::ProcessLaunched | ReadinessState::NetworkReachable
        )
    }

    /// Move to `next`. Repeated moves to the current state are ignored.
    pub(crate) fn advance(&mut self, next: ReadinessState) {
        if *self != next {
            tracing::trace!(from = ?self, to = ?next, "readiness transition");
            *self = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_urls() {
        let addr = BackendAddress::new(41234);
        assert_eq!(addr.listen_url(), "tcp://0.0.0.0:41234");
        assert_eq!(addr.connect_url(), "tcp://127.0.0.1:41234");
        assert_eq!(addr.socket_addr().to_string(), "127.0.0.1:41234");
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:41234");
    }

    #[test]
    fn backend_kind_display() {
        assert_eq!(BackendKind::Docker.to_string(), "docker");
        assert_eq!(BackendKind::RootlessDocker.to_string(), "rootless-docker");
        assert_eq!(BackendKind::Podman.to_string(), "podman");
        assert_ne!(BackendKind::Docker, BackendKind::Podman);
    }

    #[test]
    fn readiness_cleanup_states() {
        assert!(!ReadinessState::Unstarted.needs_cleanup());
        assert!(!ReadinessState::AddressAllocated.needs_cleanup());
        assert!(ReadinessState::ProcessLaunched.needs_cleanup());
        assert!(ReadinessState::NetworkReachable.needs_cleanup());
        assert!(ReadinessState::ProcessLaunched < ReadinessState::ProtocolReady);
    }

    #[test]
    fn handle_debug_includes_identity() {
        let handle = BackendHandle {
            instance_id: "test-123".to_string(),
            descriptor: BackendDescriptor {
                kind: BackendKind::Podman,
                binary: "podman".to_string(),
                name: "please-buildkit-1234".to_string(),
                image: "docker.io/moby/buildkit:master".to_string(),
                address: BackendAddress::new(1234),
                log_path: PathBuf::from("/tmp/buildkitd.log"),
            },
            log_tail_pid: Some(12345),
            created_at: Instant::now(),
        };

        let debug_str = format!("{:?}", handle);
        assert!(debug_str.contains("test-123"));
        assert!(debug_str.contains("Podman"));
        assert!(debug_str.contains("please-buildkit-1234"));
        assert!(debug_str.contains("12345"));
    }
}
