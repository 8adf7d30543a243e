//! Command implementations and the wiring they share

pub mod build;
pub mod check;
pub mod push;
pub mod replace;
pub mod worker;

use buildkit_bootstrap::{AppConfig, ProviderId};
use buildkit_runtime::{
    BackendKind, BackendLifecycle, BackendProvider, BuildctlWorkersProbe, ContainerEngineProvider,
    EngineSettings, LifecycleOptions, ProviderChain, ReadinessOptions, RetryPolicy,
    SessionOptions,
};
use std::path::Path;
use std::sync::Arc;

/// File the backend container's log stream is tailed into.
pub const BUILDKITD_LOG_FILE: &str = "please-buildkit-buildkitd.log";

fn backend_kind(id: ProviderId) -> BackendKind {
    match id {
        ProviderId::Docker => BackendKind::Docker,
        ProviderId::RootlessDocker => BackendKind::RootlessDocker,
        ProviderId::Podman => BackendKind::Podman,
    }
}

/// Container engine providers in configured probe order.
pub fn provider_chain(config: &AppConfig, log_dir: &Path) -> ProviderChain {
    let providers = config
        .providers
        .order
        .iter()
        .map(|id| {
            let engine = config.providers.engine(*id);
            let settings = EngineSettings {
                binary: engine.binary.clone(),
                image: engine.image.clone(),
                name_prefix: config.buildkit.container_name_prefix.clone(),
                log_path: log_dir.join(BUILDKITD_LOG_FILE),
            };
            Arc::new(ContainerEngineProvider::new(backend_kind(*id), settings))
                as Arc<dyn BackendProvider>
        })
        .collect();
    ProviderChain::new(providers)
}

pub fn lifecycle_options(config: &AppConfig) -> LifecycleOptions {
    let buildkit = &config.buildkit;
    LifecycleOptions {
        retry: RetryPolicy {
            attempts: buildkit.start_attempts,
            base_delay: buildkit.start_backoff,
            max_delay: buildkit.start_backoff_max,
        },
        readiness: ReadinessOptions {
            interval: buildkit.readiness_interval,
            timeout: buildkit.readiness_timeout,
        },
    }
}

pub fn session_options(config: &AppConfig) -> SessionOptions {
    SessionOptions {
        max_concurrent_builds: config.buildkit.max_concurrent_builds,
        drain_grace: config.buildkit.drain_grace,
    }
}

pub fn backend_lifecycle(config: &AppConfig, log_dir: &Path) -> BackendLifecycle {
    BackendLifecycle::new(
        provider_chain(config, log_dir),
        Arc::new(BuildctlWorkersProbe::new(config.buildkit.buildctl_binary.clone())),
        lifecycle_options(config),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn chain_follows_configured_order() {
        let mut config = AppConfig::default();
        config.providers.order = vec![ProviderId::Docker, ProviderId::Podman];

        let chain = provider_chain(&config, Path::new("/tmp/log"));
        assert_eq!(chain.kinds(), vec![BackendKind::Docker, BackendKind::Podman]);
    }

    #[test]
    fn default_chain_prefers_podman() {
        let chain = provider_chain(&AppConfig::default(), Path::new("/tmp/log"));
        assert_eq!(
            chain.kinds(),
            vec![BackendKind::Podman, BackendKind::RootlessDocker, BackendKind::Docker]
        );
    }

    #[test]
    fn options_come_from_buildkit_section() {
        let mut config = AppConfig::default();
        config.buildkit.start_attempts = 3;
        config.buildkit.readiness_timeout = Duration::from_secs(30);
        config.buildkit.max_concurrent_builds = 0;

        let lifecycle = lifecycle_options(&config);
        assert_eq!(lifecycle.retry.attempts, 3);
        assert_eq!(lifecycle.retry.base_delay, Duration::from_millis(100));
        assert_eq!(lifecycle.readiness.timeout, Duration::from_secs(30));
        assert_eq!(lifecycle.readiness.interval, Duration::from_millis(250));

        let session = session_options(&config);
        assert_eq!(session.max_concurrent_builds, 0);
        assert_eq!(session.drain_grace, Duration::from_secs(10));
    }
}
