//! Enabling and disabling the injection of one endpoint
//!
//! Work on the same network is serialized with an in-process lock, since two
//! endpoints sharing a network hold different row locks.

use dashmap::DashMap;
use injector_cloud::{CloudClient, CloudError};
use injector_haproxy::{InstanceStats, ProxyController, ProxyError};
use injector_netns::{run_pinned, NamespaceManager, NetnsError};
use injector_proto::{RuntimeLayout, ServiceInjection};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Cloud port lookup failed: {0}")]
    Cloud(#[from] CloudError),

    #[error("Namespace operation failed: {0}")]
    Namespace(#[from] NetnsError),

    #[error("Proxy for network {network_id} failed to start: {source}")]
    ProxyStartFailed {
        network_id: String,
        #[source]
        source: ProxyError,
    },

    #[error("Proxy operation failed: {0}")]
    Proxy(#[from] ProxyError),
}

pub struct CloudPortResolver {
    cloud: Arc<dyn CloudClient>,
    namespaces: Arc<dyn NamespaceManager>,
    proxies: Arc<dyn ProxyController>,
    layout: RuntimeLayout,
    network_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CloudPortResolver {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        namespaces: Arc<dyn NamespaceManager>,
        proxies: Arc<dyn ProxyController>,
        layout: RuntimeLayout,
    ) -> Self {
        Self {
            cloud,
            namespaces,
            proxies,
            layout,
            network_locks: DashMap::new(),
        }
    }

    fn network_lock(&self, network_id: &str) -> Arc<Mutex<()>> {
        self.network_locks
            .entry(network_id.to_string())
            .or_default()
            .clone()
    }

    /// Make the endpoint's network serve the injection
    ///
    /// Idempotent: succeeds without side effects if the network's proxy is
    /// already running. A proxy that fails to start has its config and log
    /// dumped to the log and removed before the error is returned.
    pub async fn enable_injection(
        &self,
        injection: &ServiceInjection,
    ) -> Result<(), ResolverError> {
        let port = self.cloud.get_port(&injection.port_id).await?;
        let network_id = port.network_id.clone();
        if network_id != injection.network_id {
            warn!(
                endpoint_id = %injection.endpoint_id,
                stored = %injection.network_id,
                actual = %network_id,
                "Stored network differs from the cloud port's network"
            );
        }

        let lock = self.network_lock(&network_id);
        let _held = lock.lock().await;

        let namespace = self.namespaces.ensure(&port, self.cloud.as_ref()).await?;

        if self.proxies.is_running(&network_id) {
            debug!(network_id = %network_id, "Proxy already running");
            self.namespaces.close(namespace)?;
            return Ok(());
        }

        let proxies = self.proxies.clone();
        let runtime = tokio::runtime::Handle::current();
        let target = ServiceInjection {
            network_id: network_id.clone(),
            ..injection.clone()
        };

        let (namespace, started) = run_pinned(self.namespaces.clone(), namespace, move || {
            runtime.block_on(async move { proxies.add_instance(&target).await })
        })
        .await?;
        self.namespaces.close(namespace)?;

        if let Err(source) = started {
            error!(
                endpoint_id = %injection.endpoint_id,
                network_id = %network_id,
                "Proxy failed to start: {}", source
            );
            self.dump_diagnostics(&network_id);
            return Err(ResolverError::ProxyStartFailed { network_id, source });
        }

        info!(
            endpoint_id = %injection.endpoint_id,
            network_id = %network_id,
            "Injection enabled"
        );
        Ok(())
    }

    /// Tear down the network's proxy and namespace
    ///
    /// A namespace that is already gone counts as torn down.
    pub async fn disable_injection(
        &self,
        injection: &ServiceInjection,
    ) -> Result<(), ResolverError> {
        let port = self.cloud.get_port(&injection.port_id).await?;
        let network_id = port.network_id.as_str();

        let lock = self.network_lock(network_id);
        let _held = lock.lock().await;

        if self.proxies.is_running(network_id) {
            self.proxies.remove_instance(network_id).await?;
        }

        match self.namespaces.delete_by_id(network_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(network_id = %network_id, "Namespace already absent");
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            endpoint_id = %injection.endpoint_id,
            network_id = %network_id,
            "Injection disabled"
        );
        Ok(())
    }

    pub async fn collect_stats(&self) -> Vec<InstanceStats> {
        self.proxies.collect_stats().await
    }

    /// Log and remove the files a failed proxy start left behind
    fn dump_diagnostics(&self, network_id: &str) {
        let files = [
            ("config", self.layout.config_path(network_id)),
            ("log", self.layout.log_path(network_id)),
        ];

        for (kind, path) in &files {
            dump_file(network_id, kind, path);
        }
        for (_, path) in &files {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?path, "Failed to remove proxy file: {}", e);
                }
            }
        }
    }
}

fn dump_file(network_id: &str, kind: &str, path: &Path) {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            error!(network_id = %network_id, "Proxy {} {:?}:", kind, path);
            for line in contents.lines() {
                error!(network_id = %network_id, "  {}", line);
            }
        }
        Err(e) => {
            warn!(network_id = %network_id, "Proxy {} {:?} unavailable: {}", kind, path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use injector_cloud::{FixedIp, Port, StaticCloud, Subnet};
    use injector_haproxy::{FakeProxyController, ProxyCall};
    use injector_netns::{NamespaceCall, RecordingNamespaces};
    use injector_proto::Protocol;
    use uuid::Uuid;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: RuntimeLayout,
        namespaces: Arc<RecordingNamespaces>,
        proxies: Arc<FakeProxyController>,
        resolver: CloudPortResolver,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path());
        let cloud = StaticCloud::new()
            .with_port(Port {
                id: "port-a".to_string(),
                network_id: "net-a".to_string(),
                mac_address: "fa:16:3e:00:00:0a".to_string(),
                fixed_ips: vec![FixedIp {
                    subnet_id: "sub-a".to_string(),
                    ip_address: "10.0.0.5".parse().unwrap(),
                }],
            })
            .with_subnet(Subnet {
                id: "sub-a".to_string(),
                cidr: "10.0.0.0/24".to_string(),
            });
        let namespaces = Arc::new(RecordingNamespaces::new());
        let proxies = Arc::new(FakeProxyController::new(layout.clone(), "api.internal"));
        let resolver = CloudPortResolver::new(
            Arc::new(cloud),
            namespaces.clone(),
            proxies.clone(),
            layout.clone(),
        );
        Fixture {
            _dir: dir,
            layout,
            namespaces,
            proxies,
            resolver,
        }
    }

    fn injection(port_id: &str) -> ServiceInjection {
        ServiceInjection {
            endpoint_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            port_id: port_id.to_string(),
            network_id: "net-a".to_string(),
            ip_address: None,
            ports: vec![80],
            protocol: Protocol::Http,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enable_is_idempotent() {
        let f = fixture();

        f.resolver.enable_injection(&injection("port-a")).await.unwrap();
        f.resolver.enable_injection(&injection("port-a")).await.unwrap();

        assert_eq!(f.proxies.calls(), vec![ProxyCall::Add("net-a".to_string())]);
        assert_eq!(f.proxies.running(), vec!["net-a".to_string()]);
        assert_eq!(f.namespaces.entered_count(), 0);

        let calls = f.namespaces.calls();
        let enable = calls
            .iter()
            .position(|c| *c == NamespaceCall::Enable("net-a".to_string()))
            .unwrap();
        let disable = calls
            .iter()
            .position(|c| *c == NamespaceCall::Disable("net-a".to_string()))
            .unwrap();
        assert!(enable < disable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_start_dumps_and_cleans_up() {
        let f = fixture();
        f.proxies.fail_start("net-a");

        let err = f
            .resolver
            .enable_injection(&injection("port-a"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolverError::ProxyStartFailed { .. }));
        assert!(!f.layout.config_path("net-a").exists());
        assert!(!f.layout.log_path("net-a").exists());
        assert_eq!(f.namespaces.entered_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disable_tears_down_in_order() {
        let f = fixture();
        f.resolver.enable_injection(&injection("port-a")).await.unwrap();

        f.resolver.disable_injection(&injection("port-a")).await.unwrap();
        assert!(f.proxies.running().is_empty());
        assert!(!f.namespaces.exists("net-a"));

        // Second teardown finds nothing to do
        f.resolver.disable_injection(&injection("port-a")).await.unwrap();
        assert_eq!(
            f.proxies.calls(),
            vec![
                ProxyCall::Add("net-a".to_string()),
                ProxyCall::Remove("net-a".to_string()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_port_fails_without_side_effects() {
        let f = fixture();

        let err = f
            .resolver
            .enable_injection(&injection("port-missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::Cloud(ref e) if e.is_not_found()));

        let err = f
            .resolver
            .disable_injection(&injection("port-missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::Cloud(_)));

        assert!(f.namespaces.calls().is_empty());
        assert!(f.proxies.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crashed_proxy_is_restarted() {
        let f = fixture();
        f.resolver.enable_injection(&injection("port-a")).await.unwrap();
        f.proxies.crash("net-a");

        f.resolver.enable_injection(&injection("port-a")).await.unwrap();
        assert_eq!(f.proxies.running(), vec!["net-a".to_string()]);
        assert_eq!(f.proxies.calls().len(), 2);
    }
}
