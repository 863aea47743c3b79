use crate::relay::{relay, IngressCounters};
use crate::IngressError;
use injector_proto::RuntimeLayout;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UnixListener};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub upstream_host: String,
    pub ports: Vec<u16>,
    pub layout: RuntimeLayout,
    /// How long in-flight relays may run after shutdown
    pub shutdown_grace: Duration,
}

/// A bound ingress socket; the socket file is removed when it is dropped
struct PortListener {
    port: u16,
    path: PathBuf,
    listener: UnixListener,
    upstream: SocketAddr,
}

impl Drop for PortListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?self.path, "Failed to remove ingress socket: {}", e);
            }
        }
    }
}

pub struct IngressMultiplexer {
    listeners: Vec<PortListener>,
    tracker: TaskTracker,
    counters: Arc<IngressCounters>,
    shutdown_grace: Duration,
}

impl IngressMultiplexer {
    /// Resolve the upstream and bind one socket per port
    ///
    /// Stale socket files left by a previous run are removed first.
    pub async fn bind(config: IngressConfig) -> Result<Self, IngressError> {
        tokio::fs::create_dir_all(config.layout.root()).await?;

        let mut listeners = Vec::with_capacity(config.ports.len());
        for &port in &config.ports {
            let upstream = resolve(&config.upstream_host, port).await?;
            let path = config.layout.ingress_socket_path(port);

            if path.exists() {
                debug!(path = ?path, "Removing stale ingress socket");
                std::fs::remove_file(&path)?;
            }

            let listener = UnixListener::bind(&path).map_err(|source| IngressError::Bind {
                path: path.clone(),
                source,
            })?;

            info!(port = port, upstream = %upstream, path = ?path, "Ingress listening");
            listeners.push(PortListener {
                port,
                path,
                listener,
                upstream,
            });
        }

        Ok(Self {
            listeners,
            tracker: TaskTracker::new(),
            counters: Arc::new(IngressCounters::default()),
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn counters(&self) -> Arc<IngressCounters> {
        self.counters.clone()
    }

    pub fn socket_paths(&self) -> Vec<&Path> {
        self.listeners.iter().map(|l| l.path.as_path()).collect()
    }

    /// Accept and relay until `shutdown` fires
    ///
    /// Listeners are closed and their socket files removed first; relays still
    /// in flight then get the grace period to finish.
    pub async fn serve(self, shutdown: CancellationToken) {
        let mut loops = JoinSet::new();
        for listener in self.listeners {
            loops.spawn(accept_loop(
                listener,
                self.tracker.clone(),
                self.counters.clone(),
                shutdown.clone(),
            ));
        }
        while loops.join_next().await.is_some() {}

        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                active = self.tracker.len(),
                "Ingress relays still active after grace period"
            );
        }
        info!("Ingress multiplexer stopped");
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, IngressError> {
    lookup_host((host, port))
        .await
        .map_err(|source| IngressError::Resolve {
            host: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| IngressError::NoAddress(host.to_string()))
}

async fn accept_loop(
    listener: PortListener,
    tracker: TaskTracker,
    counters: Arc<IngressCounters>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let port = listener.port;
                    let upstream = listener.upstream;
                    let counters = counters.clone();
                    tracker.spawn(async move {
                        match relay(stream, upstream, &counters).await {
                            Ok((up, down)) => debug!(
                                port = port,
                                bytes_to_upstream = up,
                                bytes_to_proxy = down,
                                "Ingress relay completed"
                            ),
                            Err(e) => warn!(port = port, "Ingress relay failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    error!(port = listener.port, "Failed to accept ingress connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    debug!(port = listener.port, "Ingress listener closed");
}
