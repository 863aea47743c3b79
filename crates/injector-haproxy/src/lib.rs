//! Supervisor for the per-network HAProxy instances
//!
//! Each cloud network gets exactly one proxy process, started inside that
//! network's namespace. Its frontends listen on the service ports and its
//! backends dial the ingress sockets on the host side.

pub mod config;
pub mod fake;
mod haproxy;
pub mod stats;

pub use config::ProxyConfig;
pub use fake::{FakeProxyController, ProxyCall};
pub use haproxy::{HaproxyController, HaproxySettings};
pub use stats::{InstanceStats, StatsClient};

use injector_proto::ServiceInjection;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to render proxy configuration: {0}")]
    Render(#[from] std::fmt::Error),

    #[error("Failed to launch {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy for network {network_id} exited during startup (code {code:?})")]
    Exited {
        network_id: String,
        code: Option<i32>,
    },

    #[error("Invalid pidfile {path:?}: {reason}")]
    PidFile { path: PathBuf, reason: String },

    #[error("Proxy for network {network_id} did not become healthy: {reason}")]
    Unhealthy { network_id: String, reason: String },

    #[error("Stats query failed: {0}")]
    Stats(String),

    #[error("No proxy instance for network {0}")]
    NotRunning(String),

    #[error("Signal failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of the proxy process of each network
#[async_trait::async_trait]
pub trait ProxyController: Send + Sync {
    /// Whether a live process is tracked for the network
    ///
    /// A tracked instance whose process is gone is evicted, so the next
    /// `add_instance` starts a fresh one.
    fn is_running(&self, network_id: &str) -> bool;

    /// Render the configuration and start the proxy for the injection's network
    ///
    /// Must be called from a thread bound to that network's namespace. A no-op
    /// if a live instance is already tracked.
    async fn add_instance(&self, injection: &ServiceInjection) -> Result<(), ProxyError>;

    /// Terminate the network's proxy and forget it
    async fn remove_instance(&self, network_id: &str) -> Result<(), ProxyError>;

    /// Query counters of every tracked instance, skipping failures
    async fn collect_stats(&self) -> Vec<InstanceStats>;
}
