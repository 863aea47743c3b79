//! Filesystem naming conventions under the agent's runtime directory
//!
//! Every path is derived from a network ID or a service port so any agent
//! process can recompute it after a restart.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rendered proxy configuration for a network
    pub fn config_path(&self, network_id: &str) -> PathBuf {
        self.root.join(format!("{}.conf", network_id))
    }

    /// Captured stdout/stderr of the proxy process for a network
    pub fn log_path(&self, network_id: &str) -> PathBuf {
        self.root.join(format!("{}.log", network_id))
    }

    /// Pidfile written by the proxy process for a network
    pub fn pid_path(&self, network_id: &str) -> PathBuf {
        self.root.join(format!("{}.pid", network_id))
    }

    /// Stats control socket of the proxy process for a network
    pub fn stats_socket_path(&self, network_id: &str) -> PathBuf {
        self.root.join(format!("{}.sock", network_id))
    }

    /// Local ingress socket the per-namespace proxies dial for a service port
    pub fn ingress_socket_path(&self, port: u16) -> PathBuf {
        self.root.join(format!("ingress-{}.sock", port))
    }
}
