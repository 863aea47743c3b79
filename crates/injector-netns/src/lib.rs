//! Network namespace isolation for injected proxies
//!
//! One isolated network context exists per cloud network, named
//! `injector-<network_id>` so any agent process can re-discover it after a
//! restart. The context is wired to the cloud port through a veth pair whose
//! host side follows the `tap<port-prefix>` convention the bridge agent
//! recognizes.
//!
//! Namespace membership is per OS thread. Entering is modeled as an explicit
//! [`NamespaceBinding`] that always unbinds on drop, and [`run_pinned`] runs
//! namespace-sensitive work on a dedicated thread that exits afterwards, so a
//! bound thread is never handed back to a pool.

pub mod fake;
#[cfg(target_os = "linux")]
pub mod linux;
mod namespace;

pub use fake::{NamespaceCall, RecordingNamespaces};
#[cfg(target_os = "linux")]
pub use linux::LinuxNamespaces;
pub use namespace::{
    interface_names, resolve_addresses, run_pinned, NamespaceBinding, NamespaceId,
    NamespaceManager, NetworkNamespace,
};

use injector_cloud::CloudError;
use thiserror::Error;

/// Directory where named network namespaces are mounted
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

#[derive(Debug, Error)]
pub enum NetnsError {
    #[error("Namespace {0} is already entered")]
    AlreadyEntered(String),

    #[error("Namespace {0} is not entered")]
    NotEntered(String),

    #[error("Namespace {0} is still entered")]
    StillEntered(String),

    #[error("Namespace {0} not found")]
    NotFound(String),

    #[error("Namespace {name} does not match the handle held for it")]
    Inconsistent { name: String },

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Interface {0} not found")]
    InterfaceNotFound(String),

    #[error("Cloud API error: {0}")]
    Cloud(#[from] CloudError),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pinned worker failed: {0}")]
    Pinned(String),
}

impl NetnsError {
    /// Whether the namespace was already absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetnsError::NotFound(_))
    }
}
