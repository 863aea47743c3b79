//! Ingress multiplexer
//!
//! One unix socket per service port, at a path every proxy instance can
//! compute. Each accepted connection is relayed to the upstream service over
//! TCP. The sockets outlive any single namespace or proxy instance.

mod relay;
mod server;

pub use relay::IngressCounters;
pub use server::{IngressConfig, IngressMultiplexer};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Failed to resolve upstream {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream {0} resolved to no addresses")]
    NoAddress(String),

    #[error("Failed to bind ingress socket {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to upstream {address}: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error during relay: {0}")]
    Io(#[from] std::io::Error),
}
