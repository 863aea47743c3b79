//! The joined endpoint + service read model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Application protocol of the fronted service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Raw TCP passthrough
    #[default]
    Tcp,
    /// HTTP-class traffic; the proxy rewrites the Host header
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
        }
    }

    /// Whether the proxy runs in HTTP mode for this protocol
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown protocol: {0}")]
pub struct ProtocolParseError(pub String);

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "http" | "https" => Ok(Protocol::Http),
            other => Err(ProtocolParseError(other.to_string())),
        }
    }
}

/// One endpoint joined with its cloud port binding and the owning service
///
/// Assembled by the storage read that locks the endpoint row; everything the
/// port resolver and the proxy supervisor need for one injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInjection {
    pub endpoint_id: Uuid,
    pub service_id: Uuid,
    /// Cloud port the injection is wired to
    pub port_id: String,
    /// Network the cloud port is bound to
    pub network_id: String,
    /// Address recorded for the port, if any
    pub ip_address: Option<String>,
    /// Listening ports of the service
    pub ports: Vec<u16>,
    pub protocol: Protocol,
}
