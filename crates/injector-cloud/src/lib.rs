//! Cloud port API client
//!
//! The agent only consumes two shapes from the cloud networking API: a port
//! (MAC address, fixed IPs, owning network) and a subnet (CIDR). Both are
//! exposed through the [`CloudClient`] capability so the resolver can run
//! against the real Neutron endpoint or a static test double.

pub mod fake;
pub mod neutron;
mod types;

pub use fake::StaticCloud;
pub use neutron::{CloudSettings, NeutronClient};
pub use types::{FixedIp, Port, Subnet};

use thiserror::Error;

/// Errors returned by cloud API calls
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unexpected response status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid {field} in cloud response: {value}")]
    Invalid { field: &'static str, value: String },
}

impl CloudError {
    /// Whether the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

/// Read access to the cloud networking API
#[async_trait::async_trait]
pub trait CloudClient: Send + Sync {
    /// Fetch a port by ID
    async fn get_port(&self, port_id: &str) -> Result<Port, CloudError>;

    /// Fetch a subnet by ID
    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError>;
}
