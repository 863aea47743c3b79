//! Shared types for the injection agent
//!
//! Plain data passed between the storage layer, the cloud port resolver and the
//! per-network proxy supervisor, plus the filesystem naming conventions every
//! component recomputes instead of persisting.

pub mod injection;
pub mod layout;

pub use injection::{Protocol, ProtocolParseError, ServiceInjection};
pub use layout::RuntimeLayout;

/// Prefix of every isolated network context created by the agent
pub const NAMESPACE_PREFIX: &str = "injector-";

/// Name of the isolated network context for a cloud network
pub fn namespace_name(network_id: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, network_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_name() {
        assert_eq!(
            namespace_name("6f2b3a1e-0c1d-4b7e-9a8f-1d2c3b4a5e6f"),
            "injector-6f2b3a1e-0c1d-4b7e-9a8f-1d2c3b4a5e6f"
        );
    }
}
