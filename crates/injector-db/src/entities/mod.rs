//! Database entities

pub mod endpoint;
pub mod endpoint_port;
pub mod service;

pub use endpoint::Entity as Endpoint;
pub use endpoint_port::Entity as EndpointPort;
pub use service::Entity as Service;

pub mod prelude {
    pub use super::endpoint::Entity as Endpoint;
    pub use super::endpoint_port::Entity as EndpointPort;
    pub use super::service::Entity as Service;
}
