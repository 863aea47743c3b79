//! Service entity: the application fronted by the agent

use injector_proto::Protocol;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Protocol of the fronted service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ServiceProtocol {
    #[sea_orm(string_value = "tcp")]
    Tcp,

    #[sea_orm(string_value = "http")]
    Http,
}

impl From<ServiceProtocol> for Protocol {
    fn from(protocol: ServiceProtocol) -> Self {
        match protocol {
            ServiceProtocol::Tcp => Protocol::Tcp,
            ServiceProtocol::Http => Protocol::Http,
        }
    }
}

impl From<Protocol> for ServiceProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => ServiceProtocol::Tcp,
            Protocol::Http => ServiceProtocol::Http,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "services")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub name: String,

    /// Agent host that serves this service
    #[sea_orm(indexed)]
    pub host: String,

    pub availability_zone: Option<String>,

    pub protocol: ServiceProtocol,

    /// Listening ports, comma-separated
    pub ports: String,

    pub enabled: bool,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

impl Model {
    /// Listening ports; malformed entries are skipped
    pub fn port_list(&self) -> Vec<u16> {
        parse_ports(&self.ports)
    }
}

/// Parse a comma-separated port list
pub fn parse_ports(value: &str) -> Vec<u16> {
    value
        .split(',')
        .filter_map(|port| port.trim().parse::<u16>().ok())
        .collect()
}

/// Render a port list in its stored form
pub fn format_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::endpoint::Entity")]
    Endpoint,
}

impl Related<super::endpoint::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Endpoint.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
