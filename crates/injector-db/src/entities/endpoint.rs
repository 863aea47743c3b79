//! Endpoint entity: a tenant's request to reach a service

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an endpoint
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum EndpointStatus {
    #[sea_orm(string_value = "PENDING_CREATE")]
    PendingCreate,

    #[sea_orm(string_value = "AVAILABLE")]
    Available,

    #[sea_orm(string_value = "PENDING_UPDATE")]
    PendingUpdate,

    #[sea_orm(string_value = "PENDING_REJECTED")]
    PendingRejected,

    #[sea_orm(string_value = "REJECTED")]
    Rejected,

    #[sea_orm(string_value = "PENDING_DELETE")]
    PendingDelete,

    #[sea_orm(string_value = "FAILED")]
    Failed,
}

impl EndpointStatus {
    /// Statuses picked up by an incremental sync pass
    pub const INCREMENTAL: [EndpointStatus; 5] = [
        EndpointStatus::PendingCreate,
        EndpointStatus::Rejected,
        EndpointStatus::PendingRejected,
        EndpointStatus::PendingDelete,
        EndpointStatus::Failed,
    ];

    /// Statuses whose injection is being torn down
    pub const TEARDOWN: [EndpointStatus; 3] = [
        EndpointStatus::PendingRejected,
        EndpointStatus::Rejected,
        EndpointStatus::PendingDelete,
    ];
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "endpoints")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(indexed)]
    pub service_id: Uuid,

    /// Tenant project owning the endpoint
    pub project_id: Option<String>,

    pub status: EndpointStatus,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Endpoint belongs to a service
    #[sea_orm(
        belongs_to = "super::service::Entity",
        from = "Column::ServiceId",
        to = "super::service::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Service,

    /// Cloud port binding of the endpoint
    #[sea_orm(has_one = "super::endpoint_port::Entity")]
    EndpointPort,
}

impl Related<super::service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Service.def()
    }
}

impl Related<super::endpoint_port::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EndpointPort.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
