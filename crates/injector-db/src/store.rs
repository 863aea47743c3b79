//! Read/write contract of the reconciliation engine
//!
//! Every function is generic over [`ConnectionTrait`] so it runs either on the
//! pooled connection or inside the transaction that holds an endpoint's row lock.

use crate::entities::service::format_ports;
use crate::entities::{endpoint, endpoint_port, service, Endpoint, EndpointPort, Service};
use crate::EndpointStatus;
use chrono::Utc;
use injector_proto::{Protocol, ServiceInjection};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, JoinType,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Which endpoints a sync pass picks up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Every endpoint of the service that is not rejected (startup pass)
    Full,
    /// Only endpoints in a status that needs work
    Incremental,
}

/// An endpoint read under its row lock, with its current status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedInjection {
    pub status: EndpointStatus,
    pub injection: ServiceInjection,
}

/// Identity of the service this agent fronts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub name: String,
    pub host: String,
    pub availability_zone: Option<String>,
    pub ports: Vec<u16>,
    pub protocol: Protocol,
}

/// List endpoint IDs of a service that a sync pass should process
pub async fn list_sync_candidates<C: ConnectionTrait>(
    db: &C,
    service_id: Uuid,
    mode: SyncMode,
) -> Result<Vec<Uuid>, DbErr> {
    let query = Endpoint::find()
        .select_only()
        .column(endpoint::Column::Id)
        .filter(endpoint::Column::ServiceId.eq(service_id));

    let query = match mode {
        SyncMode::Full => query.filter(endpoint::Column::Status.ne(EndpointStatus::Rejected)),
        SyncMode::Incremental => {
            query.filter(endpoint::Column::Status.is_in(EndpointStatus::INCREMENTAL))
        }
    };

    query
        .order_by_asc(endpoint::Column::UpdatedAt)
        .into_tuple::<Uuid>()
        .all(db)
        .await
}

/// Lock an endpoint row and read it joined with its port binding and service
///
/// Returns `None` if the endpoint no longer exists. The lock lasts until the
/// surrounding transaction ends; backends without row locks (SQLite) ignore it.
pub async fn lock_injection<C: ConnectionTrait>(
    txn: &C,
    endpoint_id: Uuid,
) -> Result<Option<LockedInjection>, DbErr> {
    let Some(endpoint) = Endpoint::find_by_id(endpoint_id)
        .lock_exclusive()
        .one(txn)
        .await?
    else {
        return Ok(None);
    };

    let binding = EndpointPort::find_by_id(endpoint_id)
        .one(txn)
        .await?
        .ok_or_else(|| {
            DbErr::RecordNotFound(format!("port binding for endpoint {}", endpoint_id))
        })?;

    let service = Service::find_by_id(endpoint.service_id)
        .one(txn)
        .await?
        .ok_or_else(|| {
            DbErr::RecordNotFound(format!(
                "service {} of endpoint {}",
                endpoint.service_id, endpoint_id
            ))
        })?;

    Ok(Some(LockedInjection {
        status: endpoint.status,
        injection: ServiceInjection {
            endpoint_id,
            service_id: service.id,
            port_id: binding.port_id,
            network_id: binding.network_id,
            ip_address: binding.ip_address,
            ports: service.port_list(),
            protocol: service.protocol.into(),
        },
    }))
}

/// Set an endpoint's status and bump its update timestamp
pub async fn update_status<C: ConnectionTrait>(
    txn: &C,
    endpoint_id: Uuid,
    status: EndpointStatus,
) -> Result<(), DbErr> {
    let result = Endpoint::update_many()
        .col_expr(endpoint::Column::Status, Expr::value(status))
        .col_expr(endpoint::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(endpoint::Column::Id.eq(endpoint_id))
        .exec(txn)
        .await?;

    if result.rows_affected == 0 {
        return Err(DbErr::RecordNotFound(format!("endpoint {}", endpoint_id)));
    }

    debug!(endpoint_id = %endpoint_id, status = %status, "Updated endpoint status");
    Ok(())
}

/// Delete an endpoint and its port binding
pub async fn delete_endpoint<C: ConnectionTrait>(txn: &C, endpoint_id: Uuid) -> Result<(), DbErr> {
    EndpointPort::delete_by_id(endpoint_id).exec(txn).await?;
    let result = Endpoint::delete_by_id(endpoint_id).exec(txn).await?;

    if result.rows_affected == 0 {
        return Err(DbErr::RecordNotFound(format!("endpoint {}", endpoint_id)));
    }

    debug!(endpoint_id = %endpoint_id, "Deleted endpoint");
    Ok(())
}

/// Count other endpoints of a service that still need the injection on a network
pub async fn count_network_peers<C: ConnectionTrait>(
    db: &C,
    service_id: Uuid,
    network_id: &str,
    excluding: Uuid,
) -> Result<u64, DbErr> {
    Endpoint::find()
        .join(JoinType::InnerJoin, endpoint::Relation::EndpointPort.def())
        .filter(endpoint::Column::ServiceId.eq(service_id))
        .filter(endpoint::Column::Id.ne(excluding))
        .filter(endpoint::Column::Status.is_not_in(EndpointStatus::TEARDOWN))
        .filter(endpoint_port::Column::NetworkId.eq(network_id))
        .count(db)
        .await
}

/// Find the service row for this agent, creating it when allowed
pub async fn ensure_service<C: ConnectionTrait>(
    db: &C,
    registration: &ServiceRegistration,
    auto_create: bool,
) -> Result<service::Model, DbErr> {
    let mut ports = registration.ports.clone();
    ports.sort_unstable();
    ports.dedup();
    let ports = format_ports(&ports);

    let query = Service::find()
        .filter(service::Column::Name.eq(registration.name.as_str()))
        .filter(service::Column::Host.eq(registration.host.as_str()))
        .filter(service::Column::Ports.eq(ports.as_str()));

    let query = match &registration.availability_zone {
        Some(zone) => query.filter(service::Column::AvailabilityZone.eq(zone.as_str())),
        None => query.filter(service::Column::AvailabilityZone.is_null()),
    };

    if let Some(existing) = query.one(db).await? {
        debug!(service_id = %existing.id, "Found registered service");
        return Ok(existing);
    }

    if !auto_create {
        return Err(DbErr::RecordNotFound(format!(
            "service {} on host {} (ports {})",
            registration.name, registration.host, ports
        )));
    }

    let now = Utc::now();
    let created = service::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(registration.name.clone()),
        host: Set(registration.host.clone()),
        availability_zone: Set(registration.availability_zone.clone()),
        protocol: Set(registration.protocol.into()),
        ports: Set(ports),
        enabled: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;

    info!(
        service_id = %created.id,
        name = %created.name,
        host = %created.host,
        "Registered new service"
    );

    Ok(created)
}
