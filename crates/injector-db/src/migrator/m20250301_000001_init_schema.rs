//! Initial schema: services, endpoints and their cloud port bindings

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Services::Table)
                    .if_not_exists()
                    .col(uuid(Services::Id).primary_key())
                    .col(string_len(Services::Name, 255).not_null())
                    .col(string_len(Services::Host, 255).not_null())
                    .col(string_len_null(Services::AvailabilityZone, 255))
                    .col(
                        string_len(Services::Protocol, 16)
                            .not_null()
                            .default("tcp"),
                    )
                    .col(string_len(Services::Ports, 255).not_null())
                    .col(boolean(Services::Enabled).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(Services::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Services::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_services_host")
                    .table(Services::Table)
                    .col(Services::Host)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Endpoints::Table)
                    .if_not_exists()
                    .col(uuid(Endpoints::Id).primary_key())
                    .col(uuid(Endpoints::ServiceId).not_null())
                    .col(string_len_null(Endpoints::ProjectId, 64))
                    .col(
                        string_len(Endpoints::Status, 32)
                            .not_null()
                            .default("PENDING_CREATE"),
                    )
                    .col(
                        timestamp_with_time_zone(Endpoints::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Endpoints::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_endpoints_service")
                            .from(Endpoints::Table, Endpoints::ServiceId)
                            .to(Services::Table, Services::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Sync passes filter by service and status
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_endpoints_service_status")
                    .table(Endpoints::Table)
                    .col(Endpoints::ServiceId)
                    .col(Endpoints::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(EndpointPorts::Table)
                    .if_not_exists()
                    .col(uuid(EndpointPorts::EndpointId).primary_key())
                    .col(string_len(EndpointPorts::PortId, 64).not_null())
                    .col(string_len(EndpointPorts::NetworkId, 64).not_null())
                    .col(string_len_null(EndpointPorts::IpAddress, 64))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_endpoint_ports_endpoint")
                            .from(EndpointPorts::Table, EndpointPorts::EndpointId)
                            .to(Endpoints::Table, Endpoints::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_endpoint_ports_network")
                    .table(EndpointPorts::Table)
                    .col(EndpointPorts::NetworkId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EndpointPorts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Endpoints::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Services::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Services {
    Table,
    Id,
    Name,
    Host,
    AvailabilityZone,
    Protocol,
    Ports,
    Enabled,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Endpoints {
    Table,
    Id,
    ServiceId,
    ProjectId,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum EndpointPorts {
    Table,
    EndpointId,
    PortId,
    NetworkId,
    IpAddress,
}
