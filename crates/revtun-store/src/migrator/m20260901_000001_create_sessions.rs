//! Create the sessions table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(string_len(Sessions::AgentId, 255).primary_key())
                    .col(string_len(Sessions::SessionId, 255).not_null())
                    .col(string_len(Sessions::AuthId, 255).not_null())
                    .col(string_len_null(Sessions::Name, 255))
                    .col(string_len_null(Sessions::Version, 64))
                    .col(string_len_null(Sessions::Address, 255))
                    .col(text(Sessions::Tunnels).not_null().default("[]"))
                    .col(text(Sessions::AllowedUserGroups).not_null().default("[]"))
                    .col(timestamp_with_time_zone(Sessions::ConnectedAt).not_null())
                    .col(timestamp_with_time_zone_null(Sessions::DisconnectedAt))
                    .col(
                        timestamp_with_time_zone(Sessions::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // auth id reuse is checked on every connect
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_auth_id")
                    .table(Sessions::Table)
                    .col(Sessions::AuthId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Sessions {
    Table,
    AgentId,
    SessionId,
    AuthId,
    Name,
    Version,
    Address,
    Tunnels,
    AllowedUserGroups,
    ConnectedAt,
    DisconnectedAt,
    UpdatedAt,
}
