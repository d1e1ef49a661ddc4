use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Only events whose risk score clears the persistence threshold land here;
        // everything else stays on the structured log channel.
        manager
            .create_table(
                Table::create()
                    .table(SecurityEvent::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SecurityEvent::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SecurityEvent::EventType).string().not_null())
                    .col(
                        ColumnDef::new(SecurityEvent::OccurredAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SecurityEvent::Subject).string())
                    .col(ColumnDef::new(SecurityEvent::TenantId).string())
                    .col(ColumnDef::new(SecurityEvent::IpAddress).string())
                    .col(ColumnDef::new(SecurityEvent::UserAgent).string())
                    .col(ColumnDef::new(SecurityEvent::DeviceId).string())
                    .col(ColumnDef::new(SecurityEvent::SessionId).string())
                    .col(ColumnDef::new(SecurityEvent::Context).string())
                    .col(ColumnDef::new(SecurityEvent::RiskScore).double().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_security_events_occurred_at")
                    .table(SecurityEvent::Table)
                    .col(SecurityEvent::OccurredAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_security_events_event_type")
                    .table(SecurityEvent::Table)
                    .col(SecurityEvent::EventType)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SecurityEvent::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SecurityEvent {
    #[sea_orm(iden = "security_events")]
    Table,
    Id,
    EventType,
    OccurredAt,
    Subject,
    TenantId,
    IpAddress,
    UserAgent,
    DeviceId,
    SessionId,
    Context,
    RiskScore,
}
