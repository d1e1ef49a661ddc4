use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(User::Subject)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(User::Email).string().not_null())
                    .col(ColumnDef::new(User::TenantId).string())
                    .col(
                        ColumnDef::new(User::Role)
                            .string()
                            .not_null()
                            .default("member"),
                    )
                    .col(ColumnDef::new(User::PasswordHash).string().not_null())
                    .col(ColumnDef::new(User::Enabled).big_integer().not_null().default(1))
                    .col(ColumnDef::new(User::CreatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_users_email")
                    .table(User::Table)
                    .col(User::Email)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DeviceRegistration::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceRegistration::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeviceRegistration::Subject).string().not_null())
                    .col(ColumnDef::new(DeviceRegistration::DeviceId).string().not_null())
                    .col(ColumnDef::new(DeviceRegistration::DeviceInfo).string())
                    .col(
                        ColumnDef::new(DeviceRegistration::IsTrusted)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(DeviceRegistration::TrustedAt).big_integer())
                    .col(ColumnDef::new(DeviceRegistration::TrustedUntil).big_integer())
                    .col(ColumnDef::new(DeviceRegistration::DeviceSecret).string())
                    .col(
                        ColumnDef::new(DeviceRegistration::RegisteredAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceRegistration::LastUsedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One row per (subject, device_id); registration is an upsert on this pair
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_registrations_subject_device")
                    .table(DeviceRegistration::Table)
                    .col(DeviceRegistration::Subject)
                    .col(DeviceRegistration::DeviceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // The trust-expiry sweep filters on trusted_until
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_registrations_trusted_until")
                    .table(DeviceRegistration::Table)
                    .col(DeviceRegistration::TrustedUntil)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(BearerToken::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BearerToken::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(BearerToken::Token).string().not_null())
                    .col(ColumnDef::new(BearerToken::Subject).string().not_null())
                    .col(ColumnDef::new(BearerToken::Label).string().not_null())
                    .col(ColumnDef::new(BearerToken::Abilities).string().not_null())
                    .col(ColumnDef::new(BearerToken::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(BearerToken::ExpiresAt).big_integer().not_null())
                    .col(
                        ColumnDef::new(BearerToken::Revoked)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_bearer_tokens_token")
                    .table(BearerToken::Table)
                    .col(BearerToken::Token)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_bearer_tokens_expires_at")
                    .table(BearerToken::Table)
                    .col(BearerToken::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TokenPairing::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TokenPairing::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TokenPairing::Subject).string().not_null())
                    .col(ColumnDef::new(TokenPairing::DeviceId).string().not_null())
                    .col(
                        ColumnDef::new(TokenPairing::AccessTokenId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenPairing::RefreshTokenId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(TokenPairing::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(TokenPairing::ExpiresAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_token_pairings_subject_device")
                    .table(TokenPairing::Table)
                    .col(TokenPairing::Subject)
                    .col(TokenPairing::DeviceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_token_pairings_refresh_token_id")
                    .table(TokenPairing::Table)
                    .col(TokenPairing::RefreshTokenId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(JobExecution::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobExecution::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobExecution::JobName).string().not_null())
                    .col(ColumnDef::new(JobExecution::StartedAt).big_integer().not_null())
                    .col(ColumnDef::new(JobExecution::CompletedAt).big_integer())
                    .col(ColumnDef::new(JobExecution::Success).big_integer())
                    .col(ColumnDef::new(JobExecution::ErrorMessage).string())
                    .col(ColumnDef::new(JobExecution::RecordsProcessed).big_integer())
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecution::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TokenPairing::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(BearerToken::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(DeviceRegistration::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "users")]
    Table,
    Subject,
    Email,
    TenantId,
    Role,
    PasswordHash,
    Enabled,
    CreatedAt,
}

#[derive(DeriveIden)]
enum DeviceRegistration {
    #[sea_orm(iden = "device_registrations")]
    Table,
    Id,
    Subject,
    DeviceId,
    DeviceInfo,
    IsTrusted,
    TrustedAt,
    TrustedUntil,
    DeviceSecret,
    RegisteredAt,
    LastUsedAt,
}

#[derive(DeriveIden)]
enum BearerToken {
    #[sea_orm(iden = "bearer_tokens")]
    Table,
    Id,
    Token,
    Subject,
    Label,
    Abilities,
    CreatedAt,
    ExpiresAt,
    Revoked,
}

#[derive(DeriveIden)]
enum TokenPairing {
    #[sea_orm(iden = "token_pairings")]
    Table,
    Id,
    Subject,
    DeviceId,
    AccessTokenId,
    RefreshTokenId,
    CreatedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum JobExecution {
    #[sea_orm(iden = "job_executions")]
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
