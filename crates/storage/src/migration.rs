use sea_orm::sea_query::{ColumnDef, Index, IndexCreateStatement, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection};

use crate::entity::{
    accounts, api_keys, notification_receipts, proxies, system_settings, users,
};
use handle_watch_domain::storage::StorageResult;

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let backend = db.get_database_backend();

    let users_table = Table::create()
        .table(users::Entity)
        .col(
            ColumnDef::new(users::Column::Id)
                .big_integer()
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(users::Column::Role).string_len(16).not_null())
        .col(
            ColumnDef::new(users::Column::Active)
                .boolean()
                .not_null()
                .default(true),
        )
        .col(
            ColumnDef::new(users::Column::CheckIntervalMinutes)
                .integer()
                .not_null()
                .default(5),
        )
        .col(
            ColumnDef::new(users::Column::AutoCheckEnabled)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(users::Column::VerifyMode)
                .string_len(32)
                .not_null(),
        )
        .col(
            ColumnDef::new(users::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, users_table).await?;

    let accounts_table = Table::create()
        .table(accounts::Entity)
        .col(
            ColumnDef::new(accounts::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(accounts::Column::OwnerId)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(accounts::Column::Handle)
                .string_len(255)
                .not_null(),
        )
        .col(
            ColumnDef::new(accounts::Column::StartAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(ColumnDef::new(accounts::Column::StartOn).date().not_null())
        .col(
            ColumnDef::new(accounts::Column::PeriodDays)
                .integer()
                .not_null(),
        )
        .col(ColumnDef::new(accounts::Column::FinishedOn).date().null())
        .col(
            ColumnDef::new(accounts::Column::Done)
                .boolean()
                .not_null()
                .default(false),
        )
        .to_owned();
    create_table(db, backend, accounts_table).await?;
    create_index(
        db,
        backend,
        Index::create()
            .name("idx_accounts_owner_done")
            .table(accounts::Entity)
            .col(accounts::Column::OwnerId)
            .col(accounts::Column::Done)
            .to_owned(),
    )
    .await?;

    let api_keys_table = Table::create()
        .table(api_keys::Entity)
        .col(
            ColumnDef::new(api_keys::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(api_keys::Column::OwnerId)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(api_keys::Column::Secret)
                .string_len(255)
                .not_null(),
        )
        .col(
            ColumnDef::new(api_keys::Column::UsedToday)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(api_keys::Column::RefDay).date().not_null())
        .col(
            ColumnDef::new(api_keys::Column::Working)
                .boolean()
                .not_null()
                .default(true),
        )
        .col(
            ColumnDef::new(api_keys::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, api_keys_table).await?;

    let proxies_table = Table::create()
        .table(proxies::Entity)
        .col(
            ColumnDef::new(proxies::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(proxies::Column::OwnerId)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(proxies::Column::Scheme)
                .string_len(8)
                .not_null(),
        )
        .col(
            ColumnDef::new(proxies::Column::Host)
                .string_len(255)
                .not_null(),
        )
        .col(ColumnDef::new(proxies::Column::Port).integer().not_null())
        .col(
            ColumnDef::new(proxies::Column::Username)
                .string_len(255)
                .null(),
        )
        .col(ColumnDef::new(proxies::Column::PasswordCipher).binary().null())
        .col(
            ColumnDef::new(proxies::Column::Active)
                .boolean()
                .not_null()
                .default(true),
        )
        .col(
            ColumnDef::new(proxies::Column::Priority)
                .small_integer()
                .not_null()
                .default(5),
        )
        .col(
            ColumnDef::new(proxies::Column::Used)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(proxies::Column::Success)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(proxies::Column::FailStreak)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(proxies::Column::CooldownUntil)
                .timestamp_with_time_zone()
                .null(),
        )
        .col(
            ColumnDef::new(proxies::Column::LastChecked)
                .timestamp_with_time_zone()
                .null(),
        )
        .col(
            ColumnDef::new(proxies::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, proxies_table).await?;
    create_index(
        db,
        backend,
        Index::create()
            .name("uq_proxies_owner_endpoint")
            .table(proxies::Entity)
            .col(proxies::Column::OwnerId)
            .col(proxies::Column::Scheme)
            .col(proxies::Column::Host)
            .col(proxies::Column::Port)
            .unique()
            .to_owned(),
    )
    .await?;

    let receipts_table = Table::create()
        .table(notification_receipts::Entity)
        .col(
            ColumnDef::new(notification_receipts::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(notification_receipts::Column::OwnerId)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(notification_receipts::Column::AccountId)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(notification_receipts::Column::Kind)
                .string_len(16)
                .not_null(),
        )
        .col(
            ColumnDef::new(notification_receipts::Column::SentOn)
                .date()
                .not_null(),
        )
        .col(
            ColumnDef::new(notification_receipts::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, receipts_table).await?;
    create_index(
        db,
        backend,
        Index::create()
            .name("uq_receipts_owner_account_kind_day")
            .table(notification_receipts::Entity)
            .col(notification_receipts::Column::OwnerId)
            .col(notification_receipts::Column::AccountId)
            .col(notification_receipts::Column::Kind)
            .col(notification_receipts::Column::SentOn)
            .unique()
            .to_owned(),
    )
    .await?;

    let settings_table = Table::create()
        .table(system_settings::Entity)
        .col(
            ColumnDef::new(system_settings::Column::Key)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(system_settings::Column::Value)
                .string()
                .not_null(),
        )
        .col(
            ColumnDef::new(system_settings::Column::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, settings_table).await?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(crate::errors::StorageError::from_source)?;
    Ok(())
}

async fn create_index(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: IndexCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(crate::errors::StorageError::from_source)?;
    Ok(())
}
