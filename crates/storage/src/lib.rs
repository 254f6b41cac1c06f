//! SeaORM-backed storage adapters that satisfy the domain repository traits
//! while keeping the database backend swappable (SQLite by default,
//! PostgreSQL via feature flag).

mod account_store;
mod api_key_store;
mod builder;
mod entity;
mod errors;
mod migration;
mod proxy_store;
mod receipt_store;
mod settings_store;
mod user_store;

use std::sync::Arc;

pub use builder::StorageBuilder;
use errors::StorageError;
use handle_watch_domain::storage::StorageResult;
use migration::run_migrations;
use sea_orm::{Database, DatabaseConnection};

/// Shared storage handle used by the engine and the status API.
#[derive(Clone)]
pub struct SeaOrmStorage {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStorage {
    /// Connects to the provided database URL and ensures the schema is present.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let db = Database::connect(database_url)
            .await
            .map_err(StorageError::from_source)?;
        prepare_connection(&db).await?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    pub(crate) fn from_connection(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}

pub(crate) async fn prepare_connection(db: &DatabaseConnection) -> StorageResult<()> {
    run_migrations(db).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use handle_watch_domain::{NewUser, UserId, UserStore};

    use crate::SeaOrmStorage;

    pub async fn memory_storage() -> SeaOrmStorage {
        SeaOrmStorage::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
    }

    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    pub fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    pub async fn seed_user(storage: &SeaOrmStorage, id: i64) -> UserId {
        let user = storage
            .upsert_user(NewUser::new(UserId::new(id), now()))
            .await
            .expect("user inserted");
        user.id
    }
}
