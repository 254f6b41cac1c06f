use chrono::Utc;
use handle_watch_domain::storage::{SettingsStore, StorageResult};
use sea_orm::{sea_query::OnConflict, EntityTrait, Set};

use crate::entity::system_settings;
use crate::errors::StorageError;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl SettingsStore for SeaOrmStorage {
    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        let maybe = system_settings::Entity::find_by_id(key.to_string())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.map(|model| model.value))
    }

    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        let active = system_settings::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(Utc::now()),
        };
        system_settings::Entity::insert(active)
            .on_conflict(
                OnConflict::column(system_settings::Column::Key)
                    .update_columns([
                        system_settings::Column::Value,
                        system_settings::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }
}
