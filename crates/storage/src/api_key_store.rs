use chrono::NaiveDate;
use handle_watch_domain::model::{ApiKeyId, ApiKeyRecord, NewApiKey, UserId};
use handle_watch_domain::storage::{ApiKeyDraw, ApiKeyStore, StorageResult};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};

use crate::entity::api_keys;
use crate::errors::StorageError;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl ApiKeyStore for SeaOrmStorage {
    async fn insert_api_key(&self, key: NewApiKey) -> StorageResult<ApiKeyRecord> {
        let created = api_keys::ActiveModel {
            owner_id: Set(key.owner.get()),
            secret: Set(key.secret),
            used_today: Set(0),
            ref_day: Set(key.created_on),
            working: Set(true),
            created_at: Set(key.created_at),
            ..Default::default()
        }
        .insert(self.connection())
        .await
        .map_err(StorageError::from_source)?;
        Ok(key_to_record(created))
    }

    async fn list_api_keys(&self, owner: UserId) -> StorageResult<Vec<ApiKeyRecord>> {
        let models = api_keys::Entity::find()
            .filter(api_keys::Column::OwnerId.eq(owner.get()))
            .order_by_asc(api_keys::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(models.into_iter().map(key_to_record).collect())
    }

    async fn next_api_key(
        &self,
        owner: UserId,
        today: NaiveDate,
        limit: u32,
        exclude: &[ApiKeyId],
    ) -> StorageResult<ApiKeyDraw> {
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;

        let candidates = api_keys::Entity::find()
            .filter(api_keys::Column::OwnerId.eq(owner.get()))
            .filter(api_keys::Column::Working.eq(true))
            .order_by_asc(api_keys::Column::Id)
            .lock_exclusive()
            .all(&txn)
            .await
            .map_err(StorageError::from_source)?;

        let mut draw = ApiKeyDraw::default();
        for model in candidates {
            let mut record = key_to_record(model);
            if exclude.contains(&record.id) {
                continue;
            }
            if record.normalize_for(today) {
                write_counters(&txn, &record).await?;
                draw.resets += 1;
            }
            if record.is_available(limit) {
                draw.key = Some(record);
                break;
            }
        }

        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(draw)
    }

    async fn record_api_key_use(
        &self,
        id: ApiKeyId,
        today: NaiveDate,
    ) -> StorageResult<Option<ApiKeyRecord>> {
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;

        let Some(model) = api_keys::Entity::find_by_id(id.get())
            .lock_exclusive()
            .one(&txn)
            .await
            .map_err(StorageError::from_source)?
        else {
            return Ok(None);
        };

        let mut record = key_to_record(model);
        record.normalize_for(today);
        record.used_today = record.used_today.saturating_add(1);
        write_counters(&txn, &record).await?;

        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(Some(record))
    }

    async fn mark_api_key_exhausted(
        &self,
        id: ApiKeyId,
        today: NaiveDate,
        limit: u32,
    ) -> StorageResult<bool> {
        let result = api_keys::Entity::update_many()
            .col_expr(api_keys::Column::UsedToday, Expr::value(limit as i32))
            .col_expr(api_keys::Column::RefDay, Expr::value(today))
            .filter(api_keys::Column::Id.eq(id.get()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected > 0)
    }

    async fn mark_api_key_broken(&self, id: ApiKeyId) -> StorageResult<bool> {
        let result = api_keys::Entity::update_many()
            .col_expr(api_keys::Column::Working, Expr::value(false))
            .filter(api_keys::Column::Id.eq(id.get()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected > 0)
    }
}

async fn write_counters(txn: &DatabaseTransaction, record: &ApiKeyRecord) -> StorageResult<()> {
    api_keys::Entity::update_many()
        .col_expr(
            api_keys::Column::UsedToday,
            Expr::value(record.used_today as i32),
        )
        .col_expr(api_keys::Column::RefDay, Expr::value(record.ref_day))
        .filter(api_keys::Column::Id.eq(record.id.get()))
        .exec(txn)
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}

fn key_to_record(model: api_keys::Model) -> ApiKeyRecord {
    ApiKeyRecord {
        id: ApiKeyId::new(model.id),
        owner: UserId::new(model.owner_id),
        secret: model.secret,
        used_today: model.used_today.max(0) as u32,
        ref_day: model.ref_day,
        working: model.working,
        created_at: model.created_at,
    }
}
