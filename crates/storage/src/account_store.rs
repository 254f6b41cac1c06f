use chrono::NaiveDate;
use handle_watch_domain::model::{AccountId, AccountRecord, NewAccount, UserId};
use handle_watch_domain::storage::{AccountStore, StorageResult};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};

use crate::entity::accounts;
use crate::errors::StorageError;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl AccountStore for SeaOrmStorage {
    async fn insert_account(&self, account: NewAccount) -> StorageResult<AccountRecord> {
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;

        let duplicates = accounts::Entity::find()
            .filter(accounts::Column::OwnerId.eq(account.owner.get()))
            .filter(accounts::Column::Handle.eq(account.handle.as_str()))
            .filter(accounts::Column::Done.eq(false))
            .count(&txn)
            .await
            .map_err(StorageError::from_source)?;
        if duplicates > 0 {
            return Err(StorageError::Conflict(format!(
                "pending account `{}` already exists for user {}",
                account.handle, account.owner
            )));
        }

        let created = accounts::ActiveModel {
            owner_id: Set(account.owner.get()),
            handle: Set(account.handle),
            start_at: Set(account.start_at),
            start_on: Set(account.start_on),
            period_days: Set(account.period_days as i32),
            finished_on: Set(None),
            done: Set(false),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(StorageError::from_source)?;

        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(account_to_record(created))
    }

    async fn find_account(&self, id: AccountId) -> StorageResult<Option<AccountRecord>> {
        let maybe = accounts::Entity::find_by_id(id.get())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.map(account_to_record))
    }

    async fn list_pending_accounts(&self, owner: UserId) -> StorageResult<Vec<AccountRecord>> {
        let models = accounts::Entity::find()
            .filter(accounts::Column::OwnerId.eq(owner.get()))
            .filter(accounts::Column::Done.eq(false))
            .order_by_asc(accounts::Column::StartAt)
            .order_by_asc(accounts::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(models.into_iter().map(account_to_record).collect())
    }

    async fn list_accounts(&self, owner: UserId) -> StorageResult<Vec<AccountRecord>> {
        let models = accounts::Entity::find()
            .filter(accounts::Column::OwnerId.eq(owner.get()))
            .order_by_asc(accounts::Column::StartAt)
            .order_by_asc(accounts::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(models.into_iter().map(account_to_record).collect())
    }

    async fn mark_account_done(
        &self,
        id: AccountId,
        finished_on: NaiveDate,
    ) -> StorageResult<bool> {
        // The `done = false` guard keeps the transition monotone: a second
        // writer matches zero rows and `finished_on` is never rewritten.
        let result = accounts::Entity::update_many()
            .col_expr(accounts::Column::Done, Expr::value(true))
            .col_expr(accounts::Column::FinishedOn, Expr::value(finished_on))
            .filter(accounts::Column::Id.eq(id.get()))
            .filter(accounts::Column::Done.eq(false))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected == 1)
    }

    async fn delete_account(&self, id: AccountId) -> StorageResult<bool> {
        let result = accounts::Entity::delete_by_id(id.get())
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected > 0)
    }
}

fn account_to_record(model: accounts::Model) -> AccountRecord {
    AccountRecord {
        id: AccountId::new(model.id),
        owner: UserId::new(model.owner_id),
        handle: model.handle,
        start_at: model.start_at,
        start_on: model.start_on,
        period_days: model.period_days.max(1) as u32,
        finished_on: model.finished_on,
        done: model.done,
    }
}
