use handle_watch_domain::model::{NewUser, UserId, UserRecord, UserRole, VerifyMode};
use handle_watch_domain::storage::{StorageResult, UserStore};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};

use crate::entity::{accounts, api_keys, notification_receipts, proxies, users};
use crate::errors::{corrupt, StorageError};
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl UserStore for SeaOrmStorage {
    async fn upsert_user(&self, user: NewUser) -> StorageResult<UserRecord> {
        let model = users::ActiveModel {
            id: Set(user.id.get()),
            role: Set(user.role.as_str().to_string()),
            active: Set(true),
            check_interval_minutes: Set(user.check_interval_minutes as i32),
            auto_check_enabled: Set(user.auto_check_enabled),
            verify_mode: Set(user.verify_mode.as_tag().to_string()),
            created_at: Set(user.created_at),
        };
        users::Entity::insert(model)
            .on_conflict(OnConflict::column(users::Column::Id).do_nothing().to_owned())
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        self.find_user(user.id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {}", user.id)))
    }

    async fn find_user(&self, id: UserId) -> StorageResult<Option<UserRecord>> {
        let maybe = users::Entity::find_by_id(id.get())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        maybe.map(user_to_record).transpose()
    }

    async fn list_auto_check_users(&self) -> StorageResult<Vec<UserRecord>> {
        users::Entity::find()
            .filter(users::Column::Active.eq(true))
            .filter(users::Column::AutoCheckEnabled.eq(true))
            .order_by_asc(users::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(user_to_record)
            .collect()
    }

    async fn list_active_users(&self) -> StorageResult<Vec<UserRecord>> {
        users::Entity::find()
            .filter(users::Column::Active.eq(true))
            .order_by_asc(users::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(user_to_record)
            .collect()
    }

    async fn update_user_schedule(
        &self,
        id: UserId,
        interval_minutes: u32,
        auto_check_enabled: bool,
    ) -> StorageResult<Option<UserRecord>> {
        let result = users::Entity::update_many()
            .col_expr(
                users::Column::CheckIntervalMinutes,
                Expr::value(interval_minutes as i32),
            )
            .col_expr(
                users::Column::AutoCheckEnabled,
                Expr::value(auto_check_enabled),
            )
            .filter(users::Column::Id.eq(id.get()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_user(id).await
    }

    async fn set_verify_mode(&self, id: UserId, mode: VerifyMode) -> StorageResult<bool> {
        let result = users::Entity::update_many()
            .col_expr(users::Column::VerifyMode, Expr::value(mode.as_tag()))
            .filter(users::Column::Id.eq(id.get()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected > 0)
    }

    async fn set_user_active(&self, id: UserId, active: bool) -> StorageResult<bool> {
        let result = users::Entity::update_many()
            .col_expr(users::Column::Active, Expr::value(active))
            .filter(users::Column::Id.eq(id.get()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected > 0)
    }

    async fn delete_user(&self, id: UserId, cascade: bool) -> StorageResult<bool> {
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;

        let owned_accounts = accounts::Entity::find()
            .filter(accounts::Column::OwnerId.eq(id.get()))
            .count(&txn)
            .await
            .map_err(StorageError::from_source)?;
        if owned_accounts > 0 && !cascade {
            return Err(StorageError::Conflict(format!(
                "user {id} still owns {owned_accounts} accounts"
            )));
        }

        notification_receipts::Entity::delete_many()
            .filter(notification_receipts::Column::OwnerId.eq(id.get()))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;
        accounts::Entity::delete_many()
            .filter(accounts::Column::OwnerId.eq(id.get()))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;
        api_keys::Entity::delete_many()
            .filter(api_keys::Column::OwnerId.eq(id.get()))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;
        proxies::Entity::delete_many()
            .filter(proxies::Column::OwnerId.eq(id.get()))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;
        let deleted = users::Entity::delete_by_id(id.get())
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;

        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(deleted.rows_affected > 0)
    }
}

fn user_to_record(model: users::Model) -> StorageResult<UserRecord> {
    let role = UserRole::parse(&model.role).map_err(|_| corrupt("users.role", &model.role))?;
    Ok(UserRecord {
        id: UserId::new(model.id),
        role,
        active: model.active,
        check_interval_minutes: model.check_interval_minutes.max(0) as u32,
        auto_check_enabled: model.auto_check_enabled,
        verify_mode: model.verify_mode,
        created_at: model.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_storage, now, seed_user, today};
    use handle_watch_domain::{AccountStore, NewAccount, ProxyStore};

    #[tokio::test]
    async fn upsert_keeps_existing_row() {
        let storage = memory_storage().await;
        let id = seed_user(&storage, 7).await;
        storage
            .update_user_schedule(id, 30, true)
            .await
            .unwrap()
            .expect("user exists");

        let again = storage
            .upsert_user(NewUser::new(id, now()))
            .await
            .unwrap();
        assert_eq!(again.check_interval_minutes, 30);
        assert!(again.auto_check_enabled);
        assert_eq!(again.verify_mode, "api+instagram");
    }

    #[tokio::test]
    async fn auto_check_listing_filters_inactive() {
        let storage = memory_storage().await;
        let a = seed_user(&storage, 1).await;
        let b = seed_user(&storage, 2).await;
        seed_user(&storage, 3).await;
        storage.update_user_schedule(a, 5, true).await.unwrap();
        storage.update_user_schedule(b, 5, true).await.unwrap();
        storage.set_user_active(b, false).await.unwrap();

        let users = storage.list_auto_check_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, a);
        assert_eq!(storage.list_active_users().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn verify_mode_is_persisted() {
        let storage = memory_storage().await;
        let id = seed_user(&storage, 1).await;
        assert!(storage.set_verify_mode(id, VerifyMode::Proxy).await.unwrap());
        let user = storage.find_user(id).await.unwrap().unwrap();
        assert_eq!(user.verify_mode, "proxy");
        assert!(!storage
            .set_verify_mode(UserId::new(99), VerifyMode::Proxy)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_requires_cascade_when_accounts_exist() {
        let storage = memory_storage().await;
        let id = seed_user(&storage, 1).await;
        storage
            .insert_account(NewAccount::new(id, "alice", now(), today(), 30))
            .await
            .unwrap();
        storage
            .insert_proxy(handle_watch_domain::NewProxy {
                owner: id,
                scheme: handle_watch_domain::ProxyScheme::Http,
                host: "10.0.0.1".into(),
                port: 8080,
                username: None,
                password_cipher: None,
                priority: 5,
                created_at: now(),
            })
            .await
            .unwrap();

        let err = storage.delete_user(id, false).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        assert!(storage.delete_user(id, true).await.unwrap());
        assert!(storage.find_user(id).await.unwrap().is_none());
        assert!(storage.list_accounts(id).await.unwrap().is_empty());
        assert!(storage.list_proxies(id).await.unwrap().is_empty());
    }
}
