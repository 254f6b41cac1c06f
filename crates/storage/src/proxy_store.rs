use chrono::{DateTime, Utc};
use handle_watch_domain::model::{FailureEffect, NewProxy, ProxyId, ProxyRecord, ProxyScheme, UserId};
use handle_watch_domain::storage::{ProxyStore, StorageResult};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Set, TransactionTrait,
};

use crate::entity::proxies;
use crate::errors::{corrupt, StorageError};
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl ProxyStore for SeaOrmStorage {
    async fn insert_proxy(&self, proxy: NewProxy) -> StorageResult<Option<ProxyRecord>> {
        let model = proxies::ActiveModel {
            owner_id: Set(proxy.owner.get()),
            scheme: Set(proxy.scheme.to_string()),
            host: Set(proxy.host.clone()),
            port: Set(i32::from(proxy.port)),
            username: Set(proxy.username),
            password_cipher: Set(proxy.password_cipher),
            active: Set(true),
            priority: Set(i16::from(proxy.priority.clamp(1, 10))),
            used: Set(0),
            success: Set(0),
            fail_streak: Set(0),
            cooldown_until: Set(None),
            last_checked: Set(None),
            created_at: Set(proxy.created_at),
            ..Default::default()
        };
        let inserted = proxies::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    proxies::Column::OwnerId,
                    proxies::Column::Scheme,
                    proxies::Column::Host,
                    proxies::Column::Port,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        if inserted == 0 {
            return Ok(None);
        }

        let created = proxies::Entity::find()
            .filter(proxies::Column::OwnerId.eq(proxy.owner.get()))
            .filter(proxies::Column::Scheme.eq(proxy.scheme.to_string()))
            .filter(proxies::Column::Host.eq(proxy.host))
            .filter(proxies::Column::Port.eq(i32::from(proxy.port)))
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        created.map(proxy_to_record).transpose()
    }

    async fn find_proxy(&self, id: ProxyId) -> StorageResult<Option<ProxyRecord>> {
        let maybe = proxies::Entity::find_by_id(id.get())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        maybe.map(proxy_to_record).transpose()
    }

    async fn list_proxies(&self, owner: UserId) -> StorageResult<Vec<ProxyRecord>> {
        proxies::Entity::find()
            .filter(proxies::Column::OwnerId.eq(owner.get()))
            .order_by_asc(proxies::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(proxy_to_record)
            .collect()
    }

    async fn list_available_proxies(
        &self,
        owner: UserId,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<ProxyRecord>> {
        proxies::Entity::find()
            .filter(proxies::Column::OwnerId.eq(owner.get()))
            .filter(proxies::Column::Active.eq(true))
            .filter(
                Condition::any()
                    .add(proxies::Column::CooldownUntil.is_null())
                    .add(proxies::Column::CooldownUntil.lte(now)),
            )
            .order_by_asc(proxies::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(proxy_to_record)
            .collect()
    }

    async fn record_proxy_success(
        &self,
        id: ProxyId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ProxyRecord>> {
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;
        let Some(mut record) = lock_proxy(&txn, id).await? else {
            return Ok(None);
        };

        record.apply_success(now);
        write_health(&txn, &record).await?;

        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(Some(record))
    }

    async fn record_proxy_failure(
        &self,
        id: ProxyId,
        now: DateTime<Utc>,
        apply_cooldown: bool,
    ) -> StorageResult<Option<(ProxyRecord, FailureEffect)>> {
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;
        let Some(mut record) = lock_proxy(&txn, id).await? else {
            return Ok(None);
        };

        let effect = record.apply_failure(now, apply_cooldown);
        write_health(&txn, &record).await?;

        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(Some((record, effect)))
    }

    async fn release_expired_cooldowns(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let result = proxies::Entity::update_many()
            .col_expr(
                proxies::Column::CooldownUntil,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(proxies::Column::CooldownUntil.is_not_null())
            .filter(proxies::Column::CooldownUntil.lte(now))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }

    async fn reset_cooldowns(&self, owner: UserId) -> StorageResult<u64> {
        let result = proxies::Entity::update_many()
            .col_expr(
                proxies::Column::CooldownUntil,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(proxies::Column::OwnerId.eq(owner.get()))
            .filter(proxies::Column::CooldownUntil.is_not_null())
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }

    async fn reactivate_proxies(&self, owner: UserId) -> StorageResult<u64> {
        let result = proxies::Entity::update_many()
            .col_expr(proxies::Column::Active, Expr::value(true))
            .col_expr(proxies::Column::FailStreak, Expr::value(0))
            .filter(proxies::Column::OwnerId.eq(owner.get()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }
}

async fn lock_proxy(txn: &DatabaseTransaction, id: ProxyId) -> StorageResult<Option<ProxyRecord>> {
    let maybe = proxies::Entity::find_by_id(id.get())
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(StorageError::from_source)?;
    maybe.map(proxy_to_record).transpose()
}

async fn write_health(txn: &DatabaseTransaction, record: &ProxyRecord) -> StorageResult<()> {
    proxies::Entity::update_many()
        .col_expr(proxies::Column::Used, Expr::value(record.used as i64))
        .col_expr(proxies::Column::Success, Expr::value(record.success as i64))
        .col_expr(
            proxies::Column::FailStreak,
            Expr::value(record.fail_streak as i32),
        )
        .col_expr(proxies::Column::Active, Expr::value(record.active))
        .col_expr(
            proxies::Column::CooldownUntil,
            Expr::value(record.cooldown_until),
        )
        .col_expr(proxies::Column::LastChecked, Expr::value(record.last_checked))
        .filter(proxies::Column::Id.eq(record.id.get()))
        .exec(txn)
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}

fn proxy_to_record(model: proxies::Model) -> StorageResult<ProxyRecord> {
    let scheme: ProxyScheme = model
        .scheme
        .parse()
        .map_err(|_| corrupt("proxies.scheme", &model.scheme))?;
    let port = u16::try_from(model.port).map_err(|_| corrupt("proxies.port", model.port))?;

    Ok(ProxyRecord {
        id: ProxyId::new(model.id),
        owner: UserId::new(model.owner_id),
        scheme,
        host: model.host,
        port,
        username: model.username,
        password_cipher: model.password_cipher,
        active: model.active,
        priority: model.priority.clamp(1, 10) as u8,
        used: model.used.max(0) as u64,
        success: model.success.max(0) as u64,
        fail_streak: model.fail_streak.max(0) as u32,
        cooldown_until: model.cooldown_until,
        last_checked: model.last_checked,
        created_at: model.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_storage, now, seed_user};
    use chrono::Duration;
    use handle_watch_domain::cooldown_duration;

    fn new_proxy(owner: UserId, host: &str) -> NewProxy {
        NewProxy {
            owner,
            scheme: ProxyScheme::Http,
            host: host.into(),
            port: 8080,
            username: Some("bob".into()),
            password_cipher: Some(b"cipher".to_vec()),
            priority: 5,
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn duplicate_endpoints_are_skipped() {
        let storage = memory_storage().await;
        let owner = seed_user(&storage, 1).await;
        let created = storage
            .insert_proxy(new_proxy(owner, "10.0.0.1"))
            .await
            .unwrap()
            .expect("first insert");
        assert_eq!(created.username.as_deref(), Some("bob"));
        assert!(storage
            .insert_proxy(new_proxy(owner, "10.0.0.1"))
            .await
            .unwrap()
            .is_none());

        let other_owner = seed_user(&storage, 2).await;
        assert!(storage
            .insert_proxy(new_proxy(other_owner, "10.0.0.1"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failures_cool_down_then_deactivate() {
        let storage = memory_storage().await;
        let owner = seed_user(&storage, 1).await;
        let proxy = storage
            .insert_proxy(new_proxy(owner, "10.0.0.1"))
            .await
            .unwrap()
            .unwrap();

        for _ in 0..2 {
            storage.record_proxy_failure(proxy.id, now(), true).await.unwrap();
        }
        let (record, effect) = storage
            .record_proxy_failure(proxy.id, now(), true)
            .await
            .unwrap()
            .unwrap();
        assert!(effect.cooled_down);
        assert!(record.cooldown_until.unwrap() >= now() + cooldown_duration());
        assert!(storage
            .list_available_proxies(owner, now())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            storage
                .list_available_proxies(owner, now() + Duration::minutes(16))
                .await
                .unwrap()
                .len(),
            1
        );

        for _ in 0..2 {
            storage.record_proxy_failure(proxy.id, now(), true).await.unwrap();
        }
        let stored = storage.find_proxy(proxy.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.fail_streak, 5);
        assert_eq!(stored.used, 5);
    }

    #[tokio::test]
    async fn success_clears_health_counters() {
        let storage = memory_storage().await;
        let owner = seed_user(&storage, 1).await;
        let proxy = storage
            .insert_proxy(new_proxy(owner, "10.0.0.1"))
            .await
            .unwrap()
            .unwrap();
        for _ in 0..3 {
            storage.record_proxy_failure(proxy.id, now(), true).await.unwrap();
        }
        let record = storage
            .record_proxy_success(proxy.id, now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.fail_streak, 0);
        assert!(record.cooldown_until.is_none());
        let stored = storage.find_proxy(proxy.id).await.unwrap().unwrap();
        assert_eq!(stored.success, 1);
        assert_eq!(stored.used, 4);
        assert!(stored.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn maintenance_operations() {
        let storage = memory_storage().await;
        let owner = seed_user(&storage, 1).await;
        let a = storage
            .insert_proxy(new_proxy(owner, "10.0.0.1"))
            .await
            .unwrap()
            .unwrap();
        let b = storage
            .insert_proxy(new_proxy(owner, "10.0.0.2"))
            .await
            .unwrap()
            .unwrap();
        for _ in 0..3 {
            storage.record_proxy_failure(a.id, now(), true).await.unwrap();
        }
        for _ in 0..5 {
            storage.record_proxy_failure(b.id, now(), false).await.unwrap();
        }

        let later = now() + Duration::minutes(20);
        assert_eq!(storage.release_expired_cooldowns(later).await.unwrap(), 1);
        assert!(storage
            .find_proxy(a.id)
            .await
            .unwrap()
            .unwrap()
            .cooldown_until
            .is_none());

        for _ in 0..3 {
            storage.record_proxy_failure(a.id, now(), true).await.unwrap();
        }
        assert_eq!(storage.reset_cooldowns(owner).await.unwrap(), 1);

        assert_eq!(storage.reactivate_proxies(owner).await.unwrap(), 2);
        let revived = storage.find_proxy(b.id).await.unwrap().unwrap();
        assert!(revived.active);
        assert_eq!(revived.fail_streak, 0);
    }
}
