use handle_watch_domain::model::{AccountId, NewReceipt, NotificationKind, ReceiptRecord, UserId};
use handle_watch_domain::storage::{ReceiptStore, StorageResult};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};

use crate::entity::notification_receipts;
use crate::errors::{corrupt, StorageError};
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl ReceiptStore for SeaOrmStorage {
    async fn try_insert_receipt(&self, receipt: NewReceipt) -> StorageResult<bool> {
        let model = notification_receipts::ActiveModel {
            owner_id: Set(receipt.owner.get()),
            account_id: Set(receipt.account.get()),
            kind: Set(receipt.kind.as_str().to_string()),
            sent_on: Set(receipt.sent_on),
            created_at: Set(receipt.created_at),
            ..Default::default()
        };
        let inserted = notification_receipts::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    notification_receipts::Column::OwnerId,
                    notification_receipts::Column::AccountId,
                    notification_receipts::Column::Kind,
                    notification_receipts::Column::SentOn,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(inserted == 1)
    }

    async fn list_receipts(&self, owner: UserId) -> StorageResult<Vec<ReceiptRecord>> {
        notification_receipts::Entity::find()
            .filter(notification_receipts::Column::OwnerId.eq(owner.get()))
            .order_by_asc(notification_receipts::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(|model| {
                let kind = NotificationKind::parse(&model.kind)
                    .ok_or_else(|| corrupt("notification_receipts.kind", &model.kind))?;
                Ok(ReceiptRecord {
                    id: model.id,
                    owner: UserId::new(model.owner_id),
                    account: AccountId::new(model.account_id),
                    kind,
                    sent_on: model.sent_on,
                    created_at: model.created_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_storage, now, seed_user, today};
    use chrono::Duration;

    fn receipt(owner: UserId, kind: NotificationKind, day_offset: i64) -> NewReceipt {
        NewReceipt {
            owner,
            account: AccountId::new(11),
            kind,
            sent_on: today() + Duration::days(day_offset),
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn first_insert_wins_per_day_and_kind() {
        let storage = memory_storage().await;
        let owner = seed_user(&storage, 1).await;

        assert!(storage
            .try_insert_receipt(receipt(owner, NotificationKind::ExpiringSoon, 0))
            .await
            .unwrap());
        assert!(!storage
            .try_insert_receipt(receipt(owner, NotificationKind::ExpiringSoon, 0))
            .await
            .unwrap());
        assert!(storage
            .try_insert_receipt(receipt(owner, NotificationKind::Expired, 0))
            .await
            .unwrap());
        assert!(storage
            .try_insert_receipt(receipt(owner, NotificationKind::ExpiringSoon, 1))
            .await
            .unwrap());

        let stored = storage.list_receipts(owner).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].kind, NotificationKind::ExpiringSoon);
    }
}
