use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::model::{
    AccountId, AccountRecord, ApiKeyId, ApiKeyRecord, FailureEffect, NewAccount, NewApiKey,
    NewProxy, NewReceipt, NewUser, ProxyId, ProxyRecord, ReceiptRecord, UserId, UserRecord,
    VerifyMode,
};

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

/// Outcome of a key draw: the selected key (if any) plus how many stale
/// keys were reset to zero on the way.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiKeyDraw {
    pub key: Option<ApiKeyRecord>,
    pub resets: u32,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts the user or returns the existing row untouched.
    async fn upsert_user(&self, user: NewUser) -> StorageResult<UserRecord>;
    async fn find_user(&self, id: UserId) -> StorageResult<Option<UserRecord>>;
    /// Active users with auto-check switched on.
    async fn list_auto_check_users(&self) -> StorageResult<Vec<UserRecord>>;
    async fn list_active_users(&self) -> StorageResult<Vec<UserRecord>>;
    async fn update_user_schedule(
        &self,
        id: UserId,
        interval_minutes: u32,
        auto_check_enabled: bool,
    ) -> StorageResult<Option<UserRecord>>;
    async fn set_verify_mode(&self, id: UserId, mode: VerifyMode) -> StorageResult<bool>;
    async fn set_user_active(&self, id: UserId, active: bool) -> StorageResult<bool>;
    /// Without `cascade`, a user that still owns accounts is a conflict.
    async fn delete_user(&self, id: UserId, cascade: bool) -> StorageResult<bool>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `Conflict` when the owner already has a pending account
    /// with the same handle.
    async fn insert_account(&self, account: NewAccount) -> StorageResult<AccountRecord>;
    async fn find_account(&self, id: AccountId) -> StorageResult<Option<AccountRecord>>;
    /// Pending accounts ordered by `start_at` ascending.
    async fn list_pending_accounts(&self, owner: UserId) -> StorageResult<Vec<AccountRecord>>;
    async fn list_accounts(&self, owner: UserId) -> StorageResult<Vec<AccountRecord>>;
    /// Transitions a pending account to done. Returns `false` when the account
    /// was already done or does not exist.
    async fn mark_account_done(&self, id: AccountId, finished_on: NaiveDate)
        -> StorageResult<bool>;
    async fn delete_account(&self, id: AccountId) -> StorageResult<bool>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert_api_key(&self, key: NewApiKey) -> StorageResult<ApiKeyRecord>;
    async fn list_api_keys(&self, owner: UserId) -> StorageResult<Vec<ApiKeyRecord>>;
    /// First working key in creation order with uses left today, skipping
    /// `exclude`. Stale keys observed during the scan are reset.
    async fn next_api_key(
        &self,
        owner: UserId,
        today: NaiveDate,
        limit: u32,
        exclude: &[ApiKeyId],
    ) -> StorageResult<ApiKeyDraw>;
    async fn record_api_key_use(
        &self,
        id: ApiKeyId,
        today: NaiveDate,
    ) -> StorageResult<Option<ApiKeyRecord>>;
    async fn mark_api_key_exhausted(
        &self,
        id: ApiKeyId,
        today: NaiveDate,
        limit: u32,
    ) -> StorageResult<bool>;
    async fn mark_api_key_broken(&self, id: ApiKeyId) -> StorageResult<bool>;
}

#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Returns `None` when `(owner, scheme, host, port)` already exists.
    async fn insert_proxy(&self, proxy: NewProxy) -> StorageResult<Option<ProxyRecord>>;
    async fn find_proxy(&self, id: ProxyId) -> StorageResult<Option<ProxyRecord>>;
    async fn list_proxies(&self, owner: UserId) -> StorageResult<Vec<ProxyRecord>>;
    async fn list_available_proxies(
        &self,
        owner: UserId,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<ProxyRecord>>;
    async fn record_proxy_success(
        &self,
        id: ProxyId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ProxyRecord>>;
    async fn record_proxy_failure(
        &self,
        id: ProxyId,
        now: DateTime<Utc>,
        apply_cooldown: bool,
    ) -> StorageResult<Option<(ProxyRecord, FailureEffect)>>;
    async fn release_expired_cooldowns(&self, now: DateTime<Utc>) -> StorageResult<u64>;
    async fn reset_cooldowns(&self, owner: UserId) -> StorageResult<u64>;
    /// Sets `active = true` and clears the failure streak for every proxy of
    /// the owner.
    async fn reactivate_proxies(&self, owner: UserId) -> StorageResult<u64>;
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Insert-or-skip under the `(owner, account, kind, sent_on)` uniqueness
    /// rule. `true` means this caller won and should send.
    async fn try_insert_receipt(&self, receipt: NewReceipt) -> StorageResult<bool>;
    async fn list_receipts(&self, owner: UserId) -> StorageResult<Vec<ReceiptRecord>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>>;
    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<()>;
}

/// Everything the engine needs from persistence, as one object.
pub trait Repositories:
    UserStore + AccountStore + ApiKeyStore + ProxyStore + ReceiptStore + SettingsStore
{
}

impl<T> Repositories for T where
    T: UserStore + AccountStore + ApiKeyStore + ProxyStore + ReceiptStore + SettingsStore
{
}
