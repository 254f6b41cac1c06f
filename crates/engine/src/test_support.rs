//! In-memory doubles for engine tests.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use handle_watch_domain::{
    AccountId, AccountRecord, AccountStore, ApiKeyDraw, ApiKeyId, ApiKeyRecord, ApiKeyStore,
    FailureEffect, NewAccount, NewApiKey, NewProxy, NewReceipt, NewUser, ProxyId, ProxyRecord,
    ProxyScheme, ProxyStore, ReceiptRecord, ReceiptStore, SettingsStore, StorageError,
    StorageResult, UserId, UserRecord, UserStore, VerifyMode,
};

use crate::{
    notifier::{InlineButton, Notifier, NotifyError},
    pipeline::{artifact::PNG_SIGNATURE, RenderError, RenderRequest, RenderVerdict, ProfileRenderer},
    provider::{LookupResult, ProfileProvider, ProviderError},
};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
}

pub fn proxy(id: i64, priority: u8) -> ProxyRecord {
    ProxyRecord {
        id: ProxyId::new(id),
        owner: UserId::new(1),
        scheme: ProxyScheme::Http,
        host: format!("10.0.0.{id}"),
        port: 8080,
        username: None,
        password_cipher: None,
        active: true,
        priority,
        used: 0,
        success: 0,
        fail_streak: 0,
        cooldown_until: None,
        last_checked: None,
        created_at: now(),
    }
}

pub fn api_key(id: i64, used_today: u32) -> ApiKeyRecord {
    ApiKeyRecord {
        id: ApiKeyId::new(id),
        owner: UserId::new(1),
        secret: format!("key-{id}"),
        used_today,
        ref_day: today(),
        working: true,
        created_at: now(),
    }
}

pub fn user(id: i64) -> UserRecord {
    UserRecord {
        id: UserId::new(id),
        role: handle_watch_domain::UserRole::User,
        active: true,
        check_interval_minutes: 5,
        auto_check_enabled: true,
        verify_mode: VerifyMode::default().as_tag().to_string(),
        created_at: now(),
    }
}

pub fn account(id: i64, owner: i64, handle: &str) -> AccountRecord {
    AccountRecord {
        id: AccountId::new(id),
        owner: UserId::new(owner),
        handle: handle.to_string(),
        start_at: now(),
        start_on: today(),
        period_days: 30,
        finished_on: None,
        done: false,
    }
}

#[derive(Default)]
struct State {
    users: Vec<UserRecord>,
    accounts: Vec<AccountRecord>,
    keys: Vec<ApiKeyRecord>,
    proxies: Vec<ProxyRecord>,
    receipts: Vec<ReceiptRecord>,
    settings: Vec<(String, String)>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Repository double; every method is atomic under one lock.
#[derive(Default)]
pub struct MemoryRepos {
    state: Mutex<State>,
}

impl MemoryRepos {
    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn put_user(&self, record: UserRecord) {
        self.with(|state| {
            state.users.retain(|user| user.id != record.id);
            state.users.push(record);
        });
    }

    pub fn put_account(&self, record: AccountRecord) {
        self.with(|state| {
            state.next_id = state.next_id.max(record.id.get());
            state.accounts.push(record);
        });
    }

    pub fn put_api_key(&self, record: ApiKeyRecord) {
        self.with(|state| {
            state.next_id = state.next_id.max(record.id.get());
            state.keys.push(record);
        });
    }

    pub fn put_proxy(&self, record: ProxyRecord) {
        self.with(|state| {
            state.next_id = state.next_id.max(record.id.get());
            state.proxies.push(record);
        });
    }

    pub fn account(&self, id: i64) -> AccountRecord {
        self.with(|state| {
            state
                .accounts
                .iter()
                .find(|account| account.id.get() == id)
                .cloned()
                .unwrap()
        })
    }

    pub fn receipt_count(&self) -> usize {
        self.with(|state| state.receipts.len())
    }
}

#[async_trait]
impl UserStore for MemoryRepos {
    async fn upsert_user(&self, user: NewUser) -> StorageResult<UserRecord> {
        Ok(self.with(|state| {
            if let Some(existing) = state.users.iter().find(|record| record.id == user.id) {
                return existing.clone();
            }
            let record = UserRecord {
                id: user.id,
                role: user.role,
                active: true,
                check_interval_minutes: user.check_interval_minutes,
                auto_check_enabled: user.auto_check_enabled,
                verify_mode: user.verify_mode.as_tag().to_string(),
                created_at: user.created_at,
            };
            state.users.push(record.clone());
            record
        }))
    }

    async fn find_user(&self, id: UserId) -> StorageResult<Option<UserRecord>> {
        Ok(self.with(|state| state.users.iter().find(|user| user.id == id).cloned()))
    }

    async fn list_auto_check_users(&self) -> StorageResult<Vec<UserRecord>> {
        Ok(self.with(|state| {
            state
                .users
                .iter()
                .filter(|user| user.wants_auto_check())
                .cloned()
                .collect()
        }))
    }

    async fn list_active_users(&self) -> StorageResult<Vec<UserRecord>> {
        Ok(self.with(|state| state.users.iter().filter(|user| user.active).cloned().collect()))
    }

    async fn update_user_schedule(
        &self,
        id: UserId,
        interval_minutes: u32,
        auto_check_enabled: bool,
    ) -> StorageResult<Option<UserRecord>> {
        Ok(self.with(|state| {
            let user = state.users.iter_mut().find(|user| user.id == id)?;
            user.check_interval_minutes = interval_minutes;
            user.auto_check_enabled = auto_check_enabled;
            Some(user.clone())
        }))
    }

    async fn set_verify_mode(&self, id: UserId, mode: VerifyMode) -> StorageResult<bool> {
        Ok(self.with(|state| match state.users.iter_mut().find(|user| user.id == id) {
            Some(user) => {
                user.verify_mode = mode.as_tag().to_string();
                true
            }
            None => false,
        }))
    }

    async fn set_user_active(&self, id: UserId, active: bool) -> StorageResult<bool> {
        Ok(self.with(|state| match state.users.iter_mut().find(|user| user.id == id) {
            Some(user) => {
                user.active = active;
                true
            }
            None => false,
        }))
    }

    async fn delete_user(&self, id: UserId, cascade: bool) -> StorageResult<bool> {
        self.with(|state| {
            if !cascade && state.accounts.iter().any(|account| account.owner == id) {
                return Err(StorageError::Conflict(format!("user {id} still owns accounts")));
            }
            let before = state.users.len();
            state.users.retain(|user| user.id != id);
            state.accounts.retain(|account| account.owner != id);
            state.keys.retain(|key| key.owner != id);
            state.proxies.retain(|proxy| proxy.owner != id);
            state.receipts.retain(|receipt| receipt.owner != id);
            Ok(state.users.len() != before)
        })
    }
}

#[async_trait]
impl AccountStore for MemoryRepos {
    async fn insert_account(&self, account: NewAccount) -> StorageResult<AccountRecord> {
        self.with(|state| {
            if state
                .accounts
                .iter()
                .any(|row| row.owner == account.owner && row.handle == account.handle && !row.done)
            {
                return Err(StorageError::Conflict(account.handle.clone()));
            }
            let record = AccountRecord {
                id: AccountId::new(state.next_id()),
                owner: account.owner,
                handle: account.handle,
                start_at: account.start_at,
                start_on: account.start_on,
                period_days: account.period_days,
                finished_on: None,
                done: false,
            };
            state.accounts.push(record.clone());
            Ok(record)
        })
    }

    async fn find_account(&self, id: AccountId) -> StorageResult<Option<AccountRecord>> {
        Ok(self.with(|state| state.accounts.iter().find(|row| row.id == id).cloned()))
    }

    async fn list_pending_accounts(&self, owner: UserId) -> StorageResult<Vec<AccountRecord>> {
        Ok(self.with(|state| {
            let mut rows: Vec<_> = state
                .accounts
                .iter()
                .filter(|row| row.owner == owner && !row.done)
                .cloned()
                .collect();
            rows.sort_by_key(|row| (row.start_at, row.id));
            rows
        }))
    }

    async fn list_accounts(&self, owner: UserId) -> StorageResult<Vec<AccountRecord>> {
        Ok(self.with(|state| {
            state
                .accounts
                .iter()
                .filter(|row| row.owner == owner)
                .cloned()
                .collect()
        }))
    }

    async fn mark_account_done(
        &self,
        id: AccountId,
        finished_on: NaiveDate,
    ) -> StorageResult<bool> {
        Ok(self.with(|state| {
            match state.accounts.iter_mut().find(|row| row.id == id && !row.done) {
                Some(row) => {
                    row.done = true;
                    row.finished_on = Some(finished_on);
                    true
                }
                None => false,
            }
        }))
    }

    async fn delete_account(&self, id: AccountId) -> StorageResult<bool> {
        Ok(self.with(|state| {
            let before = state.accounts.len();
            state.accounts.retain(|row| row.id != id);
            state.accounts.len() != before
        }))
    }
}

#[async_trait]
impl ApiKeyStore for MemoryRepos {
    async fn insert_api_key(&self, key: NewApiKey) -> StorageResult<ApiKeyRecord> {
        Ok(self.with(|state| {
            let record = ApiKeyRecord {
                id: ApiKeyId::new(state.next_id()),
                owner: key.owner,
                secret: key.secret,
                used_today: 0,
                ref_day: key.created_on,
                working: true,
                created_at: key.created_at,
            };
            state.keys.push(record.clone());
            record
        }))
    }

    async fn list_api_keys(&self, owner: UserId) -> StorageResult<Vec<ApiKeyRecord>> {
        Ok(self.with(|state| {
            let mut keys: Vec<_> = state
                .keys
                .iter()
                .filter(|key| key.owner == owner)
                .cloned()
                .collect();
            keys.sort_by_key(|key| key.id);
            keys
        }))
    }

    async fn next_api_key(
        &self,
        owner: UserId,
        today: NaiveDate,
        limit: u32,
        exclude: &[ApiKeyId],
    ) -> StorageResult<ApiKeyDraw> {
        Ok(self.with(|state| {
            state.keys.sort_by_key(|key| key.id);
            let mut draw = ApiKeyDraw::default();
            for key in state
                .keys
                .iter_mut()
                .filter(|key| key.owner == owner && key.working && !exclude.contains(&key.id))
            {
                if key.normalize_for(today) {
                    draw.resets += 1;
                }
                if key.is_available(limit) {
                    draw.key = Some(key.clone());
                    break;
                }
            }
            draw
        }))
    }

    async fn record_api_key_use(
        &self,
        id: ApiKeyId,
        today: NaiveDate,
    ) -> StorageResult<Option<ApiKeyRecord>> {
        Ok(self.with(|state| {
            let key = state.keys.iter_mut().find(|key| key.id == id)?;
            key.normalize_for(today);
            key.used_today += 1;
            Some(key.clone())
        }))
    }

    async fn mark_api_key_exhausted(
        &self,
        id: ApiKeyId,
        today: NaiveDate,
        limit: u32,
    ) -> StorageResult<bool> {
        Ok(self.with(|state| match state.keys.iter_mut().find(|key| key.id == id) {
            Some(key) => {
                key.used_today = limit;
                key.ref_day = today;
                true
            }
            None => false,
        }))
    }

    async fn mark_api_key_broken(&self, id: ApiKeyId) -> StorageResult<bool> {
        Ok(self.with(|state| match state.keys.iter_mut().find(|key| key.id == id) {
            Some(key) => {
                key.working = false;
                true
            }
            None => false,
        }))
    }
}

#[async_trait]
impl ProxyStore for MemoryRepos {
    async fn insert_proxy(&self, proxy: NewProxy) -> StorageResult<Option<ProxyRecord>> {
        Ok(self.with(|state| {
            if state.proxies.iter().any(|row| {
                row.owner == proxy.owner
                    && row.scheme == proxy.scheme
                    && row.host == proxy.host
                    && row.port == proxy.port
            }) {
                return None;
            }
            let record = ProxyRecord {
                id: ProxyId::new(state.next_id()),
                owner: proxy.owner,
                scheme: proxy.scheme,
                host: proxy.host,
                port: proxy.port,
                username: proxy.username,
                password_cipher: proxy.password_cipher,
                active: true,
                priority: proxy.priority,
                used: 0,
                success: 0,
                fail_streak: 0,
                cooldown_until: None,
                last_checked: None,
                created_at: proxy.created_at,
            };
            state.proxies.push(record.clone());
            Some(record)
        }))
    }

    async fn find_proxy(&self, id: ProxyId) -> StorageResult<Option<ProxyRecord>> {
        Ok(self.with(|state| state.proxies.iter().find(|row| row.id == id).cloned()))
    }

    async fn list_proxies(&self, owner: UserId) -> StorageResult<Vec<ProxyRecord>> {
        Ok(self.with(|state| {
            state
                .proxies
                .iter()
                .filter(|row| row.owner == owner)
                .cloned()
                .collect()
        }))
    }

    async fn list_available_proxies(
        &self,
        owner: UserId,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<ProxyRecord>> {
        Ok(self.with(|state| {
            state
                .proxies
                .iter()
                .filter(|row| row.owner == owner && row.is_available(now))
                .cloned()
                .collect()
        }))
    }

    async fn record_proxy_success(
        &self,
        id: ProxyId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ProxyRecord>> {
        Ok(self.with(|state| {
            let row = state.proxies.iter_mut().find(|row| row.id == id)?;
            row.apply_success(now);
            Some(row.clone())
        }))
    }

    async fn record_proxy_failure(
        &self,
        id: ProxyId,
        now: DateTime<Utc>,
        apply_cooldown: bool,
    ) -> StorageResult<Option<(ProxyRecord, FailureEffect)>> {
        Ok(self.with(|state| {
            let row = state.proxies.iter_mut().find(|row| row.id == id)?;
            let effect = row.apply_failure(now, apply_cooldown);
            Some((row.clone(), effect))
        }))
    }

    async fn release_expired_cooldowns(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        Ok(self.with(|state| {
            let mut released = 0;
            for row in state.proxies.iter_mut() {
                if row.cooldown_until.is_some_and(|until| until <= now) {
                    row.cooldown_until = None;
                    released += 1;
                }
            }
            released
        }))
    }

    async fn reset_cooldowns(&self, owner: UserId) -> StorageResult<u64> {
        Ok(self.with(|state| {
            let mut reset = 0;
            for row in state.proxies.iter_mut().filter(|row| row.owner == owner) {
                if row.cooldown_until.take().is_some() {
                    reset += 1;
                }
            }
            reset
        }))
    }

    async fn reactivate_proxies(&self, owner: UserId) -> StorageResult<u64> {
        Ok(self.with(|state| {
            let mut touched = 0;
            for row in state.proxies.iter_mut().filter(|row| row.owner == owner) {
                row.active = true;
                row.fail_streak = 0;
                touched += 1;
            }
            touched
        }))
    }
}

#[async_trait]
impl ReceiptStore for MemoryRepos {
    async fn try_insert_receipt(&self, receipt: NewReceipt) -> StorageResult<bool> {
        Ok(self.with(|state| {
            if state.receipts.iter().any(|row| {
                row.owner == receipt.owner
                    && row.account == receipt.account
                    && row.kind == receipt.kind
                    && row.sent_on == receipt.sent_on
            }) {
                return false;
            }
            let id = state.next_id();
            state.receipts.push(ReceiptRecord {
                id,
                owner: receipt.owner,
                account: receipt.account,
                kind: receipt.kind,
                sent_on: receipt.sent_on,
                created_at: receipt.created_at,
            });
            true
        }))
    }

    async fn list_receipts(&self, owner: UserId) -> StorageResult<Vec<ReceiptRecord>> {
        Ok(self.with(|state| {
            state
                .receipts
                .iter()
                .filter(|row| row.owner == owner)
                .cloned()
                .collect()
        }))
    }
}

#[async_trait]
impl SettingsStore for MemoryRepos {
    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.with(|state| {
            state
                .settings
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        }))
    }

    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with(|state| {
            state.settings.retain(|(name, _)| name != key);
            state.settings.push((key.to_string(), value.to_string()));
        });
        Ok(())
    }
}

/// Replies are consumed in push order; an empty script yields a bad
/// response.
#[derive(Default)]
pub struct FakeProvider {
    replies: Mutex<VecDeque<Result<LookupResult, ProviderError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeProvider {
    pub fn push(&self, reply: Result<LookupResult, ProviderError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// `(secret, handle)` per lookup.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProfileProvider for FakeProvider {
    async fn lookup(&self, secret: &str, handle: &str) -> Result<LookupResult, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((secret.to_string(), handle.to_string()));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::BadResponse("unscripted".into())))
    }
}

/// Writes a small PNG for scripted `Profile` verdicts. An empty script
/// yields `MarkerTimeout`.
#[derive(Default)]
pub struct FakeRenderer {
    verdicts: Mutex<VecDeque<Result<RenderVerdict, RenderError>>>,
    requests: Mutex<Vec<RenderRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeRenderer {
    pub fn push(&self, verdict: Result<RenderVerdict, RenderError>) {
        self.verdicts.lock().unwrap().push_back(verdict);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<RenderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn write_png(path: &Path) {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(&[0, 0, 0, 13, b'I', b'H', b'D', b'R']);
    std::fs::write(path, bytes).unwrap();
}

#[async_trait]
impl ProfileRenderer for FakeRenderer {
    async fn render(&self, request: RenderRequest) -> Result<RenderVerdict, RenderError> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RenderVerdict::MarkerTimeout));
        if matches!(verdict, Ok(RenderVerdict::Profile)) {
            write_png(&request.output);
        }
        verdict
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text {
        user: UserId,
        text: String,
        buttons: Vec<InlineButton>,
    },
    Photo {
        user: UserId,
        path: PathBuf,
        caption: String,
    },
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_text(
        &self,
        user: UserId,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(Sent::Text {
            user,
            text: text.to_string(),
            buttons: buttons.to_vec(),
        });
        Ok(())
    }

    async fn send_photo(
        &self,
        user: UserId,
        path: &Path,
        caption: &str,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(Sent::Photo {
            user,
            path: path.to_path_buf(),
            caption: caption.to_string(),
        });
        Ok(())
    }
}
