//! Per-user API key rotation with a daily usage limit.

use std::sync::Arc;

use handle_watch_domain::{
    ApiKeyId, ApiKeyRecord, ApiKeyStatus, Clock, NewApiKey, Repositories, StorageResult, UserId,
};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::provider::{LookupResult, ProfileProvider};

/// Handle looked up by [`ApiKeyPool::test_key`]; any account known to exist.
pub const KNOWN_HANDLE: &str = "instagram";

pub struct ApiKeyPool {
    repos: Arc<dyn Repositories>,
    clock: Arc<dyn Clock>,
    limit: u32,
}

impl ApiKeyPool {
    pub fn new(repos: Arc<dyn Repositories>, clock: Arc<dyn Clock>, limit: u32) -> Self {
        Self {
            repos,
            clock,
            limit,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// First usable key in creation order, or `None` when every key is
    /// spent or broken for today.
    pub async fn next(
        &self,
        owner: UserId,
        exclude: &[ApiKeyId],
    ) -> StorageResult<Option<ApiKeyRecord>> {
        let draw = self
            .repos
            .next_api_key(owner, self.clock.today(), self.limit, exclude)
            .await?;
        if draw.resets > 0 {
            counter!("api_key_events_total", "event" => "reset").increment(u64::from(draw.resets));
            debug!(user_id = %owner, resets = draw.resets, "api keys reset for new day");
        }
        Ok(draw.key)
    }

    pub async fn record_use(&self, id: ApiKeyId) -> StorageResult<()> {
        if self
            .repos
            .record_api_key_use(id, self.clock.today())
            .await?
            .is_some()
        {
            counter!("api_key_events_total", "event" => "use").increment(1);
        }
        Ok(())
    }

    /// Spends the rest of today's allowance; the key revives tomorrow.
    pub async fn mark_exhausted(&self, id: ApiKeyId) -> StorageResult<()> {
        if self
            .repos
            .mark_api_key_exhausted(id, self.clock.today(), self.limit)
            .await?
        {
            counter!("api_key_events_total", "event" => "exhausted").increment(1);
            info!(key_id = %id, "api key exhausted for today");
        }
        Ok(())
    }

    pub async fn mark_broken(&self, id: ApiKeyId) -> StorageResult<()> {
        if self.repos.mark_api_key_broken(id).await? {
            counter!("api_key_events_total", "event" => "broken").increment(1);
            warn!(key_id = %id, "api key disabled");
        }
        Ok(())
    }

    pub async fn statuses(&self, owner: UserId) -> StorageResult<Vec<ApiKeyStatus>> {
        let today = self.clock.today();
        Ok(self
            .repos
            .list_api_keys(owner)
            .await?
            .iter()
            .map(|key| key.status(today, self.limit))
            .collect())
    }

    pub async fn add_key(&self, owner: UserId, secret: &str) -> StorageResult<ApiKeyRecord> {
        let now = self.clock.now();
        self.repos
            .insert_api_key(NewApiKey {
                owner,
                secret: secret.trim().to_string(),
                created_on: self.clock.local_date(now),
                created_at: now,
            })
            .await
    }

    /// One lookup of a known handle; `true` when the provider answered in
    /// its canonical shape.
    pub async fn test_key(&self, provider: &dyn ProfileProvider, secret: &str) -> bool {
        match provider.lookup(secret, KNOWN_HANDLE).await {
            Ok(LookupResult::Found(_)) | Ok(LookupResult::Miss) => true,
            Err(err) => {
                debug!(key = %handle_watch_domain::mask_secret(secret), error = %err, "api key test failed");
                false
            }
        }
    }
}
