//! Per-user proxy pool: selection, health bookkeeping, liveness checks and
//! imports. Counters live in the proxies table; this type only decides.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use handle_watch_domain::{
    parse_proxy_batch, Clock, ParsedProxy, ProxyId, ProxyLineError, ProxyRecord, ProxyScheme,
    ProxyStats, Repositories, StorageResult, UserId, NewProxy, DEFAULT_PROXY_PRIORITY,
};
use metrics::counter;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{client::proxied_client, secret::SecretBox, EngineError};

/// Probability of an exploratory uniform pick under [`SelectionStrategy::Adaptive`].
pub const EXPLORATION_RATE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Lowest priority value, ties broken by longest idle.
    Priority,
    Random,
    LeastUsed,
    #[default]
    Adaptive,
}

/// Connection details of a proxy with the password already decrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    /// Credential-free URL; credentials are attached separately.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl std::fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("url", &self.url())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub added: usize,
    pub skipped: usize,
    pub errors: Vec<ProxyLineError>,
}

#[derive(Debug, Deserialize)]
struct EchoBody {
    origin: String,
}

pub struct ProxyPool {
    repos: Arc<dyn Repositories>,
    clock: Arc<dyn Clock>,
    secrets: Arc<dyn SecretBox>,
    rng: Mutex<StdRng>,
    echo_url: String,
    liveness_timeout: Duration,
}

impl ProxyPool {
    pub fn new(
        repos: Arc<dyn Repositories>,
        clock: Arc<dyn Clock>,
        secrets: Arc<dyn SecretBox>,
        echo_url: impl Into<String>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            repos,
            clock,
            secrets,
            rng: Mutex::new(StdRng::from_entropy()),
            echo_url: echo_url.into(),
            liveness_timeout,
        }
    }

    /// Fixes the RNG so selection is reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub async fn acquire(
        &self,
        owner: UserId,
        exclude: &[ProxyId],
        strategy: SelectionStrategy,
    ) -> StorageResult<Option<ProxyRecord>> {
        let now = self.clock.now();
        let candidates: Vec<ProxyRecord> = self
            .repos
            .list_available_proxies(owner, now)
            .await?
            .into_iter()
            .filter(|proxy| !exclude.contains(&proxy.id))
            .collect();
        Ok(self.select(&candidates, strategy).cloned())
    }

    /// Up to `n` distinct proxies, each drawn with `strategy` from what is
    /// left after the previous draws.
    pub async fn draw(
        &self,
        owner: UserId,
        n: usize,
        strategy: SelectionStrategy,
    ) -> StorageResult<Vec<ProxyRecord>> {
        let now = self.clock.now();
        let mut candidates = self.repos.list_available_proxies(owner, now).await?;
        let mut drawn = Vec::with_capacity(n.min(candidates.len()));
        while drawn.len() < n {
            let Some(picked) = self.select(&candidates, strategy).map(|proxy| proxy.id) else {
                break;
            };
            if let Some(index) = candidates.iter().position(|proxy| proxy.id == picked) {
                drawn.push(candidates.swap_remove(index));
            }
        }
        Ok(drawn)
    }

    pub async fn available_count(&self, owner: UserId) -> StorageResult<usize> {
        let now = self.clock.now();
        Ok(self.repos.list_available_proxies(owner, now).await?.len())
    }

    pub fn select<'a>(
        &self,
        candidates: &'a [ProxyRecord],
        strategy: SelectionStrategy,
    ) -> Option<&'a ProxyRecord> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match strategy {
            SelectionStrategy::Priority => candidates.iter().min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    // `None` sorts first: never used means idle the longest.
                    .then_with(|| a.last_checked.cmp(&b.last_checked))
            }),
            SelectionStrategy::Random => candidates.choose(&mut *rng),
            SelectionStrategy::LeastUsed => candidates.iter().min_by_key(|proxy| proxy.used),
            SelectionStrategy::Adaptive => {
                if rng.gen_bool(EXPLORATION_RATE) {
                    return candidates.choose(&mut *rng);
                }
                let max_used = candidates.iter().map(|proxy| proxy.used).max().unwrap_or(0);
                candidates.iter().max_by(|a, b| {
                    a.adaptive_score(max_used)
                        .total_cmp(&b.adaptive_score(max_used))
                        // Equal scores prefer the lower id.
                        .then_with(|| b.id.cmp(&a.id))
                })
            }
        }
    }

    pub async fn mark_success(&self, id: ProxyId) -> StorageResult<Option<ProxyRecord>> {
        let updated = self.repos.record_proxy_success(id, self.clock.now()).await?;
        if updated.is_some() {
            counter!("proxy_pool_events_total", "event" => "success").increment(1);
        }
        Ok(updated)
    }

    pub async fn mark_failure(
        &self,
        id: ProxyId,
        apply_cooldown: bool,
    ) -> StorageResult<Option<ProxyRecord>> {
        let Some((record, effect)) = self
            .repos
            .record_proxy_failure(id, self.clock.now(), apply_cooldown)
            .await?
        else {
            return Ok(None);
        };

        counter!("proxy_pool_events_total", "event" => "failure").increment(1);
        if effect.cooled_down {
            counter!("proxy_pool_events_total", "event" => "cooldown").increment(1);
            info!(
                proxy_id = %record.id,
                fail_streak = record.fail_streak,
                "proxy placed in cooldown"
            );
        }
        if effect.deactivated {
            counter!("proxy_pool_events_total", "event" => "deactivated").increment(1);
            warn!(
                proxy_id = %record.id,
                fail_streak = record.fail_streak,
                "proxy deactivated after consecutive failures"
            );
        }
        Ok(Some(record))
    }

    pub async fn release_expired_cooldowns(&self) -> StorageResult<u64> {
        let released = self.repos.release_expired_cooldowns(self.clock.now()).await?;
        if released > 0 {
            debug!(released, "released expired proxy cooldowns");
        }
        Ok(released)
    }

    pub async fn reset_cooldowns(&self, owner: UserId) -> StorageResult<u64> {
        self.repos.reset_cooldowns(owner).await
    }

    pub async fn reactivate_all(&self, owner: UserId) -> StorageResult<u64> {
        self.repos.reactivate_proxies(owner).await
    }

    pub async fn stats(&self, owner: UserId) -> StorageResult<ProxyStats> {
        let proxies = self.repos.list_proxies(owner).await?;
        Ok(ProxyStats::collect(&proxies, self.clock.now()))
    }

    pub fn endpoint(&self, proxy: &ProxyRecord) -> Result<ProxyEndpoint, EngineError> {
        let password = proxy
            .password_cipher
            .as_deref()
            .map(|cipher| self.secrets.decrypt(cipher))
            .transpose()?;
        Ok(ProxyEndpoint {
            scheme: proxy.scheme,
            host: proxy.host.clone(),
            port: proxy.port,
            username: proxy.username.clone(),
            password,
        })
    }

    /// One GET to the echo endpoint through `proxy`. Alive means status 200
    /// and an origin that mentions the proxy host.
    pub async fn test_liveness(&self, proxy: &ProxyRecord) -> bool {
        let endpoint = match self.endpoint(proxy) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(proxy_id = %proxy.id, error = %err, "cannot decrypt proxy credentials");
                return false;
            }
        };
        let client = match proxied_client(&endpoint, self.liveness_timeout) {
            Ok(client) => client,
            Err(err) => {
                warn!(proxy_id = %proxy.id, error = %err, "cannot build proxied client");
                return false;
            }
        };

        let response = match client.get(&self.echo_url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(proxy_id = %proxy.id, error = %err, "liveness request failed");
                return false;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            debug!(proxy_id = %proxy.id, status = %response.status(), "liveness non-200");
            return false;
        }
        match response.json::<EchoBody>().await {
            Ok(body) => origin_matches(&body.origin, &proxy.host),
            Err(err) => {
                debug!(proxy_id = %proxy.id, error = %err, "liveness body unreadable");
                false
            }
        }
    }

    /// Checks every proxy of the owner and records the results without
    /// applying cooldowns. Returns `(alive, dead)`.
    pub async fn test_all(&self, owner: UserId) -> StorageResult<(usize, usize)> {
        let proxies = self.repos.list_proxies(owner).await?;
        let mut alive = 0;
        let mut dead = 0;
        for proxy in proxies {
            if self.test_liveness(&proxy).await {
                self.mark_success(proxy.id).await?;
                alive += 1;
            } else {
                self.mark_failure(proxy.id, false).await?;
                dead += 1;
            }
        }
        info!(user_id = %owner, alive, dead, "proxy liveness sweep finished");
        Ok((alive, dead))
    }

    /// `Ok(None)` when the same endpoint is already registered.
    pub async fn add_proxy(
        &self,
        owner: UserId,
        parsed: ParsedProxy,
        priority: u8,
    ) -> Result<Option<ProxyRecord>, EngineError> {
        let password_cipher = parsed
            .password
            .as_deref()
            .map(|password| self.secrets.encrypt(password))
            .transpose()?;
        let proxy = NewProxy {
            owner,
            scheme: parsed.scheme,
            host: parsed.host,
            port: parsed.port,
            username: parsed.username,
            password_cipher,
            priority: priority.clamp(1, 10),
            created_at: self.clock.now(),
        };
        Ok(self.repos.insert_proxy(proxy).await?)
    }

    pub async fn import_batch(&self, owner: UserId, text: &str) -> Result<ImportReport, EngineError> {
        let (parsed, errors) = parse_proxy_batch(text);
        let mut report = ImportReport {
            errors,
            ..ImportReport::default()
        };
        for proxy in parsed {
            match self.add_proxy(owner, proxy, DEFAULT_PROXY_PRIORITY).await? {
                Some(_) => report.added += 1,
                None => report.skipped += 1,
            }
        }
        info!(
            user_id = %owner,
            added = report.added,
            skipped = report.skipped,
            errors = report.errors.len(),
            "proxy batch imported"
        );
        Ok(report)
    }
}

fn origin_matches(origin: &str, host: &str) -> bool {
    origin
        .split(',')
        .map(str::trim)
        .any(|ip| ip == host || ip.contains(host))
}
