//! Verification pipeline: Stage A (keyed API lookup) followed by Stage B
//! (proxy-routed browser render), combined into one [`Outcome`].

pub mod artifact;
pub mod fingerprint;
pub mod renderer;

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use handle_watch_domain::{
    ApiKeyId, Clock, ProxyRecord, StorageResult, UserId, VerifyMode,
};
use metrics::counter;
use rand::{rngs::StdRng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    api_key_pool::ApiKeyPool,
    provider::{LookupResult, ProfileProvider, ProfileSummary, ProviderError},
    proxy_pool::{ProxyPool, SelectionStrategy},
};

pub use artifact::{is_valid_png, ArtifactStore, ReservedArtifact};
pub use fingerprint::Fingerprint;
pub use renderer::{ProfileRenderer, RenderError, RenderRequest, RenderVerdict, WebDriverRenderer};

/// Upper bound for Stage B and for a whole pipeline call.
pub const PER_HANDLE_BUDGET: Duration = Duration::from_secs(5 * 60);

/// Extra time a renderer gets past its own deadline to tear down.
const RENDER_CLEANUP_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Found {
        profile: ProfileSummary,
        artifact: Option<PathBuf>,
    },
    NotFound,
    Indeterminate {
        reason: IndeterminateReason,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Found { .. } => "found",
            Self::NotFound => "not_found",
            Self::Indeterminate { .. } => "indeterminate",
        }
    }

    fn indeterminate(reason: IndeterminateReason) -> Self {
        Self::Indeterminate { reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndeterminateReason {
    AllKeysExhausted,
    NoProxiesAvailable,
    HandleMismatch { returned: String },
    Timeout,
    ProxyAttemptsFailed,
    ChallengeRequired,
    /// Every key answered, but only with throttling or non-canonical replies.
    ProviderUnavailable,
    /// Stage A found the profile, Stage B reported it missing.
    StagesDisagree,
}

impl IndeterminateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllKeysExhausted => "all_keys_exhausted",
            Self::NoProxiesAvailable => "no_proxies_available",
            Self::HandleMismatch { .. } => "handle_mismatch",
            Self::Timeout => "timeout",
            Self::ProxyAttemptsFailed => "proxy_attempts_failed",
            Self::ChallengeRequired => "challenge_required",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::StagesDisagree => "stages_disagree",
        }
    }

    /// Conditions the operator has to fix; retrying alone will not help.
    pub fn needs_operator(&self) -> bool {
        matches!(self, Self::AllKeysExhausted | Self::NoProxiesAvailable)
    }
}

/// Checks one handle on behalf of its owner. Storage failures propagate;
/// every other failure folds into [`Outcome::Indeterminate`].
#[async_trait]
pub trait AccountVerifier: Send + Sync {
    async fn verify(&self, owner: UserId, handle: &str, mode: VerifyMode) -> StorageResult<Outcome>;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub attempt_timeout: Duration,
    pub attempts_cap: usize,
    pub total_timeout: Duration,
    pub profile_base_url: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(60),
            attempts_cap: 3,
            total_timeout: PER_HANDLE_BUDGET,
            profile_base_url: "https://www.instagram.com".into(),
        }
    }
}

pub fn profile_url(base: &str, handle: &str) -> String {
    format!("{}/{}/", base.trim_end_matches('/'), handle)
}

enum StageA {
    Found(ProfileSummary),
    Miss,
    Failed(IndeterminateReason),
}

enum StageB {
    Profile(Option<PathBuf>),
    NotFound,
    Failed(IndeterminateReason),
}

enum Attempt {
    Profile(Option<PathBuf>),
    NotFound,
    Failed { challenge: bool, timed_out: bool },
}

impl Attempt {
    fn failed() -> Self {
        Self::Failed {
            challenge: false,
            timed_out: false,
        }
    }
}

pub struct VerificationPipeline {
    keys: Arc<ApiKeyPool>,
    proxies: Arc<ProxyPool>,
    provider: Arc<dyn ProfileProvider>,
    renderer: Arc<dyn ProfileRenderer>,
    artifacts: ArtifactStore,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
    rng: Mutex<StdRng>,
}

impl VerificationPipeline {
    pub fn new(
        keys: Arc<ApiKeyPool>,
        proxies: Arc<ProxyPool>,
        provider: Arc<dyn ProfileProvider>,
        renderer: Arc<dyn ProfileRenderer>,
        artifacts: ArtifactStore,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            keys,
            proxies,
            provider,
            renderer,
            artifacts,
            clock,
            settings,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    async fn run(&self, owner: UserId, handle: &str, mode: VerifyMode) -> StorageResult<Outcome> {
        let toggles = mode.stages();

        let profile = if toggles.stage_a {
            match self.stage_a(owner, handle).await? {
                StageA::Miss => return Ok(Outcome::NotFound),
                StageA::Failed(reason) => return Ok(Outcome::indeterminate(reason)),
                StageA::Found(profile) => Some(profile),
            }
        } else {
            None
        };

        if !toggles.stage_b {
            return Ok(match profile {
                Some(profile) => Outcome::Found {
                    profile,
                    artifact: None,
                },
                None => Outcome::indeterminate(IndeterminateReason::ProviderUnavailable),
            });
        }

        let outcome = match (profile, self.stage_b(owner, handle).await?) {
            (profile, StageB::Profile(artifact)) => Outcome::Found {
                profile: profile.unwrap_or_else(|| ProfileSummary::bare(handle)),
                artifact,
            },
            (Some(_), StageB::NotFound) if toggles.require_confirmation => {
                Outcome::indeterminate(IndeterminateReason::StagesDisagree)
            }
            (Some(profile), StageB::NotFound) => Outcome::Found {
                profile,
                artifact: None,
            },
            (None, StageB::NotFound) => Outcome::NotFound,
            (_, StageB::Failed(reason)) => Outcome::indeterminate(reason),
        };
        Ok(outcome)
    }

    async fn stage_a(&self, owner: UserId, handle: &str) -> StorageResult<StageA> {
        let mut tried: Vec<ApiKeyId> = Vec::new();
        let mut transient = 0usize;

        loop {
            let Some(key) = self.keys.next(owner, &tried).await? else {
                let reason = if !tried.is_empty() && transient == tried.len() {
                    IndeterminateReason::ProviderUnavailable
                } else {
                    IndeterminateReason::AllKeysExhausted
                };
                return Ok(StageA::Failed(reason));
            };
            tried.push(key.id);

            match self.provider.lookup(&key.secret, handle).await {
                Ok(LookupResult::Found(profile)) => {
                    self.keys.record_use(key.id).await?;
                    if profile.username.to_lowercase() != handle.to_lowercase() {
                        warn!(
                            user_id = %owner,
                            handle,
                            returned = %profile.username,
                            "provider returned a different handle"
                        );
                        return Ok(StageA::Failed(IndeterminateReason::HandleMismatch {
                            returned: profile.username,
                        }));
                    }
                    return Ok(StageA::Found(profile));
                }
                Ok(LookupResult::Miss) => {
                    self.keys.record_use(key.id).await?;
                    return Ok(StageA::Miss);
                }
                Err(ProviderError::QuotaExhausted) => {
                    self.keys.mark_exhausted(key.id).await?;
                }
                Err(ProviderError::RateLimited) => {
                    debug!(key_id = %key.id, "key throttled, trying the next one");
                    transient += 1;
                }
                Err(err @ (ProviderError::KeyRejected(_) | ProviderError::Transport(_))) => {
                    debug!(key_id = %key.id, error = %err, "rotating away from key");
                    self.keys.mark_broken(key.id).await?;
                }
                Err(ProviderError::BadResponse(detail)) => {
                    debug!(key_id = %key.id, detail, "unusable provider response");
                    self.keys.record_use(key.id).await?;
                    transient += 1;
                }
            }
        }
    }

    async fn stage_b(&self, owner: UserId, handle: &str) -> StorageResult<StageB> {
        let available = self.proxies.available_count(owner).await?;
        let wanted = available.min(self.settings.attempts_cap);
        if wanted == 0 {
            return Ok(StageB::Failed(IndeterminateReason::NoProxiesAvailable));
        }
        let candidates = self
            .proxies
            .draw(owner, wanted, SelectionStrategy::Adaptive)
            .await?;
        if candidates.is_empty() {
            return Ok(StageB::Failed(IndeterminateReason::NoProxiesAvailable));
        }

        let attempts = u32::try_from(candidates.len()).unwrap_or(u32::MAX);
        let budget = self
            .settings
            .attempt_timeout
            .saturating_mul(attempts)
            .min(PER_HANDLE_BUDGET);
        let deadline = Instant::now() + budget;
        let mut challenged = false;
        let mut timed_out = false;

        for proxy in &candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            let timeout = self.settings.attempt_timeout.min(remaining);
            match self.attempt(proxy, handle, timeout).await? {
                Attempt::Profile(artifact) => return Ok(StageB::Profile(artifact)),
                Attempt::NotFound => return Ok(StageB::NotFound),
                Attempt::Failed {
                    challenge,
                    timed_out: attempt_timed_out,
                } => {
                    challenged |= challenge;
                    timed_out |= attempt_timed_out;
                }
            }
        }

        let reason = if self.proxies.available_count(owner).await? == 0 {
            IndeterminateReason::NoProxiesAvailable
        } else if challenged {
            IndeterminateReason::ChallengeRequired
        } else if timed_out {
            IndeterminateReason::Timeout
        } else {
            IndeterminateReason::ProxyAttemptsFailed
        };
        Ok(StageB::Failed(reason))
    }

    async fn attempt(
        &self,
        proxy: &ProxyRecord,
        handle: &str,
        timeout: Duration,
    ) -> StorageResult<Attempt> {
        let endpoint = match self.proxies.endpoint(proxy) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(proxy_id = %proxy.id, error = %err, "unusable proxy credentials");
                self.proxies.mark_failure(proxy.id, true).await?;
                return Ok(Attempt::failed());
            }
        };
        let reserved = match self.artifacts.reserve(handle, self.clock.now()).await {
            Ok(reserved) => reserved,
            Err(err) => {
                warn!(handle, error = %err, "cannot reserve artifact file");
                return Ok(Attempt::failed());
            }
        };
        let fingerprint = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Fingerprint::sample(&mut *rng)
        };
        let request = RenderRequest {
            url: profile_url(&self.settings.profile_base_url, handle),
            handle: handle.to_string(),
            proxy: endpoint,
            fingerprint,
            output: reserved.path().to_path_buf(),
            timeout,
        };

        // The renderer enforces `timeout` itself so it can close its browser
        // session; this only catches a renderer that ignores it.
        let backstop = timeout + RENDER_CLEANUP_GRACE;
        let verdict = match tokio::time::timeout(backstop, self.renderer.render(request)).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout),
        };
        debug!(proxy_id = %proxy.id, handle, ?verdict, "stage b attempt finished");

        match verdict {
            Ok(RenderVerdict::Profile) => {
                self.proxies.mark_success(proxy.id).await?;
                if is_valid_png(reserved.path()).await {
                    Ok(Attempt::Profile(Some(reserved.keep())))
                } else {
                    warn!(handle, "render reported a profile but left no usable image");
                    reserved.discard().await;
                    Ok(Attempt::Profile(None))
                }
            }
            Ok(RenderVerdict::NotFound) => {
                self.proxies.mark_success(proxy.id).await?;
                reserved.discard().await;
                Ok(Attempt::NotFound)
            }
            failure => {
                self.proxies.mark_failure(proxy.id, true).await?;
                reserved.discard().await;
                Ok(Attempt::Failed {
                    challenge: matches!(failure, Ok(RenderVerdict::Challenge)),
                    timed_out: matches!(failure, Err(RenderError::Timeout)),
                })
            }
        }
    }
}

#[async_trait]
impl AccountVerifier for VerificationPipeline {
    async fn verify(&self, owner: UserId, handle: &str, mode: VerifyMode) -> StorageResult<Outcome> {
        let outcome = match tokio::time::timeout(
            self.settings.total_timeout,
            self.run(owner, handle, mode),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => Outcome::indeterminate(IndeterminateReason::Timeout),
        };

        counter!("engine_outcomes_total", "outcome" => outcome.label()).increment(1);
        match &outcome {
            Outcome::Indeterminate { reason } => {
                info!(user_id = %owner, handle, reason = reason.as_str(), "verification indeterminate")
            }
            other => info!(user_id = %owner, handle, outcome = other.label(), "verification finished"),
        }
        Ok(outcome)
    }
}
