//! Composition root for the engine: wires storage, pools, pipeline,
//! scheduler and the daily deadline job from configuration.

use std::{path::PathBuf, sync::Arc, time::Duration};

use handle_watch_domain::{
    Clock, EngineConfig, NewUser, Repositories, SystemClock, UserId, UserRecord,
};
use handle_watch_storage::SeaOrmStorage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    api_key_pool::ApiKeyPool,
    deadline::DeadlineNotifier,
    notifier::{BotApiNotifier, LogNotifier, Notifier},
    pipeline::{ArtifactStore, PipelineSettings, ProfileRenderer, VerificationPipeline, WebDriverRenderer},
    provider::{ProfileProvider, RapidApiProvider},
    proxy_pool::ProxyPool,
    scheduler::{SchedulerSettings, UserScheduler},
    secret::{KeyedSecretBox, PlainSecretBox, SecretBox},
    settings::GlobalSettings,
    EngineError,
};

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the runtime needs, already constructed. Tests build this by
/// hand with in-memory doubles.
pub struct EngineParts {
    pub repos: Arc<dyn Repositories>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    pub secrets: Arc<dyn SecretBox>,
    pub provider: Arc<dyn ProfileProvider>,
    pub renderer: Arc<dyn ProfileRenderer>,
    pub api_daily_limit: u32,
    pub proxy_echo_url: String,
    pub screenshot_dir: PathBuf,
    pub pipeline: PipelineSettings,
    pub scheduler: SchedulerSettings,
}

impl EngineParts {
    pub fn from_config(config: &EngineConfig, storage: SeaOrmStorage) -> Result<Self, EngineError> {
        let notifier: Arc<dyn Notifier> = match config.bot_token() {
            Some(token) => Arc::new(
                BotApiNotifier::new(token).map_err(|err| EngineError::Http(err.to_string()))?,
            ),
            None => {
                info!("BOT_TOKEN not set; notifications are only logged");
                Arc::new(LogNotifier)
            }
        };
        let secrets: Arc<dyn SecretBox> = match config.encryption_key() {
            Some(key) => Arc::new(KeyedSecretBox::new(key)),
            None => Arc::new(PlainSecretBox),
        };

        Ok(Self {
            repos: Arc::new(storage),
            clock: Arc::new(SystemClock::new(config.local_offset())),
            notifier,
            secrets,
            provider: Arc::new(RapidApiProvider::new(
                config.rapidapi_url(),
                config.rapidapi_host(),
                config.rapidapi_timeout(),
            )?),
            renderer: Arc::new(WebDriverRenderer::new(config.webdriver_url())?),
            api_daily_limit: config.api_daily_limit(),
            proxy_echo_url: config.proxy_echo_url().to_string(),
            screenshot_dir: PathBuf::from(config.screenshot_dir()),
            pipeline: PipelineSettings {
                attempt_timeout: config.stage_b_attempt_timeout(),
                attempts_cap: config.stage_b_attempts_cap(),
                profile_base_url: config.profile_base_url().to_string(),
                ..PipelineSettings::default()
            },
            scheduler: SchedulerSettings {
                max_concurrent_users: config.max_concurrent_users(),
                shutdown_grace: config.shutdown_grace(),
                profile_base_url: config.profile_base_url().to_string(),
            },
        })
    }
}

pub struct EngineRuntime {
    repos: Arc<dyn Repositories>,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn ProfileProvider>,
    keys: Arc<ApiKeyPool>,
    proxies: Arc<ProxyPool>,
    scheduler: UserScheduler,
    deadlines: Arc<DeadlineNotifier>,
    settings: GlobalSettings,
    daily: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl EngineRuntime {
    pub fn from_config(config: &EngineConfig, storage: SeaOrmStorage) -> Result<Self, EngineError> {
        Ok(Self::assemble(EngineParts::from_config(config, storage)?))
    }

    pub fn assemble(parts: EngineParts) -> Self {
        let keys = Arc::new(ApiKeyPool::new(
            parts.repos.clone(),
            parts.clock.clone(),
            parts.api_daily_limit,
        ));
        let proxies = Arc::new(ProxyPool::new(
            parts.repos.clone(),
            parts.clock.clone(),
            parts.secrets,
            parts.proxy_echo_url,
            LIVENESS_TIMEOUT,
        ));
        let profile_base_url = parts.pipeline.profile_base_url.clone();
        let pipeline = VerificationPipeline::new(
            keys.clone(),
            proxies.clone(),
            parts.provider.clone(),
            parts.renderer,
            ArtifactStore::new(parts.screenshot_dir),
            parts.clock.clone(),
            parts.pipeline,
        );
        let scheduler = UserScheduler::new(
            parts.repos.clone(),
            Arc::new(pipeline),
            parts.notifier.clone(),
            parts.clock.clone(),
            parts.scheduler,
        );
        let deadlines = Arc::new(DeadlineNotifier::new(
            parts.repos.clone(),
            parts.notifier,
            parts.clock.clone(),
            profile_base_url,
        ));

        Self {
            settings: GlobalSettings::new(parts.repos.clone()),
            repos: parts.repos,
            clock: parts.clock,
            provider: parts.provider,
            keys,
            proxies,
            scheduler,
            deadlines,
            daily: std::sync::Mutex::new(None),
        }
    }

    /// Starts every per-user job and the daily deadline loop.
    pub async fn start(&self) -> Result<usize, EngineError> {
        self.proxies.release_expired_cooldowns().await?;
        let jobs = self.scheduler.start_all().await?;

        let cancel = CancellationToken::new();
        let deadlines = self.deadlines.clone();
        let settings = self.settings.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { deadlines.run_daily(settings, token).await });
        let previous = self
            .daily
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace((cancel, task));
        if let Some((cancel, _)) = previous {
            cancel.cancel();
        }
        info!(jobs, "engine started");
        Ok(jobs)
    }

    pub async fn stop(&self) {
        let daily = self
            .daily
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((cancel, task)) = daily {
            cancel.cancel();
            let _ = task.await;
        }
        self.scheduler.stop_all().await;
        info!("engine stopped");
    }

    /// Creates the user if missing, seeded from the global defaults.
    pub async fn register_user(&self, id: UserId) -> Result<UserRecord, EngineError> {
        let mut user = NewUser::new(id, self.clock.now());
        user.check_interval_minutes = self.settings.auto_check_interval().await?;
        user.verify_mode = self.settings.global_verify_mode().await?;
        Ok(self.repos.upsert_user(user).await?)
    }

    pub async fn user(&self, id: UserId) -> Result<Option<UserRecord>, EngineError> {
        Ok(self.repos.find_user(id).await?)
    }

    pub async fn test_api_key(&self, secret: &str) -> bool {
        self.keys.test_key(self.provider.as_ref(), secret).await
    }

    pub fn scheduler(&self) -> &UserScheduler {
        &self.scheduler
    }

    pub fn deadlines(&self) -> &DeadlineNotifier {
        &self.deadlines
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    pub fn api_keys(&self) -> &ApiKeyPool {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{now, user, FakeProvider, FakeRenderer, MemoryRepos, RecordingNotifier};
    use handle_watch_domain::{ManualClock, VerifyMode};

    fn parts(repos: Arc<MemoryRepos>, dir: &std::path::Path) -> EngineParts {
        EngineParts {
            repos,
            clock: Arc::new(ManualClock::utc(now())),
            notifier: Arc::new(RecordingNotifier::default()),
            secrets: Arc::new(PlainSecretBox),
            provider: Arc::new(FakeProvider::default()),
            renderer: Arc::new(FakeRenderer::default()),
            api_daily_limit: 950,
            proxy_echo_url: "http://127.0.0.1:9/ip".into(),
            screenshot_dir: dir.join("screenshots"),
            pipeline: PipelineSettings::default(),
            scheduler: SchedulerSettings {
                shutdown_grace: Duration::from_millis(100),
                ..SchedulerSettings::default()
            },
        }
    }

    #[tokio::test]
    async fn register_user_uses_global_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let repos = Arc::new(MemoryRepos::default());
        let runtime = EngineRuntime::assemble(parts(repos, dir.path()));
        runtime.settings().set_auto_check_interval(15).await.unwrap();
        runtime.settings().set_global_verify_mode("proxy").await.unwrap();

        let record = runtime.register_user(UserId::new(42)).await.unwrap();
        assert_eq!(record.check_interval_minutes, 15);
        assert_eq!(record.verify_mode, VerifyMode::Proxy.as_tag());
        assert!(!record.auto_check_enabled);

        runtime.settings().set_auto_check_interval(30).await.unwrap();
        let again = runtime.register_user(UserId::new(42)).await.unwrap();
        assert_eq!(again.check_interval_minutes, 15);
    }

    #[tokio::test]
    async fn start_and_stop_manage_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let repos = Arc::new(MemoryRepos::default());
        repos.put_user(user(1));
        let mut idle = user(2);
        idle.auto_check_enabled = false;
        repos.put_user(idle);
        let runtime = EngineRuntime::assemble(parts(repos, dir.path()));

        assert_eq!(runtime.start().await.unwrap(), 1);
        assert!(runtime.scheduler().is_scheduled(UserId::new(1)));
        assert!(!runtime.scheduler().is_scheduled(UserId::new(2)));

        runtime.stop().await;
        let status = runtime.scheduler().status_all();
        assert!(!status.running);
        assert_eq!(status.active_jobs, 0);
    }
}
