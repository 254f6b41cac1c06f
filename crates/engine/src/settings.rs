//! Process-wide settings persisted as key/value rows.

use std::sync::Arc;

use chrono::NaiveTime;
use handle_watch_domain::{
    clamp_interval, default_notification_time, parse_notification_time, Repositories,
    StorageResult, VerifyMode, DEFAULT_CHECK_INTERVAL_MINUTES, SETTING_AUTO_CHECK_INTERVAL,
    SETTING_EXPIRY_NOTIFICATION_TIME, SETTING_GLOBAL_VERIFY_MODE,
};
use tracing::warn;

use crate::EngineError;

#[derive(Clone)]
pub struct GlobalSettings {
    repos: Arc<dyn Repositories>,
}

impl GlobalSettings {
    pub fn new(repos: Arc<dyn Repositories>) -> Self {
        Self { repos }
    }

    /// Fallback interval for users without their own.
    pub async fn auto_check_interval(&self) -> StorageResult<u32> {
        let stored = self.repos.get_setting(SETTING_AUTO_CHECK_INTERVAL).await?;
        Ok(match stored.as_deref().map(str::trim).map(str::parse::<u32>) {
            Some(Ok(minutes)) => clamp_interval(minutes),
            Some(Err(_)) => {
                warn!(value = ?stored, "ignoring malformed auto check interval");
                DEFAULT_CHECK_INTERVAL_MINUTES
            }
            None => DEFAULT_CHECK_INTERVAL_MINUTES,
        })
    }

    /// Stores the clamped value and returns it.
    pub async fn set_auto_check_interval(&self, minutes: u32) -> StorageResult<u32> {
        let minutes = clamp_interval(minutes);
        self.repos
            .put_setting(SETTING_AUTO_CHECK_INTERVAL, &minutes.to_string())
            .await?;
        Ok(minutes)
    }

    pub async fn global_verify_mode(&self) -> StorageResult<VerifyMode> {
        let Some(stored) = self.repos.get_setting(SETTING_GLOBAL_VERIFY_MODE).await? else {
            return Ok(VerifyMode::default());
        };
        Ok(VerifyMode::parse(&stored).unwrap_or_else(|err| {
            warn!(error = %err, "stored global verify mode is invalid; using default");
            VerifyMode::default()
        }))
    }

    /// Rejects unknown tags before anything is written.
    pub async fn set_global_verify_mode(&self, tag: &str) -> Result<VerifyMode, EngineError> {
        let mode = VerifyMode::parse(tag)?;
        self.repos
            .put_setting(SETTING_GLOBAL_VERIFY_MODE, mode.as_tag())
            .await?;
        Ok(mode)
    }

    pub async fn notification_time(&self) -> StorageResult<NaiveTime> {
        let stored = self.repos.get_setting(SETTING_EXPIRY_NOTIFICATION_TIME).await?;
        Ok(match stored.as_deref() {
            Some(value) => parse_notification_time(value).unwrap_or_else(|| {
                warn!(value, "ignoring malformed notification time");
                default_notification_time()
            }),
            None => default_notification_time(),
        })
    }

    pub async fn set_notification_time(&self, value: &str) -> Result<NaiveTime, EngineError> {
        let time = parse_notification_time(value).ok_or_else(|| EngineError::InvalidSetting {
            key: SETTING_EXPIRY_NOTIFICATION_TIME,
            value: value.to_string(),
        })?;
        self.repos
            .put_setting(
                SETTING_EXPIRY_NOTIFICATION_TIME,
                &time.format("%H:%M").to_string(),
            )
            .await?;
        Ok(time)
    }
}
