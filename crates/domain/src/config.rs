//! Environment-driven configuration structures shared by all binaries.

use std::{env, str::FromStr, time::Duration};

use chrono::{FixedOffset, Local};
use thiserror::Error;

use crate::model::DEFAULT_API_DAILY_LIMIT;

pub const DEFAULT_RAPIDAPI_URL: &str = "https://instagram210.p.rapidapi.com/ig/user/profile";
pub const DEFAULT_RAPIDAPI_HOST: &str = "instagram210.p.rapidapi.com";
pub const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:4444";
pub const DEFAULT_PROFILE_BASE_URL: &str = "https://www.instagram.com";
pub const DEFAULT_SCREENSHOT_DIR: &str = "screenshots";
pub const DEFAULT_PROXY_ECHO_URL: &str = "https://httpbin.org/ip";
pub const DEFAULT_STATUS_BIND_ADDRESS: &str = "127.0.0.1:8088";

/// Everything the verification engine needs to run headless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    database_url: String,
    rapidapi_url: String,
    rapidapi_host: String,
    rapidapi_timeout: Duration,
    api_daily_limit: u32,
    webdriver_url: String,
    profile_base_url: String,
    screenshot_dir: String,
    stage_b_attempt_timeout: Duration,
    stage_b_attempts_cap: usize,
    proxy_echo_url: String,
    max_concurrent_users: usize,
    shutdown_grace: Duration,
    local_offset: FixedOffset,
    bot_token: Option<String>,
    encryption_key: Option<String>,
}

impl EngineConfig {
    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// process variables. Only `DATABASE_URL` is mandatory.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let local_offset = match get_optional_var("LOCAL_UTC_OFFSET_MINUTES") {
            Some(raw) => {
                let minutes: i32 =
                    raw.parse()
                        .map_err(|source| ConfigError::InvalidNumber {
                            key: "LOCAL_UTC_OFFSET_MINUTES",
                            source,
                        })?;
                minutes
                    .checked_mul(60)
                    .and_then(FixedOffset::east_opt)
                    .ok_or(ConfigError::InvalidOffset { minutes })?
            }
            None => *Local::now().offset(),
        };

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            rapidapi_url: get_var_or("RAPIDAPI_URL", DEFAULT_RAPIDAPI_URL),
            rapidapi_host: get_var_or("RAPIDAPI_HOST", DEFAULT_RAPIDAPI_HOST),
            rapidapi_timeout: Duration::from_secs(get_number_or("RAPIDAPI_TIMEOUT_SECONDS", 10)?),
            api_daily_limit: get_number_or("API_DAILY_LIMIT", DEFAULT_API_DAILY_LIMIT)?,
            webdriver_url: get_var_or("WEBDRIVER_URL", DEFAULT_WEBDRIVER_URL),
            profile_base_url: get_var_or("PROFILE_BASE_URL", DEFAULT_PROFILE_BASE_URL),
            screenshot_dir: get_var_or("SCREENSHOT_DIR", DEFAULT_SCREENSHOT_DIR),
            stage_b_attempt_timeout: Duration::from_secs(get_number_or(
                "STAGE_B_ATTEMPT_TIMEOUT_SECONDS",
                60,
            )?),
            stage_b_attempts_cap: get_number_or("STAGE_B_ATTEMPTS_CAP", 3usize)?.max(1),
            proxy_echo_url: get_var_or("PROXY_ECHO_URL", DEFAULT_PROXY_ECHO_URL),
            max_concurrent_users: get_number_or("MAX_CONCURRENT_USERS", 10usize)?.max(1),
            shutdown_grace: Duration::from_secs(get_number_or("SHUTDOWN_GRACE_SECONDS", 30)?),
            local_offset,
            bot_token: get_optional_var("BOT_TOKEN"),
            encryption_key: get_optional_var("ENCRYPTION_KEY"),
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn rapidapi_url(&self) -> &str {
        &self.rapidapi_url
    }

    pub fn rapidapi_host(&self) -> &str {
        &self.rapidapi_host
    }

    pub fn rapidapi_timeout(&self) -> Duration {
        self.rapidapi_timeout
    }

    pub fn api_daily_limit(&self) -> u32 {
        self.api_daily_limit
    }

    pub fn webdriver_url(&self) -> &str {
        &self.webdriver_url
    }

    pub fn profile_base_url(&self) -> &str {
        &self.profile_base_url
    }

    pub fn screenshot_dir(&self) -> &str {
        &self.screenshot_dir
    }

    pub fn stage_b_attempt_timeout(&self) -> Duration {
        self.stage_b_attempt_timeout
    }

    pub fn stage_b_attempts_cap(&self) -> usize {
        self.stage_b_attempts_cap
    }

    pub fn proxy_echo_url(&self) -> &str {
        &self.proxy_echo_url
    }

    pub fn max_concurrent_users(&self) -> usize {
        self.max_concurrent_users
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn local_offset(&self) -> FixedOffset {
        self.local_offset
    }

    pub fn bot_token(&self) -> Option<&str> {
        self.bot_token.as_deref()
    }

    pub fn encryption_key(&self) -> Option<&str> {
        self.encryption_key.as_deref()
    }
}

/// Status-surface configuration for the `handle-watch` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    status_bind_address: String,
}

impl ApiConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            status_bind_address: get_var_or("STATUS_BIND_ADDRESS", DEFAULT_STATUS_BIND_ADDRESS),
        })
    }

    pub fn status_bind_address(&self) -> &str {
        &self.status_bind_address
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or(ConfigError::MissingVar { key })
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn get_var_or(key: &'static str, default: &str) -> String {
    get_optional_var(key).unwrap_or_else(|| default.to_string())
}

fn get_number_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("HANDLE_WATCH_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("UTC offset of {minutes} minutes is out of range")]
    InvalidOffset { minutes: i32 },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    const OPTIONAL_KEYS: &[&str] = &[
        "RAPIDAPI_URL",
        "RAPIDAPI_HOST",
        "RAPIDAPI_TIMEOUT_SECONDS",
        "API_DAILY_LIMIT",
        "WEBDRIVER_URL",
        "PROFILE_BASE_URL",
        "SCREENSHOT_DIR",
        "STAGE_B_ATTEMPT_TIMEOUT_SECONDS",
        "STAGE_B_ATTEMPTS_CAP",
        "PROXY_ECHO_URL",
        "MAX_CONCURRENT_USERS",
        "SHUTDOWN_GRACE_SECONDS",
        "LOCAL_UTC_OFFSET_MINUTES",
        "BOT_TOKEN",
        "ENCRYPTION_KEY",
        "STATUS_BIND_ADDRESS",
    ];

    fn set_env() {
        std::env::set_var("HANDLE_WATCH_SKIP_DOTENV", "1");
        std::env::set_var("DATABASE_URL", "sqlite://test.db");
        for key in OPTIONAL_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn engine_config_applies_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("LOCAL_UTC_OFFSET_MINUTES", "0");

        let config = EngineConfig::load_from_env().expect("config loads");
        assert_eq!(config.database_url(), "sqlite://test.db");
        assert_eq!(config.rapidapi_url(), DEFAULT_RAPIDAPI_URL);
        assert_eq!(config.api_daily_limit(), 950);
        assert_eq!(config.stage_b_attempts_cap(), 3);
        assert_eq!(config.stage_b_attempt_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_concurrent_users(), 10);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.screenshot_dir(), "screenshots");
        assert_eq!(config.local_offset().local_minus_utc(), 0);
        assert_eq!(config.bot_token(), None);

        set_env();
    }

    #[test]
    fn engine_config_reads_overrides() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("API_DAILY_LIMIT", "100");
        std::env::set_var("MAX_CONCURRENT_USERS", " 4 ");
        std::env::set_var("LOCAL_UTC_OFFSET_MINUTES", "180");
        std::env::set_var("BOT_TOKEN", "123:abc");

        let config = EngineConfig::load_from_env().expect("config loads");
        assert_eq!(config.api_daily_limit(), 100);
        assert_eq!(config.max_concurrent_users(), 4);
        assert_eq!(config.local_offset().local_minus_utc(), 180 * 60);
        assert_eq!(config.bot_token(), Some("123:abc"));

        set_env();
    }

    #[test]
    fn required_env_vars_are_trimmed() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("DATABASE_URL", "  sqlite://trim.db  ");

        let config = EngineConfig::load_from_env().expect("config loads");
        assert_eq!(config.database_url(), "sqlite://trim.db");

        set_env();
    }

    #[test]
    fn empty_required_env_var_is_treated_as_missing() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("DATABASE_URL", "   ");

        let err = EngineConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                key: "DATABASE_URL"
            }
        ));

        set_env();
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("STAGE_B_ATTEMPTS_CAP", "three");

        let err = EngineConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                key: "STAGE_B_ATTEMPTS_CAP",
                ..
            }
        ));

        set_env();
    }

    #[test]
    fn api_config_defaults_status_address() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        let config = ApiConfig::load_from_env().expect("config loads");
        assert_eq!(config.status_bind_address(), DEFAULT_STATUS_BIND_ADDRESS);

        std::env::set_var("STATUS_BIND_ADDRESS", "0.0.0.0:9000");
        let config = ApiConfig::load_from_env().expect("config loads");
        assert_eq!(config.status_bind_address(), "0.0.0.0:9000");

        set_env();
    }
}
