use thiserror::Error;

use handle_watch_domain::{
    config::ConfigError, model::VerifyModeError, services::telemetry::TelemetryError,
    storage::StorageError, UserId,
};

use crate::secret::SecretError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("secret box error: {0}")]
    Secret(#[from] SecretError),
    #[error("http client error: {0}")]
    Http(String),
    #[error(transparent)]
    VerifyMode(#[from] VerifyModeError),
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("invalid value `{value}` for setting `{key}`")]
    InvalidSetting { key: &'static str, value: String },
}

impl From<reqwest::Error> for EngineError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}
