//! Stage A lookup provider: a keyed HTTP API that resolves a handle to a
//! profile summary or an authoritative miss.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::client::build_client;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSummary {
    pub username: String,
    pub full_name: Option<String>,
    pub followers: Option<u64>,
    pub is_private: Option<bool>,
}

impl ProfileSummary {
    pub fn bare(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            full_name: None,
            followers: None,
            is_private: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(ProfileSummary),
    Miss,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("daily quota exhausted")]
    QuotaExhausted,
    /// Short-window throttling; the key is fine once the window passes.
    #[error("rate limited")]
    RateLimited,
    #[error("key rejected with status {0}")]
    KeyRejected(u16),
    #[error("bad provider response: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn lookup(&self, secret: &str, handle: &str) -> Result<LookupResult, ProviderError>;
}

pub struct RapidApiProvider {
    client: Client,
    url: String,
    host: String,
}

impl RapidApiProvider {
    pub fn new(
        url: impl Into<String>,
        host: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            host: host.into(),
        })
    }
}

#[async_trait]
impl ProfileProvider for RapidApiProvider {
    async fn lookup(&self, secret: &str, handle: &str) -> Result<LookupResult, ProviderError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("ig", handle.to_lowercase())])
            .header("X-RapidAPI-Key", secret)
            .header("X-RapidAPI-Host", &self.host)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        classify_response(status, &body)
    }
}

const DAILY_QUOTA_PHRASES: [&str; 2] = ["daily quota", "exceeded the daily"];
/// Provider wording for a handle that does not exist. Gateway replies such as
/// "Endpoint '/x' does not exist" must not match.
const USER_MISS_PHRASES: [&str; 4] = [
    "user not found",
    "user does not exist",
    "account not found",
    "profile not found",
];

/// Maps a raw provider reply onto the lookup taxonomy. Only the provider's
/// canonical miss shapes become [`LookupResult::Miss`], since a miss
/// finishes the account for good.
pub fn classify_response(status: StatusCode, body: &str) -> Result<LookupResult, ProviderError> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(message_of)
        .unwrap_or_default()
        .to_lowercase();

    if DAILY_QUOTA_PHRASES.iter().any(|phrase| message.contains(phrase)) {
        return Err(ProviderError::QuotaExhausted);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ProviderError::KeyRejected(status.as_u16()));
    }

    let canonical_miss = match &parsed {
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => USER_MISS_PHRASES.iter().any(|phrase| message.contains(phrase)),
        None => false,
    };
    if status == StatusCode::NOT_FOUND {
        return if canonical_miss {
            Ok(LookupResult::Miss)
        } else {
            Err(ProviderError::BadResponse(format!("status {status}: {message}")))
        };
    }
    if !status.is_success() {
        return Err(ProviderError::BadResponse(format!("status {status}")));
    }

    let Some(value) = parsed else {
        return Err(ProviderError::BadResponse("body is not json".into()));
    };
    if canonical_miss {
        return Ok(LookupResult::Miss);
    }

    let profile = match &value {
        Value::Array(items) => items.first().and_then(summary_of),
        Value::Object(_) => summary_of(&value),
        _ => None,
    };
    profile
        .map(LookupResult::Found)
        .ok_or_else(|| ProviderError::BadResponse("no username in response".into()))
}

fn message_of(value: &Value) -> Option<&str> {
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
}

fn summary_of(value: &Value) -> Option<ProfileSummary> {
    let object = value.as_object()?;
    let username = object.get("username")?.as_str()?.trim();
    if username.is_empty() {
        return None;
    }
    Some(ProfileSummary {
        username: username.to_string(),
        full_name: object
            .get("full_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        followers: object
            .get("follower_count")
            .or_else(|| object.get("followers"))
            .and_then(Value::as_u64),
        is_private: object.get("is_private").and_then(Value::as_bool),
    })
}
