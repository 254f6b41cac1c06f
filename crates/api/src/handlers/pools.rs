use actix_web::{web, HttpResponse};
use handle_watch_domain::{ApiKeyStatus, ProxyStats, UserId};
use handle_watch_engine::ImportReport;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyStatusResponse {
    pub id: i64,
    pub masked_key: String,
    pub used_today: u32,
    pub limit: u32,
    pub remaining: u32,
    pub working: bool,
    pub available: bool,
}

impl From<ApiKeyStatus> for ApiKeyStatusResponse {
    fn from(status: ApiKeyStatus) -> Self {
        Self {
            id: status.id.get(),
            masked_key: status.masked_key,
            used_today: status.used_today,
            limit: status.limit,
            remaining: status.remaining,
            working: status.working,
            available: status.available,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatsResponse {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub in_cooldown: usize,
    pub success_rate: f64,
    pub total_uses: u64,
    pub total_successes: u64,
}

impl From<ProxyStats> for ProxyStatsResponse {
    fn from(stats: ProxyStats) -> Self {
        Self {
            total: stats.total,
            active: stats.active,
            inactive: stats.inactive,
            in_cooldown: stats.in_cooldown,
            success_rate: stats.success_rate,
            total_uses: stats.total_uses,
            total_successes: stats.total_successes,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ImportLineError {
    pub line: usize,
    pub input: String,
    pub error: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ImportResponse {
    pub added: usize,
    pub skipped: usize,
    pub errors: Vec<ImportLineError>,
}

impl From<ImportReport> for ImportResponse {
    fn from(report: ImportReport) -> Self {
        Self {
            added: report.added,
            skipped: report.skipped,
            errors: report
                .errors
                .into_iter()
                .map(|err| ImportLineError {
                    line: err.line,
                    input: err.input,
                    error: err.error.to_string(),
                })
                .collect(),
        }
    }
}

pub async fn api_key_status_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let owner = UserId::new(path.into_inner());
    let statuses: Vec<ApiKeyStatusResponse> = state
        .runtime()
        .api_keys()
        .statuses(owner)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(HttpResponse::Ok().json(statuses))
}

pub async fn proxy_stats_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let owner = UserId::new(path.into_inner());
    let stats = state.runtime().proxies().stats(owner).await?;
    Ok(HttpResponse::Ok().json(ProxyStatsResponse::from(stats)))
}

/// Accepts a plain-text batch, one proxy per line or `;`-separated.
pub async fn import_proxies_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: String,
) -> Result<HttpResponse, ApiError> {
    let owner = UserId::new(path.into_inner());
    if state.runtime().user(owner).await?.is_none() {
        return Err(ApiError::UnknownUser(owner));
    }
    let report = state.runtime().proxies().import_batch(owner, &body).await?;
    Ok(HttpResponse::Ok().json(ImportResponse::from(report)))
}
