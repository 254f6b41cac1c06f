use actix_web::{web, HttpResponse};
use handle_watch_domain::UserId;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub auto_check: bool,
    pub interval_minutes: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub user_id: i64,
    pub accepted: bool,
}

pub async fn scheduler_status_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.runtime().scheduler().status_all())
}

pub async fn user_status_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(path.into_inner());
    let status = state
        .runtime()
        .scheduler()
        .status(user)
        .ok_or(ApiError::NotScheduled(user))?;
    Ok(HttpResponse::Ok().json(status))
}

/// Turns auto-check on or off for a user, optionally with a new interval.
pub async fn update_schedule_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<ScheduleRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(path.into_inner());
    let request = body.into_inner();
    let scheduler = state.runtime().scheduler();

    if request.auto_check {
        let interval = match request.interval_minutes {
            Some(minutes) => minutes,
            None => state.runtime().settings().auto_check_interval().await?,
        };
        scheduler.enable(user, interval).await?;
    } else {
        if let Some(minutes) = request.interval_minutes {
            scheduler.update_interval(user, minutes).await?;
        }
        scheduler.disable(user).await?;
    }

    let status = scheduler.status(user);
    Ok(match status {
        Some(status) => HttpResponse::Ok().json(status),
        None => HttpResponse::NoContent().finish(),
    })
}

/// Queues one out-of-band tick. The tick runs in the background; poll the
/// user status for its result.
pub async fn trigger_handler(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let user = UserId::new(path.into_inner());
    match state.runtime().scheduler().trigger_now(user).await {
        Ok(_handle) => {
            counter!("api_requests_total", "endpoint" => "trigger", "status" => "accepted")
                .increment(1);
            info!(user_id = %user, "manual check triggered");
            Ok(HttpResponse::Accepted().json(TriggerResponse {
                user_id: user.get(),
                accepted: true,
            }))
        }
        Err(err) => {
            counter!("api_requests_total", "endpoint" => "trigger", "status" => "rejected")
                .increment(1);
            Err(err.into())
        }
    }
}
