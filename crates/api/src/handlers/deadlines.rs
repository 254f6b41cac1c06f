use actix_web::{web, HttpResponse};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

use super::ApiError;

#[derive(Debug, Deserialize, Serialize)]
pub struct DeadlineRunResponse {
    pub sent: usize,
    pub deduplicated: usize,
}

/// Runs the deadline pass immediately. Receipts make a second run on the
/// same day a no-op.
pub async fn run_deadlines_handler(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let report = state.runtime().deadlines().run_once().await?;
    counter!("api_requests_total", "endpoint" => "deadlines", "status" => "ok").increment(1);
    Ok(HttpResponse::Ok().json(DeadlineRunResponse {
        sent: report.sent,
        deduplicated: report.deduplicated,
    }))
}
