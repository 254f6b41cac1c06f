pub mod deadlines;
pub mod metrics;
pub mod pools;
pub mod scheduler;

pub use deadlines::run_deadlines_handler;
pub use metrics::metrics_handler;
pub use pools::{api_key_status_handler, import_proxies_handler, proxy_stats_handler};
pub use scheduler::{
    scheduler_status_handler, trigger_handler, update_schedule_handler, user_status_handler,
};

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use handle_watch_domain::storage::StorageError;
use handle_watch_domain::UserId;
use handle_watch_engine::EngineError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("user {0} not found")]
    UnknownUser(UserId),
    #[error("user {0} has no scheduler state")]
    NotScheduled(UserId),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("engine failure: {0}")]
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::UnknownUser(user) => Self::UnknownUser(user),
            EngineError::Storage(err) => Self::Storage(err),
            other => Self::Engine(other),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::UnknownUser(_) | ApiError::NotScheduled(_) => StatusCode::NOT_FOUND,
            ApiError::Storage(_) | ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
