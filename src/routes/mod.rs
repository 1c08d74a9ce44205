use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::services::gateway::SubmitError;

pub mod classify;
pub mod health;
pub mod metrics;
pub mod results;

/// Gateway API routes. `/metrics` is mounted separately by the binary since
/// it needs the Prometheus handle.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", post(classify::classify_image))
        .route("/results/{file_name}", get(results::get_result))
        .route("/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}

/// Error response with a JSON body `{"error": <message>}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::InvalidInput(message) => Self::bad_request(message),
            SubmitError::Timeout { .. } => Self::internal(error.to_string()),
            // Collaborator details stay in the logs.
            SubmitError::Storage(_) => Self::internal("Failed to upload file to storage"),
            SubmitError::Queue(_) => Self::internal("Failed to enqueue classification job"),
            SubmitError::Superseded(_) => Self::internal(error.to_string()),
        }
    }
}
