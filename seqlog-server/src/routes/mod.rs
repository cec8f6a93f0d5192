//! HTTP route handlers

mod logs;
mod stats;
mod stream;

use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Json, Router};
use seqlog_core::{ErrorResponse, SeqLogError};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error half of a handler result: status plus the JSON error body
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, err: SeqLogError) -> ApiError {
    (status, Json(err.to_error_response()))
}

/// Health check endpoint
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create the router with all routes
pub fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/v1/stats", get(stats::get_stats))
        .route("/v1/logs", get(logs::list_segments))
        .route("/v1/logs/:name", get(logs::get_segment))
        .route("/v1/stream", get(stream::live_stream))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
