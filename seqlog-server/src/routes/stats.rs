//! Service counters

use std::sync::Arc;

use axum::{extract::State, response::Json};
use seqlog_core::ServiceStats;

use crate::AppState;

/// Current collector, channel and sink counters
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<ServiceStats> {
    Json(state.service.stats())
}
