//! Log segment routes

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use seqlog_core::{SegmentInfo, SeqLogError};

use super::{api_error, ApiError};
use crate::AppState;

/// List retained segments, oldest first
pub async fn list_segments(State(state): State<Arc<AppState>>) -> Json<Vec<SegmentInfo>> {
    Json(state.service.segments())
}

/// Contents of one retained segment
///
/// Only names currently listed by the rotation manager are served.
pub async fn get_segment(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let not_found = |name: String| {
        api_error(StatusCode::NOT_FOUND, SeqLogError::SegmentNotFound { name })
    };

    let segment = state
        .service
        .segments()
        .into_iter()
        .find(|s| s.name == name)
        .ok_or_else(|| not_found(name.clone()))?;

    let text = match tokio::fs::read_to_string(&segment.path).await {
        Ok(text) => text,
        // Rotated away since it was listed
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(name)),
        Err(e) => return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, SeqLogError::Io(e))),
    };

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}
