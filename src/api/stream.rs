//! Stream endpoint: returns the HLS manifest for a library file

use axum::{
    Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::api::ApiError;

pub const MANIFEST_CONTENT_TYPE: &str = "application/x-mpegurl";

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// `/<root>/<relative path>`
    path: Option<String>,
}

/// Manifest bytes, or 204 when transcoding did not produce one in time.
async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing path".to_string()))?;

    match state.streaming.manifest(&path).await? {
        Some(bytes) => Ok(([(header::CONTENT_TYPE, MANIFEST_CONTENT_TYPE)], bytes).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/video/stream", get(stream))
}
