//! Cache status endpoint

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::AppState;
use crate::services::cache::CacheEntry;

#[derive(Debug, Serialize)]
pub struct CacheStatus {
    /// Tracked size in bytes as of the last scan
    pub size: u64,
    pub max_size: i64,
    pub enabled: bool,
    pub files: Vec<CacheEntry>,
}

async fn cache_status(State(state): State<AppState>) -> Json<CacheStatus> {
    let store = state.cache.store();
    let snapshot = store.snapshot();
    Json(CacheStatus {
        size: snapshot.total_size,
        max_size: store.max_size(),
        enabled: store.is_enabled(),
        files: snapshot.entries.clone(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/cache", get(cache_status))
}
