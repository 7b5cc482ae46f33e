//! API route definitions
//!
//! JSON endpoints live under `/api`. The stream endpoint and the cache file
//! server live under `/video` so manifests can reference their segments with
//! relative URLs.

pub mod browse;
pub mod cache;
pub mod error;
pub mod health;
pub mod stream;
pub mod tasks;

use axum::Router;

use crate::AppState;

pub use error::ApiError;

/// Routes nested under `/api`.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(browse::router())
        .merge(tasks::router())
        .merge(cache::router())
}
