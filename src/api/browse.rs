//! Library browsing API

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::io::ReaderStream;

use crate::AppState;
use crate::api::ApiError;
use crate::services::library::{BrowseResult, LibraryEntry};

/// Names of the configured library roots
async fn list_roots(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.library.names())
}

/// Top level of one root
async fn browse_root(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    browse(&state, &name, "").await
}

/// Directory listing or plain-text file below a root
async fn browse_path(
    State(state): State<AppState>,
    Path((name, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    browse(&state, &name, &path).await
}

async fn browse(state: &AppState, name: &str, path: &str) -> Result<Response, ApiError> {
    match state.library.browse(name, path).await? {
        BrowseResult::Directory(entries) => Ok(Json::<Vec<LibraryEntry>>(entries).into_response()),
        BrowseResult::File(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|_| ApiError::NotFound)?;
            Ok((
                [(header::CONTENT_TYPE, "text/plain")],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response())
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/browse", get(list_roots))
        .route("/browse/{name}", get(browse_root))
        .route("/browse/{name}/{*path}", get(browse_path))
}
