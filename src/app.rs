//! Application state, service wiring and HTTP router construction.
//!
//! Used by the binary and by [HttpServerService](crate::services::http_server::HttpServerService)
//! to build the Axum app.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::config::Config;
use crate::services::{
    CacheService, EncoderService, HttpServerService, LibraryService, ServicesManager,
    StreamingConfig, StreamingService,
};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub services: Arc<ServicesManager>,
    pub cache: Arc<CacheService>,
    pub encoder: Arc<EncoderService>,
    pub library: Arc<LibraryService>,
    pub streaming: Arc<StreamingService>,
}

impl AppState {
    /// Construct every component from configuration. Nothing is started.
    pub fn from_config(config: Arc<Config>) -> Self {
        let cache = Arc::new(
            CacheService::new(&config.cache_path, config.cache_size)
                .with_scan_interval(config.cache_scan_interval),
        );
        let encoder = Arc::new(EncoderService::new(
            config.encoder.clone(),
            &config.cache_path,
        ));
        let library = Arc::new(LibraryService::new(
            config.library_roots.clone(),
            config.media_extensions.clone(),
        ));
        let streaming = Arc::new(StreamingService::new(
            library.clone(),
            encoder.clone(),
            &config.cache_path,
            StreamingConfig {
                poll_interval: config.stream_poll_interval,
                poll_attempts: config.stream_poll_attempts,
            },
        ));

        Self {
            config,
            services: Arc::new(ServicesManager::new()),
            cache,
            encoder,
            library,
            streaming,
        }
    }
}

/// Build the state and register the cache, encoder and HTTP services with
/// its manager. Call [start_all](ServicesManager::start_all) on the result.
pub async fn build_services(config: Arc<Config>) -> AppState {
    let state = AppState::from_config(config.clone());
    let addr = SocketAddr::new(config.host, config.port);

    state.services.register(state.cache.clone()).await;
    state.services.register(state.encoder.clone()).await;
    state
        .services
        .register(Arc::new(HttpServerService::new(state.clone(), addr)))
        .await;
    state
}

/// Build the full Axum router: health, /api, /video, layers, and static fallback.
pub fn build_app(state: AppState) -> Router<()> {
    let static_path = state.config.static_path.clone();
    let cache_path = state.config.cache_path.clone();

    Router::new()
        .merge(api::health::router())
        .nest("/api", api::router())
        .merge(api::stream::router())
        .nest_service("/video", ServeDir::new(cache_path))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .fallback_service(
            ServeDir::new(&static_path)
                .not_found_service(ServeFile::new(static_path.join("index.html"))),
        )
}
