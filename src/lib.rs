//! On-demand HLS transcoding server.
//!
//! Media files under configured library roots are transcoded into a flat
//! cache directory the first time they are requested. The encoder registry
//! guarantees at most one transcode per source, and the cache service keeps
//! the directory under a byte budget by evicting the oldest files.

pub mod api;
pub mod app;
pub mod config;
pub mod media;
pub mod services;

pub use app::AppState;
