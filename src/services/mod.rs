//! Long-running services and the manager that starts them

pub mod cache;
pub mod encoder;
pub mod http_server;
pub mod library;
pub mod manager;
pub mod streaming;

pub use cache::{CacheEntry, CacheService, CacheSnapshot, CacheStore};
pub use encoder::{
    EncodeEvent, EncodeOutcome, EncoderError, EncoderService, EncoderStats, TaskInfo,
    TranscodeTask,
};
pub use http_server::HttpServerService;
pub use library::{BrowseResult, LibraryEntry, LibraryError, LibraryService};
pub use manager::{HealthStatus, Service, ServiceHealth, ServicesManager};
pub use streaming::{StreamError, StreamingConfig, StreamingService};
