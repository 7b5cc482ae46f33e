//! Stream request orchestration
//!
//! Turns a client stream request into a manifest: resolve the request to a
//! source file and its fingerprint, serve the cached manifest if present,
//! otherwise start an encoder and poll the cache directory until the manifest
//! appears or the attempt budget runs out. The presence of the manifest file
//! is the only completion signal; its contents are never inspected.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::media::Fingerprint;
use crate::services::encoder::{EncodeOutcome, EncoderError, EncoderService, TranscodeTask};
use crate::services::library::{LibraryError, LibraryService};

/// Poll timing for a manifest that is still being produced.
#[derive(Debug, Clone, Copy)]
pub struct StreamingConfig {
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            poll_attempts: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct StreamingService {
    library: Arc<LibraryService>,
    encoder: Arc<EncoderService>,
    cache_dir: PathBuf,
    config: StreamingConfig,
}

impl StreamingService {
    pub fn new(
        library: Arc<LibraryService>,
        encoder: Arc<EncoderService>,
        cache_dir: impl Into<PathBuf>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            library,
            encoder,
            cache_dir: cache_dir.into(),
            config,
        }
    }

    /// Map a request path to the transcode task for its source file.
    pub fn task_for(&self, request_path: &str) -> Result<TranscodeTask, StreamError> {
        let source = self.library.resolve_request(request_path)?;
        Ok(TranscodeTask::new(source))
    }

    /// Fingerprint of the source a request path points at.
    pub fn resolve(&self, request_path: &str) -> Result<Fingerprint, StreamError> {
        self.task_for(request_path).map(|task| task.id)
    }

    /// Read the cached manifest for `id`, if it exists.
    pub async fn try_read(&self, id: &Fingerprint) -> Result<Option<Vec<u8>>, StreamError> {
        let path = self.cache_dir.join(id.artifact_name());
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StreamError::Read { path, source: e }),
        }
    }

    /// Manifest for a request path, transcoding on a cache miss.
    ///
    /// `Ok(None)` means the manifest did not show up within the poll budget.
    pub async fn manifest(&self, request_path: &str) -> Result<Option<Vec<u8>>, StreamError> {
        let task = self.task_for(request_path)?;
        if let Some(bytes) = self.try_read(&task.id).await? {
            debug!(task_id = %task.id, "Manifest served from cache");
            return Ok(Some(bytes));
        }

        let id = task.id.clone();
        if self.encoder.encode(task)? == EncodeOutcome::Started {
            info!(task_id = %id, request = %request_path, "Transcode started for stream request");
        }
        self.await_manifest(&id).await
    }

    /// Poll for the manifest at a fixed interval, a bounded number of times.
    pub async fn await_manifest(&self, id: &Fingerprint) -> Result<Option<Vec<u8>>, StreamError> {
        for _ in 0..self.config.poll_attempts {
            if let Some(bytes) = self.try_read(id).await? {
                return Ok(Some(bytes));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        warn!(
            task_id = %id,
            attempts = self.config.poll_attempts,
            "Manifest not ready before poll timeout"
        );
        Ok(None)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::media::TranscodeCommand;
    use assert_matches::assert_matches;
    use std::path::Path;

    fn streaming(template: &str, library_root: &Path, cache: &Path) -> StreamingService {
        let library = Arc::new(LibraryService::new(
            [("movies".to_string(), library_root.to_path_buf())],
            [".mkv".to_string()],
        ));
        let encoder = Arc::new(EncoderService::new(
            TranscodeCommand::parse(template).unwrap(),
            cache,
        ));
        StreamingService::new(library, encoder, cache, StreamingConfig::default())
    }

    #[test]
    fn test_resolve_matches_source_fingerprint() {
        let streaming = streaming("true", Path::new("/mnt/movies"), Path::new("/tmp"));
        let id = streaming.resolve("/movies/Heat.mkv").unwrap();
        assert_eq!(id, Fingerprint::of(Path::new("/mnt/movies/Heat.mkv")));
        assert_eq!(id, streaming.resolve("/movies/Heat.mkv").unwrap());
        assert_ne!(id, streaming.resolve("/movies/Ronin.mkv").unwrap());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_encoder() {
        let cache = tempfile::tempdir().unwrap();
        // An encoder that would fail loudly if it ever ran.
        let streaming = streaming("false", Path::new("/mnt/movies"), cache.path());
        let id = streaming.resolve("/movies/Heat.mkv").unwrap();
        std::fs::write(cache.path().join(id.artifact_name()), b"#EXTM3U\n").unwrap();

        let manifest = streaming.manifest("/movies/Heat.mkv").await.unwrap();
        assert_eq!(manifest.as_deref(), Some(&b"#EXTM3U\n"[..]));
        assert_eq!(streaming.encoder.stats().spawned, 0);
    }

    #[tokio::test]
    async fn test_try_read_missing_is_none() {
        let cache = tempfile::tempdir().unwrap();
        let streaming = streaming("true", Path::new("/mnt/movies"), cache.path());
        let id = streaming.resolve("/movies/none.mkv").unwrap();
        assert!(streaming.try_read(&id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_no_content() {
        let cache = tempfile::tempdir().unwrap();
        let streaming = streaming("true", Path::new("/mnt/movies"), cache.path());
        let id = streaming.resolve("/movies/never.mkv").unwrap();

        let started = tokio::time::Instant::now();
        let result = streaming.await_manifest(&id).await.unwrap();

        assert!(result.is_none());
        assert_eq!(started.elapsed(), Duration::from_millis(500) * 30);
    }

    #[tokio::test]
    async fn test_bad_request_paths() {
        let cache = tempfile::tempdir().unwrap();
        let streaming = streaming("true", Path::new("/mnt/movies"), cache.path());
        assert_matches!(
            streaming.manifest("/unknown/file.mkv").await,
            Err(StreamError::Library(LibraryError::BadRequest(_)))
        );
    }
}
