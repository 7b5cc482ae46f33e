//! Transcode cache size management
//!
//! [CacheStore] keeps a snapshot of the regular files directly inside the
//! cache directory, ordered oldest first by modification time, and evicts the
//! oldest files while the total is over the byte budget. [CacheService] runs
//! a scan-then-evict cycle immediately on start and then once per period.
//!
//! The cache directory is assumed flat. Subdirectories are skipped, so any
//! bytes stored in them do not count towards the budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::manager::{Service, ServiceHealth};

/// Default period between eviction cycles.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// One regular file in the cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub file_name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Complete view of the cache directory at the time of the last scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    /// Oldest first
    pub entries: Vec<CacheEntry>,
    pub total_size: u64,
}

/// Size tracking and eviction for a single cache directory.
pub struct CacheStore {
    dir: PathBuf,
    max_size: i64,
    snapshot: RwLock<Arc<CacheSnapshot>>,
    last_error: RwLock<Option<String>>,
}

impl CacheStore {
    /// `max_size <= 0` disables eviction.
    pub fn new(dir: impl Into<PathBuf>, max_size: i64) -> Self {
        Self {
            dir: dir.into(),
            max_size,
            snapshot: RwLock::new(Arc::new(CacheSnapshot::default())),
            last_error: RwLock::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    pub fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    /// Tracked aggregate size as of the last scan/eviction.
    pub fn size(&self) -> u64 {
        self.snapshot.read().total_size
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshot.read().clone()
    }

    /// Error from the most recent failed scan, cleared by the next good one.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Rescan the directory and publish a fresh snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn update(&self) -> std::io::Result<()> {
        match self.scan().await {
            Ok(snapshot) => {
                debug!(
                    dir = %self.dir.display(),
                    size = snapshot.total_size,
                    files = snapshot.entries.len(),
                    "Cache directory scanned"
                );
                *self.snapshot.write() = Arc::new(snapshot);
                *self.last_error.write() = None;
                Ok(())
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to scan cache directory");
                *self.last_error.write() = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn scan(&self) -> std::io::Result<CacheSnapshot> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut entries = Vec::new();
        let mut total_size = 0u64;

        while let Some(entry) = dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Removed between listing and stat
                Err(e) => {
                    debug!(file = ?entry.file_name(), error = %e, "Skipping cache entry");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            total_size += metadata.len();
            entries.push(CacheEntry {
                file_name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified,
            });
        }

        entries.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(CacheSnapshot {
            entries,
            total_size,
        })
    }

    /// Remove the oldest files until the tracked size fits the budget.
    ///
    /// A file that cannot be removed is logged and skipped; the next-oldest
    /// one is tried instead. Returns how many files were removed.
    pub async fn shrink(&self) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let budget = self.max_size as u64;
        let current = self.snapshot();
        if current.total_size <= budget {
            return 0;
        }

        let mut total = current.total_size;
        let mut remaining = Vec::with_capacity(current.entries.len());
        let mut removed = 0;

        for entry in &current.entries {
            if total <= budget {
                remaining.push(entry.clone());
                continue;
            }
            let path = self.dir.join(&entry.file_name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    total = total.saturating_sub(entry.size);
                    removed += 1;
                    info!(file = %entry.file_name, size = entry.size, "Evicted cached file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    total = total.saturating_sub(entry.size);
                    debug!(file = %entry.file_name, "Cached file already gone");
                }
                Err(e) => {
                    warn!(file = %entry.file_name, error = %e, "Failed to evict cached file");
                    remaining.push(entry.clone());
                }
            }
        }

        if total > budget {
            warn!(size = total, max_size = budget, "Cache still over budget after eviction");
        }
        *self.snapshot.write() = Arc::new(CacheSnapshot {
            entries: remaining,
            total_size: total,
        });
        removed
    }

    /// One scan-then-evict cycle. A failed scan skips eviction.
    pub async fn run_cycle(&self) {
        if self.update().await.is_ok() {
            self.shrink().await;
        }
    }
}

/// Runs the eviction cycle for a [CacheStore] in the background.
pub struct CacheService {
    store: Arc<CacheStore>,
    scan_interval: Duration,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheService {
    pub fn new(dir: impl Into<PathBuf>, max_size: i64) -> Self {
        Self {
            store: Arc::new(CacheStore::new(dir, max_size)),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Whether the background cycle is currently running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn run(store: Arc<CacheStore>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // Stop is only observed between cycles.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            store.run_cycle().await;
        }
        debug!(service = "cache", "Eviction loop exited");
    }
}

#[async_trait]
impl Service for CacheService {
    fn name(&self) -> &str {
        "cache"
    }

    async fn start(&self) -> Result<()> {
        if !self.store.is_enabled() {
            info!(
                service = "cache",
                max_size = self.store.max_size(),
                "Cache eviction disabled"
            );
            return Ok(());
        }
        if self.is_running() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run(
            self.store.clone(),
            self.scan_interval,
            cancel.clone(),
        ));
        *self.cancel.lock() = Some(cancel);
        *self.task.lock() = Some(handle);

        info!(
            service = "cache",
            dir = %self.store.dir().display(),
            max_size = self.store.max_size(),
            interval_secs = self.scan_interval.as_secs(),
            "Cache eviction started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(service = "cache", error = %e, "Eviction loop ended abnormally");
            }
        }
        info!(service = "cache", "Cache eviction stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if let Some(err) = self.store.last_error() {
            return Ok(ServiceHealth::degraded(format!("last scan failed: {}", err)));
        }
        if self.store.is_enabled() && !self.is_running() {
            return Ok(ServiceHealth::unhealthy("eviction loop not running"));
        }
        Ok(ServiceHealth::healthy())
    }
}
