//! Transcode task registry and encoder subprocess supervision
//!
//! At most one encoder subprocess runs per [Fingerprint]. A request for an id
//! that is already registered is a no-op. Every spawned subprocess gets a
//! watcher task that awaits its exit, deletes the manifest if the encoder
//! failed, and then removes the registry entry. The watcher is the only code
//! path that removes a spawned task, so cleanup happens exactly once whether
//! the process finished on its own or was cancelled.
//!
//! The registry lock only covers bookkeeping. The id is reserved under the
//! lock, the subprocess is spawned outside it, and the reservation is then
//! promoted (or dropped if the spawn failed).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::media::{Fingerprint, TranscodeCommand};
use crate::services::manager::{Service, ServiceHealth};

/// How long [stop](Service::stop) waits for watchers after cancelling everything.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A request to transcode one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeTask {
    pub id: Fingerprint,
    /// Display name (file name of the source)
    pub name: String,
    pub source: PathBuf,
    /// Manifest file name inside the cache directory
    pub artifact: String,
}

impl TranscodeTask {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let source = source.into();
        let id = Fingerprint::of(&source);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.to_string_lossy().into_owned());
        Self {
            artifact: id.artifact_name(),
            id,
            name,
            source,
        }
    }
}

/// Result of a successful [EncoderService::encode] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// A new encoder subprocess was spawned.
    Started,
    /// A task with the same id is already registered; nothing was done.
    Deduplicated,
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to start encoder `{program}` for task {id}: {source}")]
    Spawn {
        id: Fingerprint,
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle events for observers (API, tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeEvent {
    Started { id: Fingerprint, pid: Option<u32> },
    Completed { id: Fingerprint },
    Failed { id: Fingerprint, status: String },
    Cancelled { id: Fingerprint },
}

impl EncodeEvent {
    pub fn id(&self) -> &Fingerprint {
        match self {
            EncodeEvent::Started { id, .. }
            | EncodeEvent::Completed { id }
            | EncodeEvent::Failed { id, .. }
            | EncodeEvent::Cancelled { id } => id,
        }
    }

    /// Whether this event means the task has left the registry.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EncodeEvent::Started { .. })
    }
}

/// Read-only view of a running task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: Fingerprint,
    pub name: String,
    pub path: String,
    pub artifact: String,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

/// Encoder counters since process start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncoderStats {
    pub spawned: u64,
    pub deduplicated: u64,
    pub spawn_failures: u64,
    pub runtime_failures: u64,
    pub running: usize,
}

#[derive(Default)]
struct EncoderCounters {
    spawned: AtomicU64,
    deduplicated: AtomicU64,
    spawn_failures: AtomicU64,
    runtime_failures: AtomicU64,
}

enum TaskState {
    /// Id reserved, subprocess not started yet
    Spawning,
    Running {
        started_at: DateTime<Utc>,
        watcher: Option<JoinHandle<()>>,
    },
}

struct RegisteredTask {
    task: TranscodeTask,
    cancel: CancellationToken,
    state: TaskState,
}

type Registry = Arc<Mutex<HashMap<Fingerprint, RegisteredTask>>>;

/// Encoder service: owns the task registry and supervises subprocesses.
pub struct EncoderService {
    command: TranscodeCommand,
    cache_dir: PathBuf,
    registry: Registry,
    counters: Arc<EncoderCounters>,
    event_tx: broadcast::Sender<EncodeEvent>,
}

impl EncoderService {
    pub fn new(command: TranscodeCommand, cache_dir: impl Into<PathBuf>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            command,
            cache_dir: cache_dir.into(),
            registry: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(EncoderCounters::default()),
            event_tx,
        }
    }

    /// Start transcoding `task` unless a task with the same id is registered.
    ///
    /// Returns once the subprocess has started; it does not wait for it to
    /// finish. A spawn failure is returned to the caller and nothing stays
    /// registered.
    pub fn encode(&self, task: TranscodeTask) -> Result<EncodeOutcome, EncoderError> {
        match self.reserve(&task) {
            Some(cancel) => self.launch(task, cancel),
            None => {
                self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %task.id, "Encode request deduplicated");
                Ok(EncodeOutcome::Deduplicated)
            }
        }
    }

    /// Claim `task.id` as a spawning entry. `None` if the id is already taken.
    fn reserve(&self, task: &TranscodeTask) -> Option<CancellationToken> {
        let mut registry = self.registry.lock();
        if registry.contains_key(&task.id) {
            return None;
        }
        let cancel = CancellationToken::new();
        registry.insert(
            task.id.clone(),
            RegisteredTask {
                task: task.clone(),
                cancel: cancel.clone(),
                state: TaskState::Spawning,
            },
        );
        Some(cancel)
    }

    /// Spawn the subprocess for a reserved task and hand it to a watcher.
    fn launch(
        &self,
        task: TranscodeTask,
        cancel: CancellationToken,
    ) -> Result<EncodeOutcome, EncoderError> {
        let spawned = self
            .command
            .command(&task.source, &task.artifact, &self.cache_dir)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.registry.lock().remove(&task.id);
                self.counters.spawn_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    task_id = %task.id,
                    program = %self.command.program(),
                    error = %e,
                    "Failed to start encoder"
                );
                return Err(EncoderError::Spawn {
                    id: task.id,
                    program: self.command.program().to_string(),
                    source: e,
                });
            }
        };

        let pid = child.id();
        {
            // The watcher needs this lock to deregister, so it cannot finish
            // before the entry below is in place.
            let mut registry = self.registry.lock();
            let watcher = tokio::spawn(Self::watch(
                child,
                task.clone(),
                cancel.clone(),
                self.cache_dir.clone(),
                self.registry.clone(),
                self.counters.clone(),
                self.event_tx.clone(),
            ));
            registry.insert(
                task.id.clone(),
                RegisteredTask {
                    task: task.clone(),
                    cancel,
                    state: TaskState::Running {
                        started_at: Utc::now(),
                        watcher: Some(watcher),
                    },
                },
            );
        }

        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        info!(
            task_id = %task.id,
            pid = ?pid,
            source = %task.source.display(),
            artifact = %task.artifact,
            "Encoder started"
        );
        let _ = self.event_tx.send(EncodeEvent::Started {
            id: task.id,
            pid,
        });
        Ok(EncodeOutcome::Started)
    }

    /// Ask the encoder for `id` to terminate.
    ///
    /// Returns `false` if no such task is registered. Does not wait for the
    /// process to exit; the watcher deregisters it when it does.
    pub fn cancel(&self, id: &Fingerprint) -> bool {
        let registry = self.registry.lock();
        match registry.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(task_id = %id, "Encoder cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Snapshot of running tasks, oldest first.
    pub fn list(&self) -> Vec<TaskInfo> {
        let registry = self.registry.lock();
        let mut tasks: Vec<TaskInfo> = registry
            .values()
            .filter_map(|entry| match &entry.state {
                TaskState::Spawning => None,
                TaskState::Running { started_at, .. } => Some(TaskInfo {
                    id: entry.task.id.clone(),
                    name: entry.task.name.clone(),
                    path: entry.task.source.to_string_lossy().into_owned(),
                    artifact: entry.task.artifact.clone(),
                    started_at: *started_at,
                    cancelled: entry.cancel.is_cancelled(),
                }),
            })
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Whether `id` is registered (spawning or running).
    pub fn is_registered(&self, id: &Fingerprint) -> bool {
        self.registry.lock().contains_key(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EncodeEvent> {
        self.event_tx.subscribe()
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            spawn_failures: self.counters.spawn_failures.load(Ordering::Relaxed),
            runtime_failures: self.counters.runtime_failures.load(Ordering::Relaxed),
            running: self.list().len(),
        }
    }

    /// Watcher: await exit, reap, deregister.
    async fn watch(
        mut child: Child,
        task: TranscodeTask,
        cancel: CancellationToken,
        cache_dir: PathBuf,
        registry: Registry,
        counters: Arc<EncoderCounters>,
        event_tx: broadcast::Sender<EncodeEvent>,
    ) {
        let mut signalled = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = cancel.cancelled(), if !signalled => {
                    signalled = true;
                    terminate(&mut child, &task.id);
                }
            }
        };

        let event = match status {
            Ok(status) if status.success() => {
                info!(task_id = %task.id, "Encoder finished");
                EncodeEvent::Completed {
                    id: task.id.clone(),
                }
            }
            Ok(status) => {
                remove_partial_artifact(&cache_dir, &task).await;
                if signalled {
                    info!(task_id = %task.id, status = %describe(&status), "Encoder cancelled");
                    EncodeEvent::Cancelled {
                        id: task.id.clone(),
                    }
                } else {
                    counters.runtime_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(task_id = %task.id, status = %describe(&status), "Encoder failed");
                    EncodeEvent::Failed {
                        id: task.id.clone(),
                        status: describe(&status),
                    }
                }
            }
            Err(e) => {
                remove_partial_artifact(&cache_dir, &task).await;
                counters.runtime_failures.fetch_add(1, Ordering::Relaxed);
                error!(task_id = %task.id, error = %e, "Failed to wait for encoder");
                EncodeEvent::Failed {
                    id: task.id.clone(),
                    status: e.to_string(),
                }
            }
        };

        registry.lock().remove(&task.id);
        debug!(task_id = %task.id, "Task deregistered");
        let _ = event_tx.send(event);
    }
}

#[async_trait]
impl Service for EncoderService {
    fn name(&self) -> &str {
        "encoder"
    }

    async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        info!(
            service = "encoder",
            program = %self.command.program(),
            cache_dir = %self.cache_dir.display(),
            "Encoder service started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let watchers: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock();
            registry
                .values_mut()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    match &mut entry.state {
                        TaskState::Running { watcher, .. } => watcher.take(),
                        TaskState::Spawning => None,
                    }
                })
                .collect()
        };

        if !watchers.is_empty() {
            info!(service = "encoder", count = watchers.len(), "Waiting for encoders to exit");
            if tokio::time::timeout(STOP_TIMEOUT, futures::future::join_all(watchers))
                .await
                .is_err()
            {
                warn!(service = "encoder", "Timed out waiting for encoders to exit");
            }
        }
        info!(service = "encoder", "Encoder service stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }
}

/// Deliver a termination request. SIGTERM on unix so the encoder can exit
/// cleanly; a hard kill elsewhere.
#[cfg(unix)]
fn terminate(child: &mut Child, id: &Fingerprint) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(task_id = %id, pid, error = %e, "Failed to signal encoder");
            }
        }
        None => debug!(task_id = %id, "Encoder already exited"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, id: &Fingerprint) {
    if let Err(e) = child.start_kill() {
        warn!(task_id = %id, error = %e, "Failed to kill encoder");
    }
}

/// A manifest left behind by a failed encoder must never be served.
async fn remove_partial_artifact(cache_dir: &Path, task: &TranscodeTask) {
    let path = cache_dir.join(&task.artifact);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => info!(task_id = %task.id, file = %path.display(), "Removed partial manifest"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            task_id = %task.id,
            file = %path.display(),
            error = %e,
            "Failed to remove partial manifest"
        ),
    }
}

fn describe(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => status.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn encoder(script: &str, dir: &Path) -> EncoderService {
        let template = format!("sh -c '{}' sh {{input}} {{output}}", script);
        EncoderService::new(TranscodeCommand::parse(&template).unwrap(), dir)
    }

    async fn wait_terminal(
        rx: &mut broadcast::Receiver<EncodeEvent>,
        id: &Fingerprint,
    ) -> EncodeEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.id() == id && event.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .expect("encoder did not finish in time")
    }

    #[test]
    fn test_task_from_path() {
        let task = TranscodeTask::new("/mnt/movies/Heat.mkv");
        assert_eq!(task.name, "Heat.mkv");
        assert_eq!(task.id, Fingerprint::of(Path::new("/mnt/movies/Heat.mkv")));
        assert_eq!(task.artifact, format!("{}.m3u8", task.id));
    }

    #[tokio::test]
    async fn test_successful_encode_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder("echo \"#EXTM3U\" > \"$2\"", dir.path());
        let mut rx = encoder.subscribe();
        let task = TranscodeTask::new("/media/a.mkv");

        assert_eq!(encoder.encode(task.clone()).unwrap(), EncodeOutcome::Started);
        let event = wait_terminal(&mut rx, &task.id).await;

        assert_matches!(event, EncodeEvent::Completed { .. });
        assert!(!encoder.is_registered(&task.id));
        assert!(dir.path().join(&task.artifact).exists());
        assert_eq!(encoder.stats().spawned, 1);
    }

    #[tokio::test]
    async fn test_failed_encode_removes_partial_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder("echo partial > \"$2\"; exit 3", dir.path());
        let mut rx = encoder.subscribe();
        let task = TranscodeTask::new("/media/b.mkv");

        encoder.encode(task.clone()).unwrap();
        let event = wait_terminal(&mut rx, &task.id).await;

        assert_matches!(event, EncodeEvent::Failed { ref status, .. } if status == "exit code 3");
        assert!(!encoder.is_registered(&task.id));
        assert!(!dir.path().join(&task.artifact).exists());
        assert_eq!(encoder.stats().runtime_failures, 1);
    }

    #[tokio::test]
    async fn test_duplicate_requests_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder("sleep 1", dir.path());
        let task = TranscodeTask::new("/media/c.mkv");

        assert_eq!(encoder.encode(task.clone()).unwrap(), EncodeOutcome::Started);
        assert_eq!(
            encoder.encode(task.clone()).unwrap(),
            EncodeOutcome::Deduplicated
        );
        assert_eq!(encoder.list().len(), 1);
        assert_eq!(encoder.stats().deduplicated, 1);
        encoder.cancel(&task.id);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = EncoderService::new(
            TranscodeCommand::parse("/nonexistent/encoder-binary -f hls").unwrap(),
            dir.path(),
        );
        let task = TranscodeTask::new("/media/d.mkv");

        let err = encoder.encode(task.clone()).unwrap_err();
        assert_matches!(err, EncoderError::Spawn { .. });
        assert!(!encoder.is_registered(&task.id));
        assert_eq!(encoder.stats().spawn_failures, 1);

        // A later request is free to try again.
        assert!(encoder.encode(task).is_err());
    }

    #[tokio::test]
    async fn test_cancel_terminates_and_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder("echo partial > \"$2\"; exec sleep 30", dir.path());
        let mut rx = encoder.subscribe();
        let task = TranscodeTask::new("/media/e.mkv");

        encoder.encode(task.clone()).unwrap();
        assert!(encoder.cancel(&task.id));
        assert!(encoder.cancel(&task.id));
        let event = wait_terminal(&mut rx, &task.id).await;

        assert_matches!(event, EncodeEvent::Cancelled { .. });
        assert!(!encoder.is_registered(&task.id));
        assert!(!encoder.cancel(&task.id));
    }

    #[tokio::test]
    async fn test_cancel_while_spawning_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder("echo partial > \"$2\"; exec sleep 30", dir.path());
        let mut rx = encoder.subscribe();
        let task = TranscodeTask::new("/media/g.mkv");

        let token = encoder.reserve(&task).unwrap();
        assert!(encoder.is_registered(&task.id));
        assert!(encoder.list().is_empty());
        assert!(encoder.reserve(&task).is_none());

        assert!(encoder.cancel(&task.id));
        assert!(token.is_cancelled());
        assert_eq!(encoder.launch(task.clone(), token).unwrap(), EncodeOutcome::Started);
        let event = wait_terminal(&mut rx, &task.id).await;

        assert_matches!(event, EncodeEvent::Cancelled { .. });
        assert!(!encoder.is_registered(&task.id));
        assert!(!dir.path().join(&task.artifact).exists());
        assert_eq!(encoder.stats().runtime_failures, 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder("exec sleep 30", dir.path());
        let task = TranscodeTask::new("/media/f.mkv");

        encoder.encode(task.clone()).unwrap();
        encoder.stop().await.unwrap();

        assert!(!encoder.is_registered(&task.id));
        assert!(encoder.list().is_empty());
    }
}
