// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Directory upload watcher.
//!
//! [`DirectoryUploadWatcher`] registers a non-recursive watch on one
//! directory and hands every newly created (or moved-in) file to an
//! [`AttachmentSink`], one at a time, in the order the filesystem reported
//! them:
//!
//! ```text
//! Watching ──(event)──► Uploading ──► Watching
//!     │
//!     └──(stop | directory gone)──► Stopped
//! ```
//!
//! A failed upload is logged and skipped. Losing the directory ends the
//! watch for good; re-creating it does not resume it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trigflow_platform::{ElementHandle, PlatformError, RemotePlatform};

use crate::error::Result;
use crate::lifecycle::{Service, ServiceHealth, ServiceTask};

/// A single file could not be uploaded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UploadError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The platform refused the upload.
    #[error("failed to upload {}: {source}", path.display())]
    Remote {
        /// File path.
        path: PathBuf,
        /// Platform error.
        #[source]
        source: PlatformError,
    },

    /// The attachment reference could not be resolved.
    #[error("attachment reference '{reference}' could not be resolved: {source}")]
    Unresolved {
        /// Reference expression.
        reference: String,
        /// Platform error.
        #[source]
        source: PlatformError,
    },

    /// The path has no usable file name.
    #[error("path has no UTF-8 file name: {}", .0.display())]
    InvalidPath(PathBuf),
}

/// The watch could not be set up or broke down.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WatchError {
    /// Directory could not be created or inspected.
    #[error("cannot access {}: {source}", path.display())]
    Io {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The path exists but is not a directory.
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// The filesystem watch facility failed.
    #[error("filesystem watch failed: {0}")]
    Notify(#[from] notify::Error),

    /// The watched directory disappeared.
    #[error("watched directory {} was removed", .0.display())]
    DirectoryRemoved(PathBuf),

    /// The watch facility stopped delivering events.
    #[error("filesystem event stream closed")]
    EventStreamClosed,

    /// The sink could not be prepared.
    #[error("attachment sink unavailable: {0}")]
    Sink(#[from] UploadError),
}

/// Where new files go.
#[async_trait]
pub trait AttachmentSink: Send + Sync {
    /// Structural checks before the watch starts. A failure keeps the
    /// watcher from starting.
    async fn prepare(&self) -> std::result::Result<(), UploadError> {
        Ok(())
    }

    /// Upload one file.
    async fn upload(&self, path: &Path) -> std::result::Result<(), UploadError>;
}

/// Uploads files to a platform attachment element.
pub struct PlatformAttachmentSink {
    platform: Arc<dyn RemotePlatform>,
    reference: String,
    element: OnceCell<ElementHandle>,
}

impl PlatformAttachmentSink {
    /// Create a sink for the attachment slot named by `reference`.
    pub fn new(platform: Arc<dyn RemotePlatform>, reference: impl Into<String>) -> Self {
        Self {
            platform,
            reference: reference.into(),
            element: OnceCell::new(),
        }
    }

    async fn element(&self) -> std::result::Result<&ElementHandle, UploadError> {
        self.element
            .get_or_try_init(|| async {
                self.platform
                    .resolve_reference(&self.reference)
                    .await
                    .map_err(|source| UploadError::Unresolved {
                        reference: self.reference.clone(),
                        source,
                    })
            })
            .await
    }
}

#[async_trait]
impl AttachmentSink for PlatformAttachmentSink {
    async fn prepare(&self) -> std::result::Result<(), UploadError> {
        let element = self.element().await?;
        debug!(reference = %self.reference, element = %element, "Attachment reference resolved");
        Ok(())
    }

    async fn upload(&self, path: &Path) -> std::result::Result<(), UploadError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::InvalidPath(path.to_path_buf()))?;
        let element = self.element().await?;

        let content = tokio::fs::read(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let bytes = content.len();

        self.platform
            .upload_attachment(element, file_name, content)
            .await
            .map_err(|source| UploadError::Remote {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), bytes, "Attachment written");
        Ok(())
    }
}

/// Watcher loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Waiting for filesystem events.
    Watching,
    /// Handing a file to the sink.
    Uploading,
    /// Loop ended, or never started.
    Stopped,
}

/// Shortest interval between directory checks.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Uploads every file created in one directory.
///
/// A file is uploaded as soon as it appears. Producers of large files should
/// write them elsewhere and rename them into the directory.
pub struct DirectoryUploadWatcher {
    dir: PathBuf,
    poll_interval: Duration,
    sink: Arc<dyn AttachmentSink>,
    state: Arc<watch::Sender<WatcherState>>,
    task: ServiceTask,
}

impl DirectoryUploadWatcher {
    /// Create a watcher for `dir`.
    ///
    /// `poll_interval` bounds how long the loop waits before re-checking the
    /// directory, so a removed directory is noticed within one interval. It
    /// is raised to 10ms if shorter.
    pub fn new(
        dir: impl Into<PathBuf>,
        sink: Arc<dyn AttachmentSink>,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Stopped);
        Self {
            dir: dir.into(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            sink,
            state: Arc::new(state),
            task: ServiceTask::new("watcher"),
        }
    }

    /// Watched directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current loop state.
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Receiver observing loop state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    async fn ensure_dir(&self) -> std::result::Result<(), WatchError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(WatchError::NotADirectory(self.dir.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.dir)
                    .await
                    .map_err(|source| WatchError::Io {
                        path: self.dir.clone(),
                        source,
                    })?;
                info!(dir = %self.dir.display(), "Created watch directory");
                Ok(())
            }
            Err(source) => Err(WatchError::Io {
                path: self.dir.clone(),
                source,
            }),
        }
    }

    async fn register(&self) -> std::result::Result<Registration, WatchError> {
        self.ensure_dir().await?;
        self.sink.prepare().await?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            // The receiver only goes away when the loop has ended.
            let _ = tx.send(event);
        })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        Ok(Registration {
            _watcher: watcher,
            events,
        })
    }
}

struct Registration {
    // Dropping the watcher ends the watch.
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

#[async_trait]
impl Service for DirectoryUploadWatcher {
    fn name(&self) -> &str {
        self.task.name()
    }

    async fn start(&mut self) -> Result<()> {
        self.task.mark_starting();
        let registration = match self.register().await {
            Ok(registration) => registration,
            Err(e) => {
                self.task.mark_failed(e.to_string());
                return Err(e.into());
            }
        };

        info!(
            dir = %self.dir.display(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "Watching directory"
        );
        self.state.send_replace(WatcherState::Watching);

        let watch = WatchLoop {
            dir: self.dir.clone(),
            poll_interval: self.poll_interval,
            sink: self.sink.clone(),
            state: self.state.clone(),
        };
        let cancel = self.task.cancel_token();
        self.task.spawn(async move {
            watch
                .run(registration, cancel)
                .await
                .map_err(|e| e.to_string())
        })
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        let result = self.task.stop(grace).await;
        self.state.send_replace(WatcherState::Stopped);
        result
    }

    fn health(&self) -> ServiceHealth {
        self.task.health()
    }
}

struct WatchLoop {
    dir: PathBuf,
    poll_interval: Duration,
    sink: Arc<dyn AttachmentSink>,
    state: Arc<watch::Sender<WatcherState>>,
}

impl WatchLoop {
    async fn run(
        self,
        registration: Registration,
        cancel: CancellationToken,
    ) -> std::result::Result<(), WatchError> {
        let Registration {
            _watcher: watcher,
            mut events,
        } = registration;

        let mut check = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(dir = %self.dir.display(), "Watcher received shutdown signal");
                    break Ok(());
                }

                _ = check.tick() => {
                    if let Err(e) = self.check_dir().await {
                        break Err(e);
                    }
                }

                received = events.recv() => {
                    let Some(first) = received else {
                        break Err(WatchError::EventStreamClosed);
                    };
                    let mut batch = vec![first];
                    while let Ok(next) = events.try_recv() {
                        batch.push(next);
                    }
                    self.process(batch, &cancel).await;
                }
            }
        };

        drop(watcher);
        self.state.send_replace(WatcherState::Stopped);
        match &result {
            Ok(()) => info!(dir = %self.dir.display(), "Watcher stopped"),
            Err(e) => error!(dir = %self.dir.display(), error = %e, "Watch ended"),
        }
        result
    }

    async fn check_dir(&self) -> std::result::Result<(), WatchError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(WatchError::DirectoryRemoved(self.dir.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WatchError::DirectoryRemoved(self.dir.clone()))
            }
            Err(source) => Err(WatchError::Io {
                path: self.dir.clone(),
                source,
            }),
        }
    }

    async fn process(&self, batch: Vec<notify::Result<Event>>, cancel: &CancellationToken) {
        let paths: Vec<PathBuf> = batch
            .into_iter()
            .filter_map(|event| match event {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(dir = %self.dir.display(), error = %e, "Filesystem watch error");
                    None
                }
            })
            .flat_map(created_paths)
            .collect();

        for (i, path) in paths.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(skipped = paths.len() - i, "Pending uploads dropped on shutdown");
                return;
            }
            self.upload(path).await;
        }
    }

    async fn upload(&self, path: &Path) {
        if let Ok(meta) = tokio::fs::metadata(path).await
            && meta.is_dir()
        {
            debug!(path = %path.display(), "Skipping created directory");
            return;
        }

        self.state.send_replace(WatcherState::Uploading);
        match self.sink.upload(path).await {
            Ok(()) => info!(path = %path.display(), "File uploaded"),
            Err(e) => warn!(path = %path.display(), error = %e, "Upload failed, continuing"),
        }
        self.state.send_replace(WatcherState::Watching);
    }
}

/// Paths a filesystem event introduces into the directory.
fn created_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use notify::event::{CreateKind, DataChange};

    use super::*;

    /// Records attempted uploads, failing the configured file names.
    #[derive(Default)]
    struct RecordingSink {
        attempts: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl AttachmentSink for RecordingSink {
        async fn upload(&self, path: &Path) -> std::result::Result<(), UploadError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            self.attempts.lock().unwrap().push(name.clone());
            if self.failing.contains(&name) {
                return Err(UploadError::InvalidPath(path.to_path_buf()));
            }
            Ok(())
        }
    }

    struct FailingPrepare;

    #[async_trait]
    impl AttachmentSink for FailingPrepare {
        async fn prepare(&self) -> std::result::Result<(), UploadError> {
            Err(UploadError::Unresolved {
                reference: "attachments:Missing".to_string(),
                source: PlatformError::UnresolvedReference("attachments:Missing".to_string()),
            })
        }

        async fn upload(&self, _path: &Path) -> std::result::Result<(), UploadError> {
            Ok(())
        }
    }

    async fn wait_for_attempts(sink: &RecordingSink, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let attempts = sink.attempts.lock().unwrap().clone();
            if attempts.len() >= count || tokio::time::Instant::now() > deadline {
                return attempts;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_created_paths_filters_event_kinds() {
        let path = PathBuf::from("/data/a.txt");
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        let moved_in = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(path.clone());
        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(path.clone());
        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/data/old.txt"))
            .add_path(path.clone());

        assert_eq!(created_paths(create), vec![path.clone()]);
        assert_eq!(created_paths(moved_in), vec![path]);
        assert!(created_paths(written).is_empty());
        assert!(created_paths(renamed).is_empty());
    }

    #[tokio::test]
    async fn test_start_creates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("incoming");
        let mut watcher = DirectoryUploadWatcher::new(
            &dir,
            Arc::new(RecordingSink::default()),
            Duration::from_millis(100),
        );

        watcher.start().await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(watcher.state(), WatcherState::Watching);
        assert_eq!(watcher.health(), ServiceHealth::Running);

        watcher.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(watcher.state(), WatcherState::Stopped);
        assert_eq!(watcher.health(), ServiceHealth::Stopped);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_is_raised() {
        let root = tempfile::tempdir().unwrap();
        let mut watcher = DirectoryUploadWatcher::new(
            root.path(),
            Arc::new(RecordingSink::default()),
            Duration::ZERO,
        );
        assert_eq!(watcher.poll_interval, MIN_POLL_INTERVAL);

        watcher.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(watcher.health(), ServiceHealth::Running);

        watcher.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(watcher.health(), ServiceHealth::Stopped);
    }

    #[tokio::test]
    async fn test_start_rejects_file_path() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let mut watcher = DirectoryUploadWatcher::new(
            &file,
            Arc::new(RecordingSink::default()),
            Duration::from_millis(100),
        );

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Watch(WatchError::NotADirectory(_))
        ));
        assert!(matches!(watcher.health(), ServiceHealth::Failed(_)));
    }

    #[tokio::test]
    async fn test_start_fails_when_sink_cannot_prepare() {
        let root = tempfile::tempdir().unwrap();
        let mut watcher = DirectoryUploadWatcher::new(
            root.path(),
            Arc::new(FailingPrepare),
            Duration::from_millis(100),
        );

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Watch(WatchError::Sink(UploadError::Unresolved { .. }))
        ));
    }

    #[tokio::test]
    async fn test_failed_upload_does_not_stop_the_loop() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink {
            attempts: Mutex::new(Vec::new()),
            failing: vec!["first.txt".to_string()],
        });
        let mut watcher =
            DirectoryUploadWatcher::new(root.path(), sink.clone(), Duration::from_millis(100));
        watcher.start().await.unwrap();

        std::fs::write(root.path().join("first.txt"), b"1").unwrap();
        assert_eq!(wait_for_attempts(&sink, 1).await, ["first.txt"]);
        std::fs::write(root.path().join("second.txt"), b"2").unwrap();
        assert_eq!(wait_for_attempts(&sink, 2).await, ["first.txt", "second.txt"]);
        assert_eq!(watcher.health(), ServiceHealth::Running);

        watcher.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_created_subdirectory_is_not_uploaded() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut watcher =
            DirectoryUploadWatcher::new(root.path(), sink.clone(), Duration::from_millis(100));
        watcher.start().await.unwrap();

        std::fs::create_dir(root.path().join("nested")).unwrap();
        std::fs::write(root.path().join("after.txt"), b"x").unwrap();
        assert_eq!(wait_for_attempts(&sink, 1).await, ["after.txt"]);

        watcher.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_directory_ends_watch() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("watched");
        std::fs::create_dir(&dir).unwrap();
        let mut watcher = DirectoryUploadWatcher::new(
            &dir,
            Arc::new(RecordingSink::default()),
            Duration::from_millis(50),
        );
        let mut state = watcher.subscribe_state();
        watcher.start().await.unwrap();

        std::fs::remove_dir(&dir).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == WatcherState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(watcher.health(), ServiceHealth::Failed(reason) if reason.contains("removed")));
    }
}
