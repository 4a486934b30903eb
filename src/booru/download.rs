//! Download pipeline.
//!
//! This module provides a queue-backed downloader that:
//! 1. Resolves each selected post to its first original image
//! 2. Skips destinations that already exist or repeat within a batch
//! 3. Feeds entries through an unbounded FIFO to one worker per CPU core
//! 4. Re-encodes each image with its post embedded as metadata
//! 5. Writes to a temporary sibling file and renames it into place
//!
//! Progress is tracked per [`DownloadGroup`] and announced on a broadcast
//! channel of [`DownloadEvent`]s.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::booru::image_cache::{Fetcher, ImageCacheError};
use crate::booru::metadata::{self, MetadataError};
use crate::booru::post::{MediaType, Post};

/// Suffix of in-flight files; the library scanner ignores them.
pub const TEMP_SUFFIX: &str = ".part";

const EVENT_CAPACITY: usize = 256;

/// Error types for the download pipeline
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] ImageCacheError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Download queue is closed")]
    QueueClosed,
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Lifecycle of a single entry. Only the worker that claimed it moves it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    Queued = 0,
    Downloading = 1,
    Downloaded = 2,
    Failed = 3,
}

impl EntryState {
    fn from_u8(value: u8) -> EntryState {
        match value {
            1 => EntryState::Downloading,
            2 => EntryState::Downloaded,
            3 => EntryState::Failed,
            _ => EntryState::Queued,
        }
    }
}

#[derive(Debug)]
pub struct DownloadEntry {
    pub post: Post,
    pub url: String,
    pub path: PathBuf,
    pub group_id: Uuid,
    state: AtomicU8,
}

impl DownloadEntry {
    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// One enqueue call's worth of entries.
#[derive(Debug)]
pub struct DownloadGroup {
    pub id: Uuid,
    pub source: Option<String>,
    pub created_at: DateTime<Local>,
    entries: Vec<DownloadEntry>,
    /// Finished entries, failures included.
    progress: AtomicUsize,
}

impl DownloadGroup {
    pub fn entries(&self) -> &[DownloadEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Acquire)
    }

    /// Percentage of finished entries; an empty group counts as done.
    pub fn percentage(&self) -> f64 {
        if self.entries.is_empty() {
            return 100.0;
        }
        self.progress() as f64 * 100.0 / self.entries.len() as f64
    }

    pub fn is_complete(&self) -> bool {
        self.progress() >= self.entries.len()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state() == EntryState::Failed)
            .count()
    }

    /// Returns true when this call finished the group.
    fn record_finished(&self) -> bool {
        self.progress.fetch_add(1, Ordering::AcqRel) + 1 == self.entries.len()
    }
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Completed { group_id: Uuid, path: PathBuf },
    Failed { group_id: Uuid, url: String, error: String },
    GroupFinished { group_id: Uuid },
}

struct Job {
    group: Arc<DownloadGroup>,
    index: usize,
}

/// State shared between the pipeline handle and its workers.
struct Shared {
    fetcher: Arc<dyn Fetcher>,
    queued: AtomicUsize,
    idle: Notify,
    events: broadcast::Sender<DownloadEvent>,
}

pub struct DownloadPipeline {
    download_dir: PathBuf,
    sender: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    groups: RwLock<Vec<Arc<DownloadGroup>>>,
    shared: Arc<Shared>,
}

impl DownloadPipeline {
    /// Creates the download directory and spawns `workers` workers
    /// (at least one). Must be called from within a tokio runtime.
    pub fn start(download_dir: impl AsRef<Path>, fetcher: Arc<dyn Fetcher>, workers: usize) -> DownloadResult<Self> {
        let download_dir = download_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&download_dir)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            fetcher,
            queued: AtomicUsize::new(0),
            idle: Notify::new(),
            events,
        });

        let (sender, receiver) = flume::unbounded();
        let workers = workers.max(1);
        let handles = (0..workers)
            .map(|id| tokio::spawn(run_worker(id, receiver.clone(), Arc::clone(&shared))))
            .collect();

        info!("Download pipeline started with {} workers in {}", workers, download_dir.display());

        Ok(Self {
            download_dir,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            groups: RwLock::new(Vec::new()),
            shared,
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Entries handed to the queue and not yet finished.
    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Every group enqueued so far, oldest first.
    pub fn groups(&self) -> Vec<Arc<DownloadGroup>> {
        self.groups.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    /// Resolves `posts` to download entries and queues them as one group.
    ///
    /// Posts without an original image, whose destination already exists, or
    /// whose destination repeats an earlier post in the batch are skipped.
    /// The group is returned even when nothing survived.
    pub fn enqueue(&self, source: Option<&str>, posts: &[Post]) -> DownloadResult<Arc<DownloadGroup>> {
        let sender = self.sender.lock().clone().ok_or(DownloadError::QueueClosed)?;

        let group_id = Uuid::new_v4();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for post in posts {
            let Some(media) = post.original_media() else {
                debug!("Skipping {} #{}: no original media", post.source_name(), post.id);
                continue;
            };
            if media.media_type != MediaType::Image {
                debug!("Skipping {} #{}: original is not an image", post.source_name(), post.id);
                continue;
            }
            let Some(name) = url_file_name(&media.url) else {
                debug!("Skipping {} #{}: no file name in {}", post.source_name(), post.id, media.url);
                continue;
            };

            let path = self.download_dir.join(name);
            if path.exists() {
                debug!("Skipping {}: already downloaded", path.display());
                continue;
            }
            if !seen.insert(path.clone()) {
                debug!("Skipping {}: duplicate destination in batch", path.display());
                continue;
            }

            entries.push(DownloadEntry {
                post: post.clone(),
                url: media.url.clone(),
                path,
                group_id,
                state: AtomicU8::new(EntryState::Queued as u8),
            });
        }

        let group = Arc::new(DownloadGroup {
            id: group_id,
            source: source.map(str::to_string),
            created_at: Local::now(),
            entries,
            progress: AtomicUsize::new(0),
        });
        self.groups.write().push(Arc::clone(&group));

        let count = group.len();
        self.shared.queued.fetch_add(count, Ordering::AcqRel);
        for index in 0..count {
            let job = Job {
                group: Arc::clone(&group),
                index,
            };
            if sender.send(job).is_err() {
                self.release(count - index);
                return Err(DownloadError::QueueClosed);
            }
        }

        info!(
            "Queued {} of {} posts as group {} ({})",
            count,
            posts.len(),
            group.id,
            source.unwrap_or("unknown source")
        );
        Ok(group)
    }

    fn release(&self, count: usize) {
        if self.shared.queued.fetch_sub(count, Ordering::AcqRel) == count {
            self.shared.idle.notify_waiters();
        }
    }

    /// Resolves once every queued entry has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.queued_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Closes the queue, lets the workers drain it and joins them.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Download worker panicked: {}", e);
            }
        }
        info!("Download pipeline stopped");
    }
}

/// Last path segment of a URL, ignoring query and fragment.
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.next_back()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(TEMP_SUFFIX))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download");
    path.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX))
}

async fn run_worker(id: usize, receiver: flume::Receiver<Job>, shared: Arc<Shared>) {
    debug!("Download worker {} started", id);
    while let Ok(job) = receiver.recv_async().await {
        process(&shared, job).await;
    }
    debug!("Download worker {} stopped", id);
}

async fn process(shared: &Shared, job: Job) {
    let group = &job.group;
    let entry = &group.entries[job.index];
    entry.set_state(EntryState::Downloading);

    let event = match download_entry(shared.fetcher.as_ref(), entry).await {
        Ok(()) => {
            entry.set_state(EntryState::Downloaded);
            info!("Downloaded {}", entry.path.display());
            DownloadEvent::Completed {
                group_id: group.id,
                path: entry.path.clone(),
            }
        }
        Err(e) => {
            entry.set_state(EntryState::Failed);
            error!("Failed to download {} to {}: {}", entry.url, entry.path.display(), e);
            DownloadEvent::Failed {
                group_id: group.id,
                url: entry.url.clone(),
                error: e.to_string(),
            }
        }
    };

    let finished = group.record_finished();

    // no subscribers is fine
    let _ = shared.events.send(event);
    if finished {
        info!("Download group {} finished ({} failed)", group.id, group.failed());
        let _ = shared.events.send(DownloadEvent::GroupFinished { group_id: group.id });
    }

    if shared.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.idle.notify_waiters();
    }
}

async fn download_entry(fetcher: &dyn Fetcher, entry: &DownloadEntry) -> DownloadResult<()> {
    let format = metadata::format_for_path(&entry.path)?;
    let bytes = fetcher.fetch(&entry.url).await?;

    let post = entry.post.clone();
    let encoded = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, MetadataError> {
        let image = image::load_from_memory(&bytes)?;
        metadata::encode_with_metadata(&image, format, &post)
    })
    .await??;

    persist(&entry.path, &encoded).await?;
    Ok(())
}

/// Writes `bytes` to a temp file next to `path` and renames it into place.
/// The temp file is removed when either step fails.
async fn persist(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp = temp_path(path);
    let written = match tokio::fs::write(&temp, bytes).await {
        Ok(()) => tokio::fs::rename(&temp, path).await,
        Err(e) => Err(e),
    };

    if let Err(e) = written {
        match tokio::fs::remove_file(&temp).await {
            Ok(()) => {}
            Err(cleanup) if cleanup.kind() == io::ErrorKind::NotFound => {}
            Err(cleanup) => warn!("Failed to remove {}: {}", temp.display(), cleanup),
        }
        return Err(e);
    }
    Ok(())
}
