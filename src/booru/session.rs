//! Caller-facing facade.
//!
//! A [`Session`] owns everything one user of the crate needs:
//! 1. The sources that were discovered, plus the ones that failed to load
//! 2. A bounded memory image cache for search results and a thumbnail loader
//! 3. The download pipeline
//! 4. The local library, rescanned after downloads and on directory changes
//!
//! The search results and the library are both held as [`ImageSet`]
//! snapshots that are replaced, never mutated.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::booru::config_loader::{AppConfig, ConfigError};
use crate::booru::dataset::{export_dataset, DatasetResult, DatasetSettings, ExportReport};
use crate::booru::download::{DownloadError, DownloadEvent, DownloadGroup, DownloadPipeline, DownloadResult};
use crate::booru::image_cache::{load_limiter, Fetcher, HttpFetcher, LocalThumbnailLoader, MemoryCachedLoader};
use crate::booru::library::{ImageSet, Library, LibraryError, LibraryResult};
use crate::booru::logger::{log_download, log_search, OperationStatus};
use crate::booru::post::Post;
use crate::booru::source::{build_http_client, tag_expression, PostOrder, SourceError, SourceHandle, SourceResult};
use crate::booru::sources::{Discovery, SourceContext, SourceRegistry};
use crate::booru::watcher::LibraryWatcher;

/// Error types for building a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

pub struct Session {
    config: AppConfig,
    discovery: Discovery,
    image_cache: Arc<MemoryCachedLoader>,
    thumbnails: Arc<LocalThumbnailLoader>,
    pipeline: Arc<DownloadPipeline>,
    library: Arc<Library>,
    search_set: RwLock<ImageSet>,
    rescans: Mutex<Option<JoinHandle<()>>>,
    stop_rescans: CancellationToken,
    watcher: Mutex<Option<LibraryWatcher>>,
}

impl Session {
    /// Validates the config, builds the HTTP client, discovers the enabled
    /// sources and starts the session over them.
    pub async fn from_config(config: AppConfig) -> SessionResult<Arc<Self>> {
        config.search.order()?;
        let client = build_http_client(&config.http.user_agent, config.http.timeout_secs)?;
        let ctx = SourceContext::new(client.clone(), config.sources.clone());
        let discovery = SourceRegistry::builtin().discover(&config.sources.enabled, &ctx);
        Self::new(config, discovery, Arc::new(HttpFetcher::new(client))).await
    }

    /// Starts the pipeline and the rescan listener, then scans the library
    /// once. Must be called from within a tokio runtime.
    pub async fn new(config: AppConfig, discovery: Discovery, fetcher: Arc<dyn Fetcher>) -> SessionResult<Arc<Self>> {
        let limiter = load_limiter(config.pools.image_load_concurrency);
        let image_cache = Arc::new(MemoryCachedLoader::with_capacity(
            Arc::clone(&fetcher),
            Arc::clone(&limiter),
            config.pools.image_cache_entries,
        ));
        let thumbnails = Arc::new(LocalThumbnailLoader::new(limiter, config.library.thumbnail_width));

        let download_dir = PathBuf::from(&config.paths.download_directory);
        let pipeline = Arc::new(DownloadPipeline::start(
            &download_dir,
            fetcher,
            config.pools.worker_count(),
        )?);
        let library = Arc::new(Library::new(download_dir));

        let stop_rescans = CancellationToken::new();
        let rescans = tokio::spawn(rescan_on_download(
            pipeline.subscribe(),
            Arc::clone(&library),
            Arc::downgrade(&pipeline),
            stop_rescans.clone(),
        ));

        let watcher = if config.library.watch {
            match LibraryWatcher::start(Arc::clone(&library)) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("Library watcher unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let session = Arc::new(Self {
            config,
            discovery,
            image_cache,
            thumbnails,
            pipeline,
            library,
            search_set: RwLock::new(ImageSet::default()),
            rescans: Mutex::new(Some(rescans)),
            stop_rescans,
            watcher: Mutex::new(watcher),
        });

        session.rescan_library().await?;
        info!(
            "Session ready with {} sources ({} failed)",
            session.discovery.sources.len(),
            session.discovery.failed.len()
        );
        Ok(session)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Sources that constructed successfully, in configuration order.
    pub fn sources(&self) -> &[SourceHandle] {
        &self.discovery.sources
    }

    pub fn find_source(&self, name: &str) -> Option<&SourceHandle> {
        self.discovery.find(name)
    }

    /// Names that failed to construct, with their errors.
    pub fn failed_sources(&self) -> &[(String, SourceError)] {
        &self.discovery.failed
    }

    /// Runs a search and makes its posts the current search set. The memory
    /// image cache is cleared so it only ever holds the latest results.
    pub async fn search(
        &self,
        source: &SourceHandle,
        page: u32,
        limit: u32,
        order: PostOrder,
        include: &[String],
        exclude: &[String],
    ) -> SourceResult<Vec<Post>> {
        let searcher = source.search_posts()?;
        let query = tag_expression(None, include, exclude);
        log_search(source.name(), page, &query, OperationStatus::Started, None);

        match searcher.search_posts(page, limit, order, include, exclude).await {
            Ok(posts) => {
                self.image_cache.clear_cache();
                *self.search_set.write() = ImageSet::new(posts.clone());
                log_search(source.name(), page, &query, OperationStatus::Completed, Some(posts.len()));
                Ok(posts)
            }
            Err(e) => {
                log_search(source.name(), page, &query, OperationStatus::Failed, None);
                Err(e)
            }
        }
    }

    /// Queues `posts` as one download group.
    pub fn enqueue_download(&self, source: Option<&str>, posts: &[Post]) -> DownloadResult<Arc<DownloadGroup>> {
        let group = self.pipeline.enqueue(source, posts)?;
        log_download(group.id, source, OperationStatus::Started, group.len());
        Ok(group)
    }

    /// Filters the library set and returns the visible posts.
    pub fn filter_image_set<I, E>(&self, include: &[I], exclude: &[E]) -> Vec<Post>
    where
        I: AsRef<str>,
        E: AsRef<str>,
    {
        self.library.filter(include, exclude)
    }

    pub async fn rescan_library(&self) -> LibraryResult<Vec<Post>> {
        self.library.rescan().await
    }

    /// Exports the visible library posts (the current filter applies) as a
    /// training dataset under `destination`.
    pub async fn export_dataset(&self, destination: PathBuf, settings: DatasetSettings) -> DatasetResult<ExportReport> {
        let posts = self.library.snapshot().visible().to_vec();
        tokio::task::spawn_blocking(move || export_dataset(&posts, &destination, &settings)).await?
    }

    /// Latest search results.
    pub fn search_set(&self) -> ImageSet {
        self.search_set.read().clone()
    }

    /// Latest library snapshot.
    pub fn library_set(&self) -> ImageSet {
        self.library.snapshot()
    }

    pub fn image_cache(&self) -> &Arc<MemoryCachedLoader> {
        &self.image_cache
    }

    pub fn thumbnails(&self) -> &Arc<LocalThumbnailLoader> {
        &self.thumbnails
    }

    pub fn pipeline(&self) -> &Arc<DownloadPipeline> {
        &self.pipeline
    }

    /// Drains queued downloads, then stops the listener and the watcher.
    /// Events already sent by the pipeline are handled before the listener
    /// exits, so the library reflects every finished download.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
        self.stop_rescans.cancel();
        let rescans = self.rescans.lock().take();
        if let Some(handle) = rescans {
            if let Err(e) = handle.await {
                error!("Rescan listener panicked: {}", e);
            }
        }
        drop(self.watcher.lock().take());
        debug!("Session shut down");
    }
}

/// Rescans the library after completed downloads. Completions that arrive
/// while a scan is pending are folded into it. Once `stop` fires, whatever
/// is still buffered is handled and the listener returns.
async fn rescan_on_download(
    mut events: broadcast::Receiver<DownloadEvent>,
    library: Arc<Library>,
    pipeline: Weak<DownloadPipeline>,
    stop: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            received = events.recv() => received,
            _ = stop.cancelled() => {
                if drain_events(&mut events, &pipeline) {
                    rescan_after_download(&library).await;
                }
                break;
            }
        };

        let mut rescan = match received {
            Ok(event) => handle_event(event, &pipeline),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Missed {} download events", skipped);
                true
            }
            Err(RecvError::Closed) => break,
        };
        rescan |= drain_events(&mut events, &pipeline);

        if rescan {
            rescan_after_download(&library).await;
        }
    }
    debug!("Download event listener stopped");
}

/// Returns true when the event calls for a rescan.
fn handle_event(event: DownloadEvent, pipeline: &Weak<DownloadPipeline>) -> bool {
    match event {
        DownloadEvent::Completed { .. } => true,
        DownloadEvent::Failed { .. } => false,
        DownloadEvent::GroupFinished { group_id } => {
            group_finished(pipeline, group_id);
            false
        }
    }
}

/// Handles every buffered event without waiting. True if any needs a rescan.
fn drain_events(events: &mut broadcast::Receiver<DownloadEvent>, pipeline: &Weak<DownloadPipeline>) -> bool {
    let mut rescan = false;
    loop {
        match events.try_recv() {
            Ok(event) => rescan |= handle_event(event, pipeline),
            Err(TryRecvError::Lagged(_)) => rescan = true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return rescan,
        }
    }
}

async fn rescan_after_download(library: &Library) {
    if let Err(e) = library.rescan().await {
        error!("Library rescan after download failed: {}", e);
    }
}

fn group_finished(pipeline: &Weak<DownloadPipeline>, group_id: uuid::Uuid) {
    let Some(pipeline) = pipeline.upgrade() else {
        return;
    };
    if let Some(group) = pipeline.groups().into_iter().find(|group| group.id == group_id) {
        let status = if group.failed() == 0 {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        };
        log_download(group.id, group.source.as_deref(), status, group.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::booru::image_cache::tests::MockFetcher;
    use crate::booru::image_cache::ImageLoader;
    use crate::booru::post::{Dimensions, Media, Rating};
    use crate::booru::source::{Capabilities, SearchPosts, Source};
    use crate::booru::tags::TagCollection;

    struct MockSource;

    impl Source for MockSource {
        fn name(&self) -> &str {
            "Mock"
        }

        fn identity(&self) -> &'static str {
            "booru_downloader::booru::session::tests::MockSource"
        }

        fn as_search_posts(&self) -> Option<&dyn SearchPosts> {
            Some(self)
        }
    }

    #[async_trait]
    impl SearchPosts for MockSource {
        async fn search_posts(
            &self,
            page: u32,
            limit: u32,
            _order: PostOrder,
            include: &[String],
            _exclude: &[String],
        ) -> SourceResult<Vec<Post>> {
            let first = u64::from(page * limit) + 1;
            Ok((first..first + u64::from(limit))
                .map(|id| Post {
                    source: self.identity().to_string(),
                    id,
                    score: 0,
                    rating: Rating::Safe,
                    tags: TagCollection::from_tags(include.iter().cloned().chain(Some(format!("n{}", id)))),
                    hash: None,
                    media: vec![
                        Media::new(format!("https://mock.test/thumb/{}.jpg", id), false, Dimensions::new(2, 1)),
                        Media::new(format!("https://mock.test/images/{}.png", id), true, Dimensions::new(4, 2)),
                    ],
                })
                .collect())
        }
    }

    struct Silent;

    impl Source for Silent {
        fn name(&self) -> &str {
            "Silent"
        }

        fn identity(&self) -> &'static str {
            "booru_downloader::booru::session::tests::Silent"
        }
    }

    fn config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.download_directory = dir.join("downloads").to_string_lossy().into_owned();
        config.pools.download_workers = 2;
        config.library.watch = false;
        config
    }

    fn discovery() -> Discovery {
        Discovery {
            sources: vec![SourceHandle::new(Arc::new(MockSource)), SourceHandle::new(Arc::new(Silent))],
            failed: vec![("nowhere".to_string(), SourceError::UnknownSource("nowhere".to_string()))],
        }
    }

    async fn wait_for_library(session: &Session, count: usize) -> bool {
        for _ in 0..100 {
            if session.library_set().len() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_search_download_and_filter() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::default());
        let session = Session::new(config(dir.path()), discovery(), fetcher.clone()).await.unwrap();
        assert!(session.library_set().is_empty());
        assert_eq!(session.failed_sources().len(), 1);

        let source = session.find_source("mock").unwrap().clone();
        assert!(source.supports(Capabilities::SEARCH_POSTS));

        // warm the cache so the search can be seen clearing it
        session.image_cache().try_load("https://mock.test/warm.png").await.unwrap();
        assert_eq!(session.image_cache().len(), 1);

        let posts = session
            .search(&source, 0, 3, PostOrder::Default, &["fox".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(posts.len(), 3);
        assert_eq!(session.search_set().len(), 3);
        assert!(session.image_cache().is_empty());

        let group = session.enqueue_download(Some(source.name()), &posts[..2]).unwrap();
        assert_eq!(group.len(), 2);
        session.pipeline().wait_idle().await;
        assert!(group.is_complete());
        assert_eq!(fetcher.calls("https://mock.test/images/1.png"), 1);

        assert!(wait_for_library(&session, 2).await);
        session.shutdown().await;
        let library = session.library_set();
        assert!(library.posts()[0].media[0].url.ends_with("1.png"));
        assert_eq!(library.posts()[0].media.len(), 3);

        let visible = session.filter_image_set(&["n2"], &[] as &[&str]);
        assert_eq!(visible.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2]);
        assert!(session.library_set().is_filtered());

        let rescanned = session.rescan_library().await.unwrap();
        assert_eq!(rescanned.len(), 2);
        assert!(!session.library_set().is_filtered());

        assert!(matches!(
            session.enqueue_download(None, &posts),
            Err(DownloadError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_searches_keep_their_own_filters() {
        let dir = tempdir().unwrap();
        let session = Session::new(config(dir.path()), discovery(), Arc::new(MockFetcher::default()))
            .await
            .unwrap();
        let source = session.find_source("Mock").unwrap().clone();

        let fox = vec!["fox".to_string()];
        let cat = vec!["cat".to_string()];
        let (foxes, cats) = tokio::join!(
            session.search(&source, 0, 4, PostOrder::Newest, &fox, &[]),
            session.search(&source, 0, 4, PostOrder::Newest, &cat, &[]),
        );
        let (foxes, cats) = (foxes.unwrap(), cats.unwrap());
        assert!(foxes.iter().all(|p| p.tags.contains("fox") && !p.tags.contains("cat")));
        assert!(cats.iter().all(|p| p.tags.contains("cat") && !p.tags.contains("fox")));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_keeps_rescan_for_last_download() {
        let dir = tempdir().unwrap();
        let session = Session::new(config(dir.path()), discovery(), Arc::new(MockFetcher::default()))
            .await
            .unwrap();
        let source = session.find_source("Mock").unwrap().clone();
        let posts = session
            .search(&source, 0, 2, PostOrder::Default, &[], &[])
            .await
            .unwrap();

        session.enqueue_download(None, &posts).unwrap();
        // no waiting: shutdown itself must leave the library up to date
        session.shutdown().await;
        assert_eq!(session.library_set().len(), 2);
    }

    #[tokio::test]
    async fn test_export_follows_library_filter() {
        let dir = tempdir().unwrap();
        let session = Session::new(config(dir.path()), discovery(), Arc::new(MockFetcher::default()))
            .await
            .unwrap();
        let source = session.find_source("Mock").unwrap().clone();
        let posts = session
            .search(&source, 0, 3, PostOrder::Default, &["fox".to_string()], &[])
            .await
            .unwrap();
        session.enqueue_download(None, &posts).unwrap();
        session.shutdown().await;

        session.filter_image_set(&["n2"], &[] as &[&str]);
        let out = tempdir().unwrap();
        let report = session
            .export_dataset(out.path().to_path_buf(), DatasetSettings::default())
            .await
            .unwrap();
        assert_eq!((report.exported, report.failed), (1, 0));
        let caption = std::fs::read_to_string(report.directory.join("2.txt")).unwrap();
        assert_eq!(caption, "fox, n2");
        assert!(report.directory.join("2.png").exists());
    }

    #[tokio::test]
    async fn test_search_requires_capability() {
        let dir = tempdir().unwrap();
        let session = Session::new(config(dir.path()), discovery(), Arc::new(MockFetcher::default()))
            .await
            .unwrap();

        let silent = session.find_source("Silent").unwrap().clone();
        let result = session.search(&silent, 0, 3, PostOrder::Default, &[], &[]).await;
        assert!(matches!(result, Err(SourceError::Unsupported { .. })));
        assert!(session.search_set().is_empty());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_existing_library_is_scanned_at_start() {
        let dir = tempdir().unwrap();
        let first = Session::new(config(dir.path()), discovery(), Arc::new(MockFetcher::default()))
            .await
            .unwrap();
        let source = first.find_source("Mock").unwrap().clone();
        let posts = first.search(&source, 1, 1, PostOrder::MostLiked, &[], &[]).await.unwrap();
        first.enqueue_download(None, &posts).unwrap();
        first.shutdown().await;

        let second = Session::new(config(dir.path()), discovery(), Arc::new(MockFetcher::default()))
            .await
            .unwrap();
        assert_eq!(second.library_set().len(), 1);
        assert_eq!(second.library_set().posts()[0].id, 2);
        second.shutdown().await;
    }
}
