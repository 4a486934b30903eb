//! Bounded-concurrency image loading.
//!
//! All loaders share one [`Semaphore`] so that no more than a fixed number of
//! loads run at once, whichever loader they go through:
//! 1. [`UncachedLoader`] fetches and decodes on every call
//! 2. [`MemoryCachedLoader`] keeps decoded images per URL, single-flight
//! 3. [`LocalThumbnailLoader`] decodes local files and shrinks them for previews
//!
//! Permits are RAII guards, so a failed or cancelled load still releases one.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, trace, warn};

/// Default number of concurrent image loads.
pub const DEFAULT_LOAD_CONCURRENCY: usize = 3;

/// Default preview width for local thumbnails.
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 256;

/// Error types for image loading
#[derive(Error, Debug)]
pub enum ImageCacheError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: StatusCode, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Load limiter closed")]
    Closed(#[from] tokio::sync::AcquireError),
}

/// Result type for image loading
pub type ImageCacheResult<T> = Result<T, ImageCacheError>;

/// Creates the semaphore shared by every loader.
pub fn load_limiter(permits: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(permits.max(1)))
}

/// Raw byte retrieval, shared by the loaders and the download pipeline.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> ImageCacheResult<Vec<u8>>;
}

/// [`Fetcher`] over the shared HTTP client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> ImageCacheResult<Vec<u8>> {
        trace!("Fetching {}", url);
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageCacheError::Status {
                status,
                url: url.to_string(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
pub trait ImageLoader: Send + Sync {
    async fn try_load(&self, url: &str) -> ImageCacheResult<Arc<DynamicImage>>;

    /// Like [`ImageLoader::try_load`] but logs the error and yields `None`.
    async fn load(&self, url: &str) -> Option<Arc<DynamicImage>> {
        match self.try_load(url).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Failed to load image {}: {}", url, e);
                None
            }
        }
    }
}

/// Decodes on the blocking pool.
async fn decode(bytes: Vec<u8>) -> ImageCacheResult<DynamicImage> {
    Ok(tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await??)
}

async fn fetch_and_decode(
    fetcher: &dyn Fetcher,
    limiter: &Semaphore,
    url: &str,
) -> ImageCacheResult<Arc<DynamicImage>> {
    let _permit = limiter.acquire().await?;
    let bytes = fetcher.fetch(url).await?;
    Ok(Arc::new(decode(bytes).await?))
}

/// Fetches and decodes on every call.
pub struct UncachedLoader {
    fetcher: Arc<dyn Fetcher>,
    limiter: Arc<Semaphore>,
}

impl UncachedLoader {
    pub fn new(fetcher: Arc<dyn Fetcher>, limiter: Arc<Semaphore>) -> Self {
        Self { fetcher, limiter }
    }
}

#[async_trait]
impl ImageLoader for UncachedLoader {
    async fn try_load(&self, url: &str) -> ImageCacheResult<Arc<DynamicImage>> {
        fetch_and_decode(self.fetcher.as_ref(), &self.limiter, url).await
    }
}

type CacheCell = Arc<OnceCell<Arc<DynamicImage>>>;

/// Keeps decoded images keyed by URL.
///
/// The first caller for a URL performs the load and concurrent callers await
/// the same cell. A failed load removes its cell so a later call retries.
pub struct MemoryCachedLoader {
    fetcher: Arc<dyn Fetcher>,
    limiter: Arc<Semaphore>,
    cache: DashMap<String, CacheCell>,
    /// 0 means unbounded.
    max_entries: usize,
}

impl MemoryCachedLoader {
    pub fn new(fetcher: Arc<dyn Fetcher>, limiter: Arc<Semaphore>) -> Self {
        Self::with_capacity(fetcher, limiter, 0)
    }

    /// Once `max_entries` images are retained the whole cache is flushed
    /// before a new URL is admitted.
    pub fn with_capacity(fetcher: Arc<dyn Fetcher>, limiter: Arc<Semaphore>, max_entries: usize) -> Self {
        Self {
            fetcher,
            limiter,
            cache: DashMap::new(),
            max_entries,
        }
    }

    pub fn clear_cache(&self) {
        let count = self.cache.len();
        self.cache.clear();
        debug!("Cleared {} cached images", count);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn cell(&self, url: &str) -> CacheCell {
        let existing = self.cache.get(url).map(|cell| Arc::clone(cell.value()));
        if let Some(cell) = existing {
            return cell;
        }

        if self.max_entries > 0 && self.cache.len() >= self.max_entries {
            debug!("Image cache reached {} entries, flushing", self.max_entries);
            self.cache.clear();
        }

        Arc::clone(
            self.cache
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        )
    }
}

#[async_trait]
impl ImageLoader for MemoryCachedLoader {
    async fn try_load(&self, url: &str) -> ImageCacheResult<Arc<DynamicImage>> {
        let cell = self.cell(url);
        let result = cell
            .get_or_try_init(|| fetch_and_decode(self.fetcher.as_ref(), &self.limiter, url))
            .await
            .cloned();

        if result.is_err() {
            self.cache.remove_if(url, |_, current| Arc::ptr_eq(current, &cell));
        }
        result
    }
}

/// Decodes local files and shrinks them to a fixed preview width.
pub struct LocalThumbnailLoader {
    limiter: Arc<Semaphore>,
    width: u32,
}

impl LocalThumbnailLoader {
    pub fn new(limiter: Arc<Semaphore>, width: u32) -> Self {
        Self {
            limiter,
            width: width.max(1),
        }
    }
}

/// Shrinks `image` to `width`, preserving aspect ratio. Never upscales.
pub fn thumbnail(image: DynamicImage, width: u32) -> DynamicImage {
    if image.width() <= width {
        return image;
    }
    let height = (image.height() as u64 * width as u64 / image.width() as u64).max(1) as u32;
    image.resize_exact(width, height, FilterType::Triangle)
}

#[async_trait]
impl ImageLoader for LocalThumbnailLoader {
    async fn try_load(&self, path: &str) -> ImageCacheResult<Arc<DynamicImage>> {
        let _permit = self.limiter.acquire().await?;
        let bytes = tokio::fs::read(Path::new(path)).await?;
        let width = self.width;
        let image = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes).map(|image| thumbnail(image, width))
        })
        .await??;
        Ok(Arc::new(image))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;
    use image::{ImageBuffer, ImageFormat, Rgba};
    use parking_lot::Mutex;
    use tempfile::tempdir;

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = ImageBuffer::from_pixel(width, height, Rgba([200u8, 10, 10, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    /// Serves a tiny PNG for every URL, tracking concurrency and call counts.
    #[derive(Default)]
    pub(crate) struct MockFetcher {
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub calls: Mutex<HashMap<String, usize>>,
        pub failures_left: Mutex<HashMap<String, usize>>,
    }

    impl MockFetcher {
        pub(crate) fn fail(&self, url: &str, times: usize) {
            self.failures_left.lock().insert(url.to_string(), times);
        }

        pub(crate) fn calls(&self, url: &str) -> usize {
            self.calls.lock().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> ImageCacheResult<Vec<u8>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            *self.calls.lock().entry(url.to_string()).or_default() += 1;

            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let fail = {
                let mut failures = self.failures_left.lock();
                match failures.get_mut(url) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                return Err(ImageCacheError::Io(std::io::Error::other("mock failure")));
            }
            Ok(png_bytes(4, 2))
        }
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_permits() {
        let fetcher = Arc::new(MockFetcher::default());
        let loader = UncachedLoader::new(fetcher.clone(), load_limiter(3));

        let urls: Vec<String> = (0..100).map(|i| format!("https://img.test/{}.png", i)).collect();
        let results = join_all(urls.iter().map(|url| loader.load(url))).await;

        assert!(results.iter().all(Option::is_some));
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_memory_cache_bounds_distinct_loads() {
        let fetcher = Arc::new(MockFetcher::default());
        let loader = MemoryCachedLoader::new(fetcher.clone(), load_limiter(4));

        let urls: Vec<String> = (0..100).map(|i| format!("https://img.test/distinct/{}.png", i)).collect();
        let results = join_all(urls.iter().map(|url| loader.try_load(url))).await;

        assert!(results.iter().all(Result::is_ok));
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 4);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) >= 1);
        assert_eq!(loader.len(), 100);
        assert!(urls.iter().all(|url| fetcher.calls(url) == 1));
    }

    #[tokio::test]
    async fn test_memory_cache_is_single_flight() {
        let fetcher = Arc::new(MockFetcher::default());
        let loader = MemoryCachedLoader::new(fetcher.clone(), load_limiter(3));
        let url = "https://img.test/same.png";

        let results = join_all((0..10).map(|_| loader.try_load(url))).await;
        let images: Vec<_> = results.into_iter().map(Result::unwrap).collect();

        assert_eq!(fetcher.calls(url), 1);
        assert!(images.iter().all(|image| Arc::ptr_eq(image, &images[0])));
        assert_eq!(loader.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_cache() {
        let fetcher = Arc::new(MockFetcher::default());
        let loader = MemoryCachedLoader::new(fetcher.clone(), load_limiter(3));
        let url = "https://img.test/flaky.png";
        fetcher.fail(url, 1);

        assert!(loader.load(url).await.is_none());
        assert!(loader.is_empty());

        let image = loader.try_load(url).await.unwrap();
        assert_eq!(image.width(), 4);
        assert_eq!(fetcher.calls(url), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_refetch() {
        let fetcher = Arc::new(MockFetcher::default());
        let loader = MemoryCachedLoader::new(fetcher.clone(), load_limiter(1));
        let url = "https://img.test/a.png";

        loader.try_load(url).await.unwrap();
        loader.try_load(url).await.unwrap();
        assert_eq!(fetcher.calls(url), 1);

        loader.clear_cache();
        assert!(loader.is_empty());
        loader.try_load(url).await.unwrap();
        assert_eq!(fetcher.calls(url), 2);
    }

    #[tokio::test]
    async fn test_capacity_flushes_cache() {
        let fetcher = Arc::new(MockFetcher::default());
        let loader = MemoryCachedLoader::with_capacity(fetcher.clone(), load_limiter(2), 2);

        loader.try_load("https://img.test/1.png").await.unwrap();
        loader.try_load("https://img.test/2.png").await.unwrap();
        assert_eq!(loader.len(), 2);

        loader.try_load("https://img.test/3.png").await.unwrap();
        assert_eq!(loader.len(), 1);
    }

    #[tokio::test]
    async fn test_local_thumbnail_downsamples() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.png");
        std::fs::write(&path, png_bytes(512, 128)).unwrap();

        let loader = LocalThumbnailLoader::new(load_limiter(1), DEFAULT_THUMBNAIL_WIDTH);
        let image = loader.try_load(path.to_str().unwrap()).await.unwrap();
        assert_eq!((image.width(), image.height()), (256, 64));

        let missing = dir.path().join("missing.png");
        assert!(loader.load(missing.to_str().unwrap()).await.is_none());
    }

    #[test]
    fn test_thumbnail_never_upscales() {
        let small = image::load_from_memory(&png_bytes(10, 10)).unwrap();
        let same = thumbnail(small, 256);
        assert_eq!(same.width(), 10);
    }
}
