//! Local library reconstruction.
//!
//! Every regular file directly inside the download directory is read, its
//! embedded post decoded, and a local [`Media`] entry pointing at the file is
//! put in front of the post's media. Files without readable metadata are
//! skipped.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::{ImageFormat, ImageReader};
use parking_lot::RwLock;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, trace};
use walkdir::WalkDir;

use crate::booru::download::is_temp_file;
use crate::booru::logger::{log_library_scan, OperationStatus};
use crate::booru::metadata;
use crate::booru::post::{Dimensions, Media, MediaType, Post};

/// Error types for library scans
#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for library scans
pub type LibraryResult<T> = Result<T, LibraryError>;

/// Immutable snapshot of posts plus an optional filtered view.
///
/// Replacing or filtering produces a new snapshot; existing clones keep
/// seeing what they saw.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    posts: Arc<Vec<Post>>,
    filtered: Option<Arc<Vec<Post>>>,
}

impl ImageSet {
    pub fn new(posts: Vec<Post>) -> Self {
        Self {
            posts: Arc::new(posts),
            filtered: None,
        }
    }

    /// All posts, ignoring any filter.
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    /// The filtered view when one is set, otherwise all posts.
    pub fn visible(&self) -> &[Post] {
        match &self.filtered {
            Some(filtered) => filtered,
            None => &self.posts,
        }
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered.is_some()
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// Snapshot whose view holds the posts carrying every `include` tag and
    /// no `exclude` tag. Empty lists clear the filter.
    pub fn filter<I, E>(&self, include: &[I], exclude: &[E]) -> ImageSet
    where
        I: AsRef<str>,
        E: AsRef<str>,
    {
        if include.is_empty() && exclude.is_empty() {
            return Self {
                posts: Arc::clone(&self.posts),
                filtered: None,
            };
        }

        let filtered: Vec<Post> = self
            .posts
            .iter()
            .filter(|post| post.matches(include, exclude))
            .cloned()
            .collect();
        Self {
            posts: Arc::clone(&self.posts),
            filtered: Some(Arc::new(filtered)),
        }
    }
}

pub struct LibraryScanner {
    directory: PathBuf,
}

impl LibraryScanner {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Scans on the blocking pool.
    pub async fn scan(&self) -> LibraryResult<Vec<Post>> {
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || scan_directory(&directory)).await?
    }
}

/// Bytes read to sniff a file's format before loading it whole.
const HEADER_LEN: usize = 32;

/// Snapshot plus the generation of the scan that produced it.
#[derive(Default)]
struct Committed {
    generation: u64,
    set: ImageSet,
}

/// The download directory's posts as a replaceable [`ImageSet`].
///
/// Rescans may overlap (watcher and download listener). Each one takes a
/// generation when it starts and only commits if no later scan has already
/// committed.
pub struct Library {
    scanner: LibraryScanner,
    generations: AtomicU64,
    committed: RwLock<Committed>,
}

impl Library {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            scanner: LibraryScanner::new(directory),
            generations: AtomicU64::new(0),
            committed: RwLock::new(Committed::default()),
        }
    }

    pub fn directory(&self) -> &Path {
        self.scanner.directory()
    }

    pub fn snapshot(&self) -> ImageSet {
        self.committed.read().set.clone()
    }

    /// Scans the directory and replaces the snapshot. Any filter is dropped.
    ///
    /// When a scan that started later has already committed, this scan's
    /// result is discarded and the current snapshot's posts are returned.
    pub async fn rescan(&self) -> LibraryResult<Vec<Post>> {
        let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        log_library_scan(self.directory(), OperationStatus::Started, None);
        let posts = match self.scanner.scan().await {
            Ok(posts) => posts,
            Err(e) => {
                log_library_scan(self.directory(), OperationStatus::Failed, None);
                return Err(e);
            }
        };

        let count = posts.len();
        let posts = match self.commit(generation, posts) {
            Ok(posts) => posts,
            Err(current) => {
                debug!("Discarding library scan {} superseded by scan {}", generation, current.0);
                current.1
            }
        };
        log_library_scan(self.directory(), OperationStatus::Completed, Some(count));
        Ok(posts)
    }

    /// Installs `posts` unless a newer generation is already committed, in
    /// which case that generation and its posts come back as the error.
    fn commit(&self, generation: u64, posts: Vec<Post>) -> Result<Vec<Post>, (u64, Vec<Post>)> {
        let mut committed = self.committed.write();
        if committed.generation > generation {
            return Err((committed.generation, committed.set.posts().to_vec()));
        }
        committed.generation = generation;
        committed.set = ImageSet::new(posts.clone());
        Ok(posts)
    }

    /// Replaces the snapshot with a filtered one and returns its view.
    pub fn filter<I, E>(&self, include: &[I], exclude: &[E]) -> Vec<Post>
    where
        I: AsRef<str>,
        E: AsRef<str>,
    {
        let mut committed = self.committed.write();
        let next = committed.set.filter(include, exclude);
        let visible = next.visible().to_vec();
        committed.set = next;
        visible
    }
}

/// Rebuilds posts from the files directly inside `directory`, sorted by path.
/// A missing directory is an empty library.
pub fn scan_directory(directory: &Path) -> LibraryResult<Vec<Post>> {
    if !directory.exists() {
        debug!("Library directory {} does not exist yet", directory.display());
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(directory).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() && !is_temp_file(entry.path()) {
            files.push(entry.into_path());
        }
    }

    let mut posts: Vec<(PathBuf, Post)> = files
        .into_par_iter()
        .filter_map(|path| load_post(&path).map(|post| (path, post)))
        .collect();
    posts.sort_by(|a, b| a.0.cmp(&b.0));

    info!("Library scan found {} posts in {}", posts.len(), directory.display());
    Ok(posts.into_iter().map(|(_, post)| post).collect())
}

/// Reads the first bytes of `path` and reports whether they start an image
/// format that can carry embedded posts.
fn has_metadata_format(path: &Path) -> std::io::Result<bool> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    File::open(path)?.take(HEADER_LEN as u64).read_to_end(&mut header)?;
    Ok(matches!(
        image::guess_format(&header),
        Ok(ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP)
    ))
}

fn load_post(path: &Path) -> Option<Post> {
    match has_metadata_format(path) {
        Ok(true) => {}
        Ok(false) => {
            trace!("Skipping {}: not a supported image", path.display());
            return None;
        }
        Err(e) => {
            debug!("Skipping {}: {}", path.display(), e);
            return None;
        }
    }

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Skipping {}: {}", path.display(), e);
            return None;
        }
    };

    let post = match metadata::extract_post(&bytes) {
        Ok(post) => post,
        Err(e) => {
            trace!("Skipping {}: {}", path.display(), e);
            return None;
        }
    };

    let dimensions = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .map(|(width, height)| Dimensions::new(width, height))
        .unwrap_or_default();

    let local = Media {
        url: path.to_string_lossy().into_owned(),
        original: true,
        media_type: MediaType::Image,
        dimensions,
    };
    Some(post.with_leading_media(local))
}
