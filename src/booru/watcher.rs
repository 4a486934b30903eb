//! Rescans the library when files appear in or leave the download directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::booru::download::is_temp_file;
use crate::booru::library::Library;

/// Bursts of events within this window cause a single rescan.
const DEBOUNCE: Duration = Duration::from_millis(250);

pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl LibraryWatcher {
    /// Starts watching the library directory. Must be called from within a
    /// tokio runtime.
    pub fn start(library: Arc<Library>) -> notify::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_relevant(&event) => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => error!("Watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(library.directory(), RecursiveMode::NonRecursive)?;
        info!("Watching {} for library changes", library.directory().display());

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                debug!("Library directory changed, rescanning");
                if let Err(e) = library.rescan().await {
                    error!("Library rescan failed: {}", e);
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for LibraryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_relevant(event: &Event) -> bool {
    let kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
    );
    kind && event.paths.iter().any(|path| !ignored(path))
}

fn ignored(path: &Path) -> bool {
    is_temp_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booru::metadata;
    use crate::booru::post::{Dimensions, Media, Post, Rating};
    use crate::booru::tags::TagCollection;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use notify::event::{CreateKind, ModifyKind};
    use tempfile::tempdir;

    #[test]
    fn test_temp_files_are_not_relevant() {
        let temp = Event::new(EventKind::Create(CreateKind::File)).add_path("/d/.a.png.1.part".into());
        assert!(!is_relevant(&temp));
        let real = Event::new(EventKind::Modify(ModifyKind::Any)).add_path("/d/a.png".into());
        assert!(is_relevant(&real));
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path("/d/a.png".into());
        assert!(!is_relevant(&access));
    }

    #[tokio::test]
    async fn test_new_file_triggers_rescan() {
        let dir = tempdir().unwrap();
        let library = Arc::new(Library::new(dir.path()));
        let _watcher = LibraryWatcher::start(Arc::clone(&library)).unwrap();

        let post = Post {
            source: "booru_downloader::booru::sources::safebooru::Safebooru".to_string(),
            id: 11,
            score: 0,
            rating: Rating::General,
            tags: TagCollection::from_blob("fox"),
            hash: None,
            media: vec![Media::new("https://safebooru.org/images/1/a.png", true, Dimensions::new(2, 2))],
        };
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(2, 2, Rgb([0u8, 0, 0])));
        let bytes = metadata::encode_with_metadata(&image, ImageFormat::Png, &post).unwrap();
        std::fs::write(dir.path().join("a.png"), bytes).unwrap();

        let mut found = false;
        for _ in 0..100 {
            if library.snapshot().len() == 1 {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(found, "watcher did not rescan the library");
    }
}
