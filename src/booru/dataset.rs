//! Training dataset export.
//!
//! Library posts are written to `<destination>/<repetitions>_<keyword>/` as
//! one image and one `.txt` caption per post:
//! 1. The image is optionally letterboxed onto a black square, resized and
//!    re-encoded in the target format.
//! 2. The caption is the post's tag string, built by [`tag_string`] from the
//!    tag settings.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::booru::logger::{log_dataset_export, OperationStatus};
use crate::booru::post::Post;

/// Error types for dataset export
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Destination does not exist: {0}")]
    MissingDestination(PathBuf),

    #[error("Post {0} has no local file")]
    NoLocalFile(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for dataset export
pub type DatasetResult<T> = Result<T, DatasetError>;

/// How a post's tags become a caption.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TagSettings {
    pub remove_underscores: bool,
    pub escape_parentheses: bool,
    /// Compared case-insensitively against category names.
    pub ignore_categories: BTreeSet<String>,
    pub ignore_tags: BTreeSet<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    Png,
    Jpeg,
    Bmp,
    Gif,
    Qoi,
    Webp,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 6] = [
        TargetFormat::Png,
        TargetFormat::Jpeg,
        TargetFormat::Bmp,
        TargetFormat::Gif,
        TargetFormat::Qoi,
        TargetFormat::Webp,
    ];

    pub fn image_format(self) -> ImageFormat {
        match self {
            TargetFormat::Png => ImageFormat::Png,
            TargetFormat::Jpeg => ImageFormat::Jpeg,
            TargetFormat::Bmp => ImageFormat::Bmp,
            TargetFormat::Gif => ImageFormat::Gif,
            TargetFormat::Qoi => ImageFormat::Qoi,
            TargetFormat::Webp => ImageFormat::WebP,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Png => "png",
            TargetFormat::Jpeg => "jpeg",
            TargetFormat::Bmp => "bmp",
            TargetFormat::Gif => "gif",
            TargetFormat::Qoi => "qoi",
            TargetFormat::Webp => "webp",
        }
    }
}

/// Image processing applied before encoding. A zero dimension leaves that
/// side free; both zero means no resize.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ImageSettings {
    pub letterbox: bool,
    pub resize_width: u32,
    pub resize_height: u32,
    pub target_format: TargetFormat,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TrainingSettings {
    pub keyword: String,
    pub repetitions: u32,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            keyword: "dataset".to_string(),
            repetitions: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DatasetSettings {
    pub tags: TagSettings,
    pub image: ImageSettings,
    pub training: TrainingSettings,
}

impl DatasetSettings {
    /// Folder name inside the destination, `<repetitions>_<keyword>`.
    pub fn folder_name(&self) -> String {
        format!("{}_{}", self.training.repetitions, self.training.keyword)
    }
}

/// Outcome of one export run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub directory: PathBuf,
    pub exported: usize,
    pub failed: usize,
}

/// Joins a post's tags with `", "`.
///
/// Categorized tags are emitted category by category, skipping ignored
/// categories. Ignored tags are dropped in either form.
pub fn tag_string(post: &Post, settings: &TagSettings) -> String {
    let kept = |tag: &&String| !settings.ignore_tags.contains(tag.as_str());
    let tags: Vec<&String> = if post.tags.is_categorized() {
        post.tags
            .categories()
            .iter()
            .filter(|(category, _)| !settings.ignore_categories.contains(&category.to_lowercase()))
            .flat_map(|(_, tags)| tags)
            .filter(kept)
            .collect()
    } else {
        post.tags.tags().iter().filter(kept).collect()
    };

    let mut joined = tags.iter().map(|tag| tag.as_str()).collect::<Vec<_>>().join(", ");
    if settings.remove_underscores {
        joined = joined.replace('_', " ");
    }
    if settings.escape_parentheses {
        joined = joined.replace('(', "\\(").replace(')', "\\)");
    }
    joined
}

/// Centers the image on an opaque black square as wide as its longer side.
pub fn letterbox(image: &DynamicImage) -> DynamicImage {
    let side = image.width().max(image.height());
    let mut canvas = RgbaImage::from_pixel(side, side, Rgba([0, 0, 0, 255]));
    let x = (side - image.width()) / 2;
    let y = (side - image.height()) / 2;
    imageops::replace(&mut canvas, &image.to_rgba8(), i64::from(x), i64::from(y));
    DynamicImage::ImageRgba8(canvas)
}

/// Applies letterboxing and resizing.
pub fn prepare_image(mut image: DynamicImage, settings: &ImageSettings) -> DynamicImage {
    if settings.letterbox {
        image = letterbox(&image);
    }

    match (settings.resize_width, settings.resize_height) {
        (0, 0) => image,
        (width, 0) => image.resize(width, image.height(), FilterType::Lanczos3),
        (0, height) => image.resize(image.width(), height, FilterType::Lanczos3),
        (width, height) => image.resize_exact(width, height, FilterType::Lanczos3),
    }
}

/// Converts to a pixel layout the target encoder accepts.
fn encodable(image: DynamicImage, format: TargetFormat) -> DynamicImage {
    match format {
        TargetFormat::Png => image,
        TargetFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ if image.color().has_alpha() => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    }
}

/// The file a library post was loaded from.
fn local_file(post: &Post) -> Option<&Path> {
    post.original_media()
        .map(|media| Path::new(media.url.as_str()))
        .filter(|path| path.is_file())
}

fn export_post(post: &Post, directory: &Path, settings: &DatasetSettings) -> DatasetResult<PathBuf> {
    let source = local_file(post).ok_or(DatasetError::NoLocalFile(post.id))?;
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| post.id.to_string());

    let format = settings.image.target_format;
    let image = prepare_image(image::open(source)?, &settings.image);
    let image_path = directory.join(format!("{}.{}", stem, format.extension()));
    encodable(image, format).save_with_format(&image_path, format.image_format())?;

    std::fs::write(directory.join(format!("{}.txt", stem)), tag_string(post, &settings.tags))?;
    Ok(image_path)
}

/// Writes every post into `destination/<folder_name>`. `destination` must
/// exist; the dataset folder is created. Posts that fail are logged and
/// counted, the rest are still exported.
pub fn export_dataset(posts: &[Post], destination: &Path, settings: &DatasetSettings) -> DatasetResult<ExportReport> {
    if !destination.is_dir() {
        return Err(DatasetError::MissingDestination(destination.to_path_buf()));
    }

    let directory = destination.join(settings.folder_name());
    log_dataset_export(&directory, OperationStatus::Started, None, None);
    std::fs::create_dir_all(&directory)?;

    let failed = posts
        .par_iter()
        .filter(|post| match export_post(post, &directory, settings) {
            Ok(path) => {
                debug!("Exported post {} to {}", post.id, path.display());
                false
            }
            Err(e) => {
                warn!("Failed to export post {}: {}", post.id, e);
                true
            }
        })
        .count();

    let report = ExportReport {
        exported: posts.len() - failed,
        failed,
        directory,
    };
    let status = if failed == 0 {
        OperationStatus::Completed
    } else {
        OperationStatus::Failed
    };
    log_dataset_export(&report.directory, status, Some(report.exported), Some(report.failed));
    Ok(report)
}
