//! Normalized post model produced by every source adapter.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::booru::tags::TagCollection;

/// Content rating shared by all sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rating {
    #[default]
    Unknown,
    General,
    Safe,
    Sensitive,
    Questionable,
    Explicit,
}

impl Rating {
    /// Maps a provider rating string through a fixed lookup table.
    /// Anything not in the table is [`Rating::Unknown`].
    pub fn lookup(table: &[(&str, Rating)], value: Option<&str>) -> Rating {
        let Some(value) = value else {
            return Rating::Unknown;
        };
        table
            .iter()
            .find(|(key, _)| *key == value)
            .map(|(_, rating)| *rating)
            .unwrap_or(Rating::Unknown)
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rating::Unknown => "unknown",
            Rating::General => "general",
            Rating::Safe => "safe",
            Rating::Sensitive => "sensitive",
            Rating::Questionable => "questionable",
            Rating::Explicit => "explicit",
        };
        f.write_str(name)
    }
}

/// Kind of asset a media URL points at, derived from its extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    #[default]
    Unknown,
    Image,
    Video,
}

impl MediaType {
    pub fn from_extension(extension: &str) -> MediaType {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "gif" | "avi" | "mp4" | "mkv" => MediaType::Video,
            "jpg" | "jpeg" | "png" | "webp" => MediaType::Image,
            _ => MediaType::Unknown,
        }
    }

    /// Derives the type from the extension of a URL or path, ignoring any
    /// query string or fragment.
    pub fn from_url(url: &str) -> MediaType {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(MediaType::from_extension)
            .unwrap_or(MediaType::Unknown)
    }
}

/// Width and height in pixels, `0x0` when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Builds dimensions from optional, possibly signed provider values.
    pub fn from_provider(width: Option<i64>, height: Option<i64>) -> Self {
        let clamp = |value: Option<i64>| value.unwrap_or(0).clamp(0, u32::MAX as i64) as u32;
        Self::new(clamp(width), clamp(height))
    }

    pub fn is_unknown(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One concrete asset of a post. `url` is either a network URL or a local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    pub original: bool,
    #[serde(rename = "type")]
    pub media_type: MediaType,
    #[serde(default)]
    pub dimensions: Dimensions,
}

impl Media {
    /// Creates a media entry, deriving its type from the URL's extension.
    pub fn new(url: impl Into<String>, original: bool, dimensions: Dimensions) -> Self {
        let url = url.into();
        let media_type = MediaType::from_url(&url);
        Self {
            url,
            original,
            media_type,
            dimensions,
        }
    }
}

/// A normalized board entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Identity of the adapter that produced the post.
    pub source: String,
    pub id: u64,
    pub score: i64,
    pub rating: Rating,
    pub tags: TagCollection,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub media: Vec<Media>,
}

impl Post {
    /// The first media entry flagged as original. Later ones are ignored.
    pub fn original_media(&self) -> Option<&Media> {
        self.media.iter().find(|media| media.original)
    }

    /// Returns a copy of this post with `media` placed in front of the
    /// existing media list.
    pub fn with_leading_media(&self, media: Media) -> Post {
        let mut list = Vec::with_capacity(self.media.len() + 1);
        list.push(media);
        list.extend(self.media.iter().cloned());
        Post {
            media: list,
            ..self.clone()
        }
    }

    /// True when every `include` tag is present and no `exclude` tag is.
    pub fn matches<I, E>(&self, include: &[I], exclude: &[E]) -> bool
    where
        I: AsRef<str>,
        E: AsRef<str>,
    {
        include.iter().all(|tag| self.tags.contains(tag.as_ref()))
            && !exclude.iter().any(|tag| self.tags.contains(tag.as_ref()))
    }

    /// Last segment of the source identity, for display.
    pub fn source_name(&self) -> &str {
        self.source.rsplit("::").next().unwrap_or(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_with_media(media: Vec<Media>) -> Post {
        Post {
            source: "booru_downloader::booru::sources::danbooru::Danbooru".to_string(),
            id: 1,
            score: 0,
            rating: Rating::Safe,
            tags: TagCollection::from_blob("fox forest"),
            hash: None,
            media,
        }
    }

    #[test]
    fn test_media_type_from_extension() {
        assert_eq!(MediaType::from_extension(".gif"), MediaType::Video);
        assert_eq!(MediaType::from_extension("MKV"), MediaType::Video);
        assert_eq!(MediaType::from_extension("jpeg"), MediaType::Image);
        assert_eq!(MediaType::from_extension("webp"), MediaType::Image);
        assert_eq!(MediaType::from_extension("swf"), MediaType::Unknown);
        assert_eq!(MediaType::from_url("https://x.test/a/b.png?download=1"), MediaType::Image);
        assert_eq!(MediaType::from_url("https://x.test/a/b"), MediaType::Unknown);
    }

    #[test]
    fn test_rating_lookup_is_total() {
        let table = [("q", Rating::Questionable), ("e", Rating::Explicit)];
        assert_eq!(Rating::lookup(&table, Some("q")), Rating::Questionable);
        assert_eq!(Rating::lookup(&table, Some("weird")), Rating::Unknown);
        assert_eq!(Rating::lookup(&table, None), Rating::Unknown);
    }

    #[test]
    fn test_first_original_wins() {
        let post = post_with_media(vec![
            Media::new("https://x.test/thumb.jpg", false, Dimensions::default()),
            Media::new("https://x.test/full.png", true, Dimensions::new(10, 10)),
            Media::new("https://x.test/other.png", true, Dimensions::new(20, 20)),
        ]);
        assert_eq!(post.original_media().unwrap().url, "https://x.test/full.png");
    }

    #[test]
    fn test_with_leading_media_keeps_original_untouched() {
        let post = post_with_media(vec![Media::new("https://x.test/full.png", true, Dimensions::default())]);
        let local = Media::new("/downloads/full.png", true, Dimensions::new(5, 6));
        let rebuilt = post.with_leading_media(local.clone());
        assert_eq!(rebuilt.media.len(), 2);
        assert_eq!(rebuilt.media[0], local);
        assert_eq!(post.media.len(), 1);
    }

    #[test]
    fn test_matches_include_and_exclude() {
        let post = post_with_media(vec![]);
        assert!(post.matches(&["fox"], &["cat"]));
        assert!(!post.matches(&["fox", "cat"], &[] as &[&str]));
        assert!(!post.matches(&[] as &[&str], &["forest"]));
        assert_eq!(post.source_name(), "Danbooru");
    }
}
