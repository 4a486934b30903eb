//! Source abstraction: the optional capabilities an adapter may implement,
//! the capability bitset, and the shared HTTP plumbing adapters use.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::booru::post::Post;
use crate::booru::tags::Tag;

/// Default page ceiling for [`GetAllTags`].
pub const DEFAULT_MAX_TAG_PAGES: u32 = 1000;

/// Error types for source queries
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { status: StatusCode, url: String },

    #[error("Malformed response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("{name} does not support {capability}")]
    Unsupported {
        name: String,
        capability: &'static str,
    },

    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Post ordering understood by every adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PostOrder {
    #[default]
    Default,
    Newest,
    Oldest,
    MostLiked,
    LeastLiked,
}

impl PostOrder {
    pub const ALL: [PostOrder; 5] = [
        PostOrder::Default,
        PostOrder::Newest,
        PostOrder::Oldest,
        PostOrder::MostLiked,
        PostOrder::LeastLiked,
    ];
}

impl FromStr for PostOrder {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "default" | "" => Ok(PostOrder::Default),
            "newest" => Ok(PostOrder::Newest),
            "oldest" => Ok(PostOrder::Oldest),
            "most_liked" | "mostliked" => Ok(PostOrder::MostLiked),
            "least_liked" | "leastliked" => Ok(PostOrder::LeastLiked),
            _ => Err(SourceError::InvalidOrder(s.to_string())),
        }
    }
}

impl fmt::Display for PostOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PostOrder::Default => "default",
            PostOrder::Newest => "newest",
            PostOrder::Oldest => "oldest",
            PostOrder::MostLiked => "most_liked",
            PostOrder::LeastLiked => "least_liked",
        };
        f.write_str(name)
    }
}

/// Tag ordering for tag listing endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TagOrder {
    #[default]
    Date,
    Name,
    Count,
}

impl TagOrder {
    pub const ALL: [TagOrder; 3] = [TagOrder::Date, TagOrder::Name, TagOrder::Count];
}

impl FromStr for TagOrder {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "date" => Ok(TagOrder::Date),
            "name" => Ok(TagOrder::Name),
            "count" => Ok(TagOrder::Count),
            _ => Err(SourceError::InvalidOrder(s.to_string())),
        }
    }
}

impl fmt::Display for TagOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TagOrder::Date => "date",
            TagOrder::Name => "name",
            TagOrder::Count => "count",
        };
        f.write_str(name)
    }
}

/// Bitset of the optional operations a source instance implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const GET_TAGS: Capabilities = Capabilities(1);
    pub const GET_ALL_TAGS: Capabilities = Capabilities(2);
    pub const SEARCH_TAGS: Capabilities = Capabilities(4);
    pub const SEARCH_POSTS: Capabilities = Capabilities(8);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every flag in `other` is set.
    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Inspects which capability accessors return an implementation.
    pub fn of(source: &dyn Source) -> Capabilities {
        let mut capabilities = Capabilities::NONE;
        if source.as_get_tags().is_some() {
            capabilities |= Capabilities::GET_TAGS;
        }
        if source.as_get_all_tags().is_some() {
            capabilities |= Capabilities::GET_ALL_TAGS;
        }
        if source.as_search_tags().is_some() {
            capabilities |= Capabilities::SEARCH_TAGS;
        }
        if source.as_search_posts().is_some() {
            capabilities |= Capabilities::SEARCH_POSTS;
        }
        capabilities
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Capabilities) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Capabilities::SEARCH_POSTS, "search posts"),
            (Capabilities::GET_TAGS, "get tags"),
            (Capabilities::GET_ALL_TAGS, "get all tags"),
            (Capabilities::SEARCH_TAGS, "search tags"),
        ];
        let active: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if active.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&active.join(", "))
        }
    }
}

/// A configured provider. Capability accessors return `Some` for the
/// operations the adapter implements.
pub trait Source: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Stable identity stamped onto every post the adapter produces.
    fn identity(&self) -> &'static str;

    fn as_search_posts(&self) -> Option<&dyn SearchPosts> {
        None
    }

    fn as_get_tags(&self) -> Option<&dyn GetTags> {
        None
    }

    fn as_get_all_tags(&self) -> Option<&dyn GetAllTags> {
        None
    }

    fn as_search_tags(&self) -> Option<&dyn SearchTags> {
        None
    }
}

#[async_trait]
pub trait SearchPosts: Send + Sync {
    /// `page` is 0-based; adapters apply their own offset.
    async fn search_posts(
        &self,
        page: u32,
        limit: u32,
        order: PostOrder,
        include: &[String],
        exclude: &[String],
    ) -> SourceResult<Vec<Post>>;
}

#[async_trait]
pub trait GetTags: Send + Sync {
    async fn get_tags(&self, page: u32, limit: u32, order: TagOrder) -> SourceResult<Vec<Tag>>;
}

#[async_trait]
pub trait SearchTags: Send + Sync {
    /// Tags whose name starts with `prefix`.
    async fn search_tags(
        &self,
        page: u32,
        limit: u32,
        order: TagOrder,
        prefix: &str,
    ) -> SourceResult<Vec<Tag>>;
}

/// Called with the accumulated tag list after each page.
pub type TagProgress<'a> = &'a (dyn Fn(&[Tag]) + Send + Sync);

#[async_trait]
pub trait GetAllTags: Send + Sync {
    async fn get_all_tags(
        &self,
        order: TagOrder,
        progress: Option<TagProgress<'_>>,
        cancel: &CancellationToken,
    ) -> SourceResult<Vec<Tag>>;
}

/// Pages through `getter` until an empty page, cancellation, or `max_pages`.
pub async fn paginate_tags(
    getter: &dyn GetTags,
    order: TagOrder,
    limit: u32,
    max_pages: u32,
    progress: Option<TagProgress<'_>>,
    cancel: &CancellationToken,
) -> SourceResult<Vec<Tag>> {
    let mut tags = Vec::new();
    for page in 0..max_pages {
        if cancel.is_cancelled() {
            debug!("Tag listing cancelled after {} pages", page);
            break;
        }

        let batch = getter.get_tags(page, limit, order).await?;
        if batch.is_empty() {
            trace!("Tag listing exhausted at page {}", page);
            break;
        }

        tags.extend(batch);
        if let Some(progress) = progress {
            progress(&tags);
        }
    }
    Ok(tags)
}

/// A source together with its capability bitset, computed once.
#[derive(Clone)]
pub struct SourceHandle {
    inner: Arc<dyn Source>,
    capabilities: Capabilities,
}

impl SourceHandle {
    pub fn new(inner: Arc<dyn Source>) -> Self {
        let capabilities = Capabilities::of(inner.as_ref());
        Self {
            inner,
            capabilities,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn identity(&self) -> &'static str {
        self.inner.identity()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn search_posts(&self) -> SourceResult<&dyn SearchPosts> {
        self.inner
            .as_search_posts()
            .ok_or_else(|| self.unsupported("search posts"))
    }

    pub fn get_tags(&self) -> SourceResult<&dyn GetTags> {
        self.inner
            .as_get_tags()
            .ok_or_else(|| self.unsupported("get tags"))
    }

    pub fn get_all_tags(&self) -> SourceResult<&dyn GetAllTags> {
        self.inner
            .as_get_all_tags()
            .ok_or_else(|| self.unsupported("get all tags"))
    }

    pub fn search_tags(&self) -> SourceResult<&dyn SearchTags> {
        self.inner
            .as_search_tags()
            .ok_or_else(|| self.unsupported("search tags"))
    }

    fn unsupported(&self, capability: &'static str) -> SourceError {
        SourceError::Unsupported {
            name: self.name().to_string(),
            capability,
        }
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("name", &self.name())
            .field("identity", &self.identity())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Splits a raw query into include and exclude lists; `-tag` excludes.
pub fn split_query<S: AsRef<str>>(query: &[S]) -> (Vec<String>, Vec<String>) {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for term in query {
        let term = term.as_ref().trim();
        match term.strip_prefix('-') {
            Some(tag) if !tag.is_empty() => exclude.push(tag.to_string()),
            Some(_) => {}
            None if !term.is_empty() => include.push(term.to_string()),
            None => {}
        }
    }
    (include, exclude)
}

/// Builds a provider tag expression: sort token first, then de-duplicated
/// includes, then de-duplicated excludes prefixed with `-`.
pub fn tag_expression(sort: Option<&str>, include: &[String], exclude: &[String]) -> String {
    let mut terms: Vec<String> = Vec::new();
    if let Some(sort) = sort.filter(|s| !s.is_empty()) {
        terms.push(sort.to_string());
    }
    terms.extend(dedup(include));
    terms.extend(dedup(exclude).into_iter().map(|tag| format!("-{}", tag)));
    terms.join(" ")
}

fn dedup(tags: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty() && seen.insert(*tag))
        .map(str::to_string)
        .collect()
}

/// Builds the HTTP client shared by every adapter.
pub fn build_http_client(user_agent: &str, timeout_secs: u64) -> SourceResult<Client> {
    let client = Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(timeout_secs))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

pub fn parse_url(url: &str) -> SourceResult<Url> {
    Url::parse(url).map_err(|e| SourceError::InvalidUrl(format!("{}: {}", url, e)))
}

/// Performs a GET and returns the body, failing on non-success status codes.
pub async fn fetch_text(client: &Client, url: Url) -> SourceResult<String> {
    debug!("GET {}", url);
    let response = client.get(url.clone()).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            status,
            url: url.to_string(),
        });
    }

    Ok(response.text().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_tag_expression_dedups_and_prefixes() {
        let expr = tag_expression(
            Some("order:id_desc"),
            &strings(&["fox", "fox", " ", "forest"]),
            &strings(&["cat", "cat"]),
        );
        assert_eq!(expr, "order:id_desc fox forest -cat");
        assert_eq!(tag_expression(Some(""), &[], &strings(&["x"])), "-x");
    }

    #[test]
    fn test_split_query() {
        let (include, exclude) = split_query(&["fox", "-cat", "-", "", " forest "]);
        assert_eq!(include, strings(&["fox", "forest"]));
        assert_eq!(exclude, strings(&["cat"]));
    }

    #[test]
    fn test_order_parsing() {
        assert_eq!("most-liked".parse::<PostOrder>().unwrap(), PostOrder::MostLiked);
        assert_eq!("Newest".parse::<PostOrder>().unwrap(), PostOrder::Newest);
        assert!(matches!("sideways".parse::<PostOrder>(), Err(SourceError::InvalidOrder(_))));
        assert_eq!("count".parse::<TagOrder>().unwrap(), TagOrder::Count);
    }

    struct PagedTags {
        pages: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GetTags for PagedTags {
        async fn get_tags(&self, page: u32, _limit: u32, _order: TagOrder) -> SourceResult<Vec<Tag>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if page >= self.pages {
                return Ok(Vec::new());
            }
            Ok(vec![Tag {
                id: page as u64,
                count: 1,
                name: format!("tag_{}", page),
            }])
        }
    }

    struct OnlySearch;

    impl Source for OnlySearch {
        fn name(&self) -> &str {
            "only-search"
        }

        fn identity(&self) -> &'static str {
            "tests::OnlySearch"
        }

        fn as_search_posts(&self) -> Option<&dyn SearchPosts> {
            Some(self)
        }
    }

    #[async_trait]
    impl SearchPosts for OnlySearch {
        async fn search_posts(
            &self,
            _page: u32,
            _limit: u32,
            _order: PostOrder,
            _include: &[String],
            _exclude: &[String],
        ) -> SourceResult<Vec<Post>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_paginate_stops_on_empty_page() {
        let getter = PagedTags { pages: 3, calls: AtomicU32::new(0) };
        let seen = AtomicU32::new(0);
        let progress = |tags: &[Tag]| {
            seen.store(tags.len() as u32, Ordering::SeqCst);
        };
        let tags = paginate_tags(&getter, TagOrder::Name, 10, 1000, Some(&progress), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(getter.calls.load(Ordering::SeqCst), 4);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_paginate_respects_ceiling_and_cancellation() {
        let getter = PagedTags { pages: 100, calls: AtomicU32::new(0) };
        let tags = paginate_tags(&getter, TagOrder::Date, 10, 5, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tags.len(), 5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let tags = paginate_tags(&getter, TagOrder::Date, 10, 5, None, &cancel).await.unwrap();
        assert!(tags.is_empty());
    }

    #[test]
    fn test_capabilities_computed_from_accessors() {
        let handle = SourceHandle::new(Arc::new(OnlySearch));
        assert_eq!(handle.capabilities(), Capabilities::SEARCH_POSTS);
        assert!(handle.supports(Capabilities::SEARCH_POSTS));
        assert!(!handle.supports(Capabilities::SEARCH_POSTS | Capabilities::GET_TAGS));
        assert!(handle.search_posts().is_ok());
        assert!(matches!(handle.get_tags(), Err(SourceError::Unsupported { .. })));
        assert_eq!(handle.capabilities().to_string(), "search posts");
    }
}
