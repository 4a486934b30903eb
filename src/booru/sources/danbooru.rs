//! Danbooru-family adapter (Danbooru, Testbooru).
//!
//! Endpoints:
//! - `GET {base}/posts.json?limit&page&tags` returns an array of posts
//! - `GET {base}/tags.json?limit&page&search[order]` returns an array of tags
//!
//! Pages are 1-based on the wire.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::booru::post::{Dimensions, Media, MediaType, Post, Rating};
use crate::booru::source::{
    fetch_text, paginate_tags, parse_url, tag_expression, GetAllTags, GetTags, PostOrder,
    SearchPosts, SearchTags, Source, SourceError, SourceResult, TagOrder, TagProgress,
    DEFAULT_MAX_TAG_PAGES,
};
use crate::booru::tags::{Tag, TagCollection};

pub const DANBOORU_URL: &str = "https://danbooru.donmai.us";
pub const TESTBOORU_URL: &str = "https://testbooru.donmai.us";

const DANBOORU_IDENTITY: &str = concat!(module_path!(), "::Danbooru");
const TESTBOORU_IDENTITY: &str = concat!(module_path!(), "::Testbooru");

/// Largest page size the tag endpoint accepts.
const TAG_PAGE_LIMIT: u32 = 1000;

const RATINGS: &[(&str, Rating)] = &[
    ("g", Rating::General),
    ("s", Rating::Safe),
    ("q", Rating::Questionable),
    ("e", Rating::Explicit),
];

/// Category name and the wire field it is read from, in output order.
const CATEGORIES: [&str; 5] = ["Meta", "Artist", "General", "Character", "Copyright"];

#[derive(Debug, Deserialize)]
struct WirePost {
    id: Option<u64>,
    score: Option<i64>,
    rating: Option<String>,
    md5: Option<String>,
    #[serde(alias = "tags")]
    tag_string: Option<String>,
    media_asset: Option<WireMediaAsset>,
    tag_string_meta: Option<String>,
    tag_string_artist: Option<String>,
    tag_string_general: Option<String>,
    tag_string_character: Option<String>,
    tag_string_copyright: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMediaAsset {
    variants: Option<Vec<WireVariant>>,
}

#[derive(Debug, Deserialize)]
struct WireVariant {
    #[serde(rename = "type")]
    kind: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    url: Option<String>,
    file_ext: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTag {
    id: Option<u64>,
    name: String,
    post_count: Option<u64>,
}

/// Adapter for Danbooru-compatible boards.
pub struct Danbooru {
    client: Client,
    base: Url,
    name: &'static str,
    identity: &'static str,
}

impl Danbooru {
    pub fn danbooru(client: Client, base: &str) -> SourceResult<Self> {
        Self::with_identity(client, base, "Danbooru", DANBOORU_IDENTITY)
    }

    pub fn testbooru(client: Client, base: &str) -> SourceResult<Self> {
        Self::with_identity(client, base, "Testbooru", TESTBOORU_IDENTITY)
    }

    fn with_identity(
        client: Client,
        base: &str,
        name: &'static str,
        identity: &'static str,
    ) -> SourceResult<Self> {
        let base = parse_url(&format!("{}/", base.trim_end_matches('/')))?;
        Ok(Self {
            client,
            base,
            name,
            identity,
        })
    }

    fn endpoint(&self, path: &str) -> SourceResult<Url> {
        self.base
            .join(path)
            .map_err(|e| SourceError::InvalidUrl(format!("{}: {}", path, e)))
    }

    pub fn search_url(
        &self,
        page: u32,
        limit: u32,
        order: PostOrder,
        include: &[String],
        exclude: &[String],
    ) -> SourceResult<Url> {
        let sort = match order {
            PostOrder::Default => None,
            PostOrder::Newest => Some("order:id_desc"),
            PostOrder::Oldest => Some("order:id_asc"),
            PostOrder::MostLiked => Some("order:score_desc"),
            PostOrder::LeastLiked => Some("order:score_asc"),
        };

        let mut url = self.endpoint("posts.json")?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("page", &(page + 1).to_string())
            .append_pair("tags", &tag_expression(sort, include, exclude));
        Ok(url)
    }

    pub fn tags_url(&self, page: u32, limit: u32, order: TagOrder, prefix: Option<&str>) -> SourceResult<Url> {
        let mut url = self.endpoint("tags.json")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("limit", &limit.to_string())
                .append_pair("page", &(page + 1).to_string())
                .append_pair("search[order]", tag_order_token(order));
            if let Some(prefix) = prefix {
                query.append_pair("search[name_matches]", &format!("{}*", prefix.trim()));
            }
        }
        Ok(url)
    }
}

fn tag_order_token(order: TagOrder) -> &'static str {
    match order {
        TagOrder::Date => "id",
        TagOrder::Name => "name",
        TagOrder::Count => "count",
    }
}

/// Normalizes a `posts.json` response body.
pub fn parse_posts(identity: &str, body: &str) -> SourceResult<Vec<Post>> {
    let wire: Vec<WirePost> = serde_json::from_str(body)?;
    Ok(wire.into_iter().map(|post| normalize_post(identity, post)).collect())
}

fn normalize_post(identity: &str, post: WirePost) -> Post {
    let media = post
        .media_asset
        .and_then(|asset| asset.variants)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|variant| {
            let url = variant.url?;
            let media_type = variant
                .file_ext
                .as_deref()
                .map(MediaType::from_extension)
                .unwrap_or_else(|| MediaType::from_url(&url));
            Some(Media {
                url,
                original: variant.kind.as_deref() == Some("original"),
                media_type,
                dimensions: Dimensions::from_provider(variant.width, variant.height),
            })
        })
        .collect();

    let fields = [
        post.tag_string_meta,
        post.tag_string_artist,
        post.tag_string_general,
        post.tag_string_character,
        post.tag_string_copyright,
    ];
    let categorized = fields.iter().any(Option::is_some);
    let tags = if categorized {
        TagCollection::from_categories(
            CATEGORIES
                .iter()
                .zip(fields)
                .filter_map(|(name, value)| {
                    let value = value.filter(|v| !v.trim().is_empty())?;
                    Some((*name, value.split_whitespace().map(str::to_string).collect::<Vec<_>>()))
                }),
        )
    } else {
        TagCollection::from_blob(post.tag_string.as_deref().unwrap_or_default())
    };

    Post {
        source: identity.to_string(),
        id: post.id.unwrap_or(0),
        score: post.score.unwrap_or(0),
        rating: Rating::lookup(RATINGS, post.rating.as_deref()),
        tags,
        hash: post.md5,
        media,
    }
}

/// Normalizes a `tags.json` response body.
pub fn parse_tags(body: &str) -> SourceResult<Vec<Tag>> {
    let wire: Vec<WireTag> = serde_json::from_str(body)?;
    Ok(wire
        .into_iter()
        .map(|tag| Tag {
            id: tag.id.unwrap_or(0),
            count: tag.post_count.unwrap_or(0).min(u32::MAX as u64) as u32,
            name: tag.name,
        })
        .collect())
}

impl Source for Danbooru {
    fn name(&self) -> &str {
        self.name
    }

    fn identity(&self) -> &'static str {
        self.identity
    }

    fn as_search_posts(&self) -> Option<&dyn SearchPosts> {
        Some(self)
    }

    fn as_get_tags(&self) -> Option<&dyn GetTags> {
        Some(self)
    }

    fn as_get_all_tags(&self) -> Option<&dyn GetAllTags> {
        Some(self)
    }

    fn as_search_tags(&self) -> Option<&dyn SearchTags> {
        Some(self)
    }
}

#[async_trait]
impl SearchPosts for Danbooru {
    async fn search_posts(
        &self,
        page: u32,
        limit: u32,
        order: PostOrder,
        include: &[String],
        exclude: &[String],
    ) -> SourceResult<Vec<Post>> {
        let url = self.search_url(page, limit, order, include, exclude)?;
        let body = fetch_text(&self.client, url).await?;
        parse_posts(self.identity, &body)
    }
}

#[async_trait]
impl GetTags for Danbooru {
    async fn get_tags(&self, page: u32, limit: u32, order: TagOrder) -> SourceResult<Vec<Tag>> {
        let url = self.tags_url(page, limit, order, None)?;
        let body = fetch_text(&self.client, url).await?;
        parse_tags(&body)
    }
}

#[async_trait]
impl SearchTags for Danbooru {
    async fn search_tags(
        &self,
        page: u32,
        limit: u32,
        order: TagOrder,
        prefix: &str,
    ) -> SourceResult<Vec<Tag>> {
        let url = self.tags_url(page, limit, order, Some(prefix))?;
        let body = fetch_text(&self.client, url).await?;
        parse_tags(&body)
    }
}

#[async_trait]
impl GetAllTags for Danbooru {
    async fn get_all_tags(
        &self,
        order: TagOrder,
        progress: Option<TagProgress<'_>>,
        cancel: &CancellationToken,
    ) -> SourceResult<Vec<Tag>> {
        paginate_tags(self, order, TAG_PAGE_LIMIT, DEFAULT_MAX_TAG_PAGES, progress, cancel).await
    }
}
