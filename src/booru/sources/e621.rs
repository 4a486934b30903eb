//! e621 adapter.
//!
//! Endpoints:
//! - `GET {base}/posts.json?limit&page&tags` returns `{"posts": [..]}`
//! - `GET {base}/tags.json?limit&page&search[order]` returns an array of tags,
//!   or `{"tags": []}` when the page is empty
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

pub const E621_URL: &str = "https://e621.net";

const IDENTITY: &str = concat!(module_path!(), "::E621");

/// e621 caps `limit` at 320 per page.
const TAG_PAGE_LIMIT: u32 = 320;

const RATINGS: &[(&str, Rating)] = &[
    ("s", Rating::Safe),
    ("q", Rating::Questionable),
    ("e", Rating::Explicit),
];

#[derive(Debug, Deserialize)]
struct WirePosts {
    #[serde(default)]
    posts: Vec<WirePost>,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: Option<u64>,
    rating: Option<String>,
    file: Option<WireFile>,
    preview: Option<WireFile>,
    sample: Option<WireSample>,
    score: Option<WireScore>,
    tags: Option<WireTags>,
}

#[derive(Debug, Deserialize)]
struct WireFile {
    url: Option<String>,
    ext: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    md5: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireSample {
    #[serde(default)]
    has: bool,
    url: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireScore {
    total: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireTags {
    general: Vec<String>,
    species: Vec<String>,
    character: Vec<String>,
    copyright: Vec<String>,
    artist: Vec<String>,
    invalid: Vec<String>,
    lore: Vec<String>,
    meta: Vec<String>,
}

impl WireTags {
    fn into_collection(self) -> TagCollection {
        let categories = [
            ("General", self.general),
            ("Species", self.species),
            ("Character", self.character),
            ("Copyright", self.copyright),
            ("Artist", self.artist),
            ("Invalid", self.invalid),
            ("Lore", self.lore),
            ("Meta", self.meta),
        ];
        TagCollection::from_categories(categories.into_iter().filter(|(_, tags)| !tags.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct WireTag {
    id: Option<u64>,
    name: String,
    post_count: Option<u64>,
}

/// `tags.json` answers an empty page with an object instead of an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTagPage {
    List(Vec<WireTag>),
    Empty { tags: Vec<WireTag> },
}

pub struct E621 {
    client: Client,
    base: Url,
}

impl E621 {
    pub fn new(client: Client, base: &str) -> SourceResult<Self> {
        Ok(Self {
            client,
            base: parse_url(&format!("{}/", base.trim_end_matches('/')))?,
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
            PostOrder::Oldest => Some("order:id"),
            PostOrder::MostLiked => Some("order:score"),
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
        let order = match order {
            TagOrder::Date => "date",
            TagOrder::Name => "name",
            TagOrder::Count => "count",
        };

        let mut url = self.endpoint("tags.json")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("limit", &limit.to_string())
                .append_pair("page", &(page + 1).to_string())
                .append_pair("search[order]", order)
                .append_pair("search[hide_empty]", "true");
            if let Some(prefix) = prefix {
                query.append_pair("search[name_matches]", &format!("{}*", prefix.trim()));
            }
        }
        Ok(url)
    }
}

pub fn parse_posts(body: &str) -> SourceResult<Vec<Post>> {
    let wire: WirePosts = serde_json::from_str(body)?;
    Ok(wire.posts.into_iter().map(normalize_post).collect())
}

fn normalize_post(post: WirePost) -> Post {
    let mut media = Vec::with_capacity(3);

    if let Some(preview) = post.preview {
        if let Some(url) = preview.url {
            media.push(Media::new(url, false, Dimensions::from_provider(preview.width, preview.height)));
        }
    }

    if let Some(sample) = post.sample.filter(|s| s.has) {
        if let Some(url) = sample.url {
            media.push(Media::new(url, false, Dimensions::from_provider(sample.width, sample.height)));
        }
    }

    let mut hash = None;
    if let Some(file) = post.file {
        hash = file.md5;
        if let Some(url) = file.url {
            let media_type = file
                .ext
                .as_deref()
                .map(MediaType::from_extension)
                .unwrap_or_else(|| MediaType::from_url(&url));
            media.push(Media {
                url,
                original: true,
                media_type,
                dimensions: Dimensions::from_provider(file.width, file.height),
            });
        }
    }

    Post {
        source: IDENTITY.to_string(),
        id: post.id.unwrap_or(0),
        score: post.score.and_then(|s| s.total).unwrap_or(0),
        rating: Rating::lookup(RATINGS, post.rating.as_deref()),
        tags: post.tags.map(WireTags::into_collection).unwrap_or_default(),
        hash,
        media,
    }
}

pub fn parse_tags(body: &str) -> SourceResult<Vec<Tag>> {
    let page: WireTagPage = serde_json::from_str(body)?;
    let wire = match page {
        WireTagPage::List(tags) => tags,
        WireTagPage::Empty { tags } => tags,
    };
    Ok(wire
        .into_iter()
        .map(|tag| Tag {
            id: tag.id.unwrap_or(0),
            count: tag.post_count.unwrap_or(0).min(u32::MAX as u64) as u32,
            name: tag.name,
        })
        .collect())
}

impl Source for E621 {
    fn name(&self) -> &str {
        "e621"
    }

    fn identity(&self) -> &'static str {
        IDENTITY
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
impl SearchPosts for E621 {
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
        parse_posts(&body)
    }
}

#[async_trait]
impl GetTags for E621 {
    async fn get_tags(&self, page: u32, limit: u32, order: TagOrder) -> SourceResult<Vec<Tag>> {
        let url = self.tags_url(page, limit, order, None)?;
        let body = fetch_text(&self.client, url).await?;
        parse_tags(&body)
    }
}

#[async_trait]
impl SearchTags for E621 {
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
impl GetAllTags for E621 {
    async fn get_all_tags(
        &self,
        order: TagOrder,
        progress: Option<TagProgress<'_>>,
        cancel: &CancellationToken,
    ) -> SourceResult<Vec<Tag>> {
        paginate_tags(self, order, TAG_PAGE_LIMIT, DEFAULT_MAX_TAG_PAGES, progress, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booru::source::Capabilities;

    fn query_value(url: &Url, key: &str) -> Option<String> {
        url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_search_url_uses_e621_sort_tokens() {
        let source = E621::new(Client::new(), E621_URL).unwrap();
        let url = source
            .search_url(1, 75, PostOrder::Oldest, &["wolf".to_string()], &[])
            .unwrap();
        assert_eq!(url.as_str().split('?').next(), Some("https://e621.net/posts.json"));
        assert_eq!(query_value(&url, "page").as_deref(), Some("2"));
        assert_eq!(query_value(&url, "tags").as_deref(), Some("order:id wolf"));
    }

    #[test]
    fn test_parse_post_objects() {
        let body = r#"{"posts":[{
            "id": 100, "rating": "s",
            "file": {"url": "https://static.test/data/ab/cd/abcd.webp", "ext": "webp", "width": 800, "height": 600, "md5": "abcd"},
            "preview": {"url": "https://static.test/data/preview/abcd.jpg", "width": 150, "height": 112},
            "sample": {"has": false, "url": "https://static.test/data/sample/abcd.jpg", "width": 800, "height": 600},
            "score": {"up": 5, "down": -1, "total": 4},
            "tags": {"general": ["fox", "forest"], "species": ["fox"], "artist": [], "meta": []}
        }]}"#;
        let post = parse_posts(body).unwrap().remove(0);
        assert_eq!(post.rating, Rating::Safe);
        assert_eq!(post.score, 4);
        assert_eq!(post.hash.as_deref(), Some("abcd"));
        assert_eq!(post.media.len(), 2);
        assert_eq!(post.tags.categories().len(), 2);
        assert_eq!(post.tags.len(), 2);
        let original = post.original_media().unwrap();
        assert_eq!(original.media_type, MediaType::Image);
        assert_eq!(original.dimensions, Dimensions::new(800, 600));
    }

    #[test]
    fn test_deleted_post_has_no_original() {
        let body = r#"{"posts":[{"id":1,"file":{"url":null,"md5":"x"},"rating":"e"}]}"#;
        let post = parse_posts(body).unwrap().remove(0);
        assert!(post.original_media().is_none());
        assert!(post.tags.is_empty());
    }

    #[test]
    fn test_parse_tags_both_shapes() {
        let tags = parse_tags(r#"[{"id":3,"name":"wolf","post_count":99}]"#).unwrap();
        assert_eq!(tags[0].name, "wolf");
        assert_eq!(tags[0].count, 99);
        assert!(parse_tags(r#"{"tags":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn test_capabilities() {
        let source = E621::new(Client::new(), "https://e926.net/").unwrap();
        assert_eq!(Capabilities::of(&source).bits(), 15);
        let url = source.tags_url(0, 10, TagOrder::Name, Some("wo")).unwrap();
        assert_eq!(url.host_str(), Some("e926.net"));
        assert_eq!(query_value(&url, "search[name_matches]").as_deref(), Some("wo*"));
    }
}
