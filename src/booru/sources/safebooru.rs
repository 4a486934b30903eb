//! Safebooru adapter (Gelbooru 0.2 style `dapi`).
//!
//! `GET https://safebooru.org/index.php?page=dapi&s=post&q=index&json=1&limit&pid&tags`
//! returns an array of posts, or an empty body or the JSON string `""` when
//! nothing matches.
//! `pid` is 0-based.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::booru::post::{Dimensions, Media, MediaType, Post, Rating};
use crate::booru::source::{
    fetch_text, parse_url, tag_expression, PostOrder, SearchPosts, Source, SourceResult,
};
use crate::booru::tags::TagCollection;

pub const SAFEBOORU_URL: &str = "https://safebooru.org";

const IDENTITY: &str = concat!(module_path!(), "::Safebooru");

const RATINGS: &[(&str, Rating)] = &[
    ("general", Rating::General),
    ("safe", Rating::Safe),
    ("sensitive", Rating::Sensitive),
    ("questionable", Rating::Questionable),
    ("explicit", Rating::Explicit),
];

/// Some endpoints send numbers as strings and vice versa.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Loose {
    Number(i64),
    Text(String),
}

impl Loose {
    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            Loose::Number(n) => Some(*n),
            Loose::Text(s) => s.trim().parse().ok(),
        }
    }

    pub(crate) fn as_text(&self) -> String {
        match self {
            Loose::Number(n) => n.to_string(),
            Loose::Text(s) => s.clone(),
        }
    }
}

/// True for the bodies `dapi` endpoints send instead of an empty array.
pub(crate) fn is_empty_listing(body: &str) -> bool {
    matches!(body.trim(), "" | "\"\"")
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: Option<u64>,
    score: Option<Loose>,
    rating: Option<String>,
    tags: Option<String>,
    hash: Option<String>,
    image: Option<String>,
    directory: Option<Loose>,
    width: Option<Loose>,
    height: Option<Loose>,
}

pub struct Safebooru {
    client: Client,
    base: Url,
}

impl Safebooru {
    pub fn new(client: Client) -> SourceResult<Self> {
        Ok(Self {
            client,
            base: parse_url(SAFEBOORU_URL)?,
        })
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
            PostOrder::Newest => Some("order:id:desc"),
            PostOrder::Oldest => Some("order:id:asc"),
            PostOrder::MostLiked => Some("order:score:desc"),
            PostOrder::LeastLiked => Some("order:score:asc"),
        };

        let mut url = self.base.clone();
        url.set_path("/index.php");
        url.query_pairs_mut()
            .append_pair("page", "dapi")
            .append_pair("s", "post")
            .append_pair("q", "index")
            .append_pair("json", "1")
            .append_pair("limit", &limit.to_string())
            .append_pair("pid", &page.to_string())
            .append_pair("tags", &tag_expression(sort, include, exclude));
        Ok(url)
    }
}

/// Normalizes a post listing body. An empty listing means no results.
pub fn parse_posts(body: &str) -> SourceResult<Vec<Post>> {
    if is_empty_listing(body) {
        return Ok(Vec::new());
    }

    let wire: Vec<WirePost> = serde_json::from_str(body)?;
    Ok(wire.into_iter().map(normalize_post).collect())
}

fn normalize_post(post: WirePost) -> Post {
    let mut media = Vec::new();
    if let Some(image) = post.image.as_deref().filter(|i| !i.is_empty()) {
        let directory = post.directory.as_ref().map(Loose::as_text).unwrap_or_default();
        let media_type = MediaType::from_url(image);
        let stem = image.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(image);

        media.push(Media {
            url: format!("{}/thumbnails/{}/thumbnail_{}.jpg", SAFEBOORU_URL, directory, stem),
            original: false,
            media_type,
            dimensions: Dimensions::default(),
        });
        media.push(Media {
            url: format!("{}/images/{}/{}", SAFEBOORU_URL, directory, image),
            original: true,
            media_type,
            dimensions: Dimensions::from_provider(
                post.width.as_ref().and_then(Loose::as_i64),
                post.height.as_ref().and_then(Loose::as_i64),
            ),
        });
    }

    Post {
        source: IDENTITY.to_string(),
        id: post.id.unwrap_or(0),
        score: post.score.as_ref().and_then(Loose::as_i64).unwrap_or(0),
        rating: Rating::lookup(RATINGS, post.rating.as_deref()),
        tags: TagCollection::from_blob(post.tags.as_deref().unwrap_or_default()),
        hash: post.hash,
        media,
    }
}

impl Source for Safebooru {
    fn name(&self) -> &str {
        "Safebooru"
    }

    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn as_search_posts(&self) -> Option<&dyn SearchPosts> {
        Some(self)
    }
}

#[async_trait]
impl SearchPosts for Safebooru {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booru::source::Capabilities;

    #[test]
    fn test_search_url_keeps_zero_based_pid() {
        let source = Safebooru::new(Client::new()).unwrap();
        let url = source
            .search_url(0, 32, PostOrder::MostLiked, &["fox".to_string()], &[])
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("pid".to_string(), "0".to_string())));
        assert!(pairs.contains(&("tags".to_string(), "order:score:desc fox".to_string())));
        assert_eq!(url.path(), "/index.php");
    }

    #[test]
    fn test_parse_builds_thumbnail_and_original() {
        let body = r#"[{"id":5,"score":null,"rating":"sensitive","tags":" fox  forest ",
            "hash":"h","image":"abc.png","directory":4066,"width":"640","height":480}]"#;
        let posts = parse_posts(body).unwrap();
        let post = &posts[0];
        assert_eq!(post.rating, Rating::Sensitive);
        assert_eq!(post.score, 0);
        assert_eq!(post.tags.len(), 2);
        assert_eq!(post.media[0].url, "https://safebooru.org/thumbnails/4066/thumbnail_abc.jpg");
        assert!(!post.media[0].original);
        let original = post.original_media().unwrap();
        assert_eq!(original.url, "https://safebooru.org/images/4066/abc.png");
        assert_eq!(original.dimensions, Dimensions::new(640, 480));
    }

    #[test]
    fn test_empty_body_is_no_results() {
        assert!(parse_posts("").unwrap().is_empty());
        assert!(parse_posts("[]").unwrap().is_empty());
    }

    #[test]
    fn test_quoted_empty_string_is_no_results() {
        assert!(parse_posts("\"\"").unwrap().is_empty());
        assert!(parse_posts(" \"\"\n").unwrap().is_empty());
        assert!(is_empty_listing("  "));
        assert!(!is_empty_listing("\"x\""));
        assert!(parse_posts("\"x\"").is_err());
    }

    #[test]
    fn test_sort_uses_order_tokens() {
        let source = Safebooru::new(Client::new()).unwrap();
        let url = source.search_url(1, 5, PostOrder::Newest, &[], &[]).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("tags".to_string(), "order:id:desc".to_string())));
    }

    #[test]
    fn test_only_search_capability() {
        let source = Safebooru::new(Client::new()).unwrap();
        assert_eq!(Capabilities::of(&source), Capabilities::SEARCH_POSTS);
    }
}
