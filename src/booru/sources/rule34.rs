//! Rule34 adapter. Same `dapi` surface as Safebooru, but posts carry
//! explicit preview, sample and file URLs.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::booru::post::{Dimensions, Media, Post, Rating};
use crate::booru::source::{
    fetch_text, parse_url, tag_expression, PostOrder, SearchPosts, Source, SourceResult,
};
use crate::booru::sources::safebooru::{is_empty_listing, Loose};
use crate::booru::tags::TagCollection;

pub const RULE34_URL: &str = "https://api.rule34.xxx";

const IDENTITY: &str = concat!(module_path!(), "::Rule34");

const RATINGS: &[(&str, Rating)] = &[
    ("safe", Rating::Safe),
    ("questionable", Rating::Questionable),
    ("explicit", Rating::Explicit),
];

#[derive(Debug, Deserialize)]
struct WirePost {
    id: Option<u64>,
    hash: Option<String>,
    rating: Option<String>,
    tags: Option<String>,
    score: Option<Loose>,
    preview_url: Option<String>,
    sample_url: Option<String>,
    file_url: Option<String>,
    width: Option<Loose>,
    height: Option<Loose>,
    sample_width: Option<Loose>,
    sample_height: Option<Loose>,
}

pub struct Rule34 {
    client: Client,
    base: Url,
}

impl Rule34 {
    pub fn new(client: Client) -> SourceResult<Self> {
        Ok(Self {
            client,
            base: parse_url(RULE34_URL)?,
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
            PostOrder::Newest => Some("sort:id:desc"),
            PostOrder::Oldest => Some("sort:id:asc"),
            PostOrder::MostLiked => Some("sort:score:desc"),
            PostOrder::LeastLiked => Some("sort:score:asc"),
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

pub fn parse_posts(body: &str) -> SourceResult<Vec<Post>> {
    if is_empty_listing(body) {
        return Ok(Vec::new());
    }

    let wire: Vec<WirePost> = serde_json::from_str(body)?;
    Ok(wire.into_iter().map(normalize_post).collect())
}

fn dimension(value: &Option<Loose>) -> Option<i64> {
    value.as_ref().and_then(Loose::as_i64)
}

fn normalize_post(post: WirePost) -> Post {
    let mut media = Vec::with_capacity(3);
    let non_empty = |url: Option<String>| url.filter(|u| !u.is_empty());

    if let Some(url) = non_empty(post.preview_url) {
        media.push(Media::new(url, false, Dimensions::default()));
    }
    if let Some(url) = non_empty(post.sample_url) {
        let dims = Dimensions::from_provider(dimension(&post.sample_width), dimension(&post.sample_height));
        media.push(Media::new(url, false, dims));
    }
    if let Some(url) = non_empty(post.file_url) {
        let dims = Dimensions::from_provider(dimension(&post.width), dimension(&post.height));
        media.push(Media::new(url, true, dims));
    }

    Post {
        source: IDENTITY.to_string(),
        id: post.id.unwrap_or(0),
        score: dimension(&post.score).unwrap_or(0),
        rating: Rating::lookup(RATINGS, post.rating.as_deref()),
        tags: TagCollection::from_blob(post.tags.as_deref().unwrap_or_default()),
        hash: post.hash,
        media,
    }
}

impl Source for Rule34 {
    fn name(&self) -> &str {
        "Rule34"
    }

    fn identity(&self) -> &'static str {
        IDENTITY
    }

    fn as_search_posts(&self) -> Option<&dyn SearchPosts> {
        Some(self)
    }
}

#[async_trait]
impl SearchPosts for Rule34 {
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
    use crate::booru::post::MediaType;

    #[test]
    fn test_search_url() {
        let source = Rule34::new(Client::new()).unwrap();
        let url = source
            .search_url(3, 10, PostOrder::Oldest, &[], &["cat".to_string()])
            .unwrap();
        assert_eq!(url.host_str(), Some("api.rule34.xxx"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("pid".to_string(), "3".to_string())));
        assert!(pairs.contains(&("tags".to_string(), "sort:id:asc -cat".to_string())));
    }

    #[test]
    fn test_parse_marks_only_file_as_original() {
        let body = r#"[{"id":9,"hash":"ff","rating":"explicit","tags":"a b","score":4,
            "preview_url":"https://r.test/thumbnails/1/thumbnail_ff.jpg",
            "sample_url":"https://r.test/samples/1/sample_ff.jpg","sample_width":850,"sample_height":600,
            "file_url":"https://r.test/images/1/ff.mp4","width":1920,"height":1080}]"#;
        let post = parse_posts(body).unwrap().remove(0);
        assert_eq!(post.rating, Rating::Explicit);
        assert_eq!(post.media.len(), 3);
        assert_eq!(post.media.iter().filter(|m| m.original).count(), 1);
        assert_eq!(post.media[1].dimensions, Dimensions::new(850, 600));
        let original = post.original_media().unwrap();
        assert_eq!(original.media_type, MediaType::Video);
        assert_eq!(original.dimensions, Dimensions::new(1920, 1080));
    }

    #[test]
    fn test_general_rating_is_unknown_here() {
        let posts = parse_posts(r#"[{"id":1,"rating":"general"}]"#).unwrap();
        assert_eq!(posts[0].rating, Rating::Unknown);
        assert!(posts[0].media.is_empty());
    }

    #[test]
    fn test_empty_listing_bodies() {
        assert!(parse_posts("").unwrap().is_empty());
        assert!(parse_posts("\"\"").unwrap().is_empty());
        assert!(parse_posts("[]").unwrap().is_empty());
    }
}
