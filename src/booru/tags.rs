//! Tag collections and tag records shared by every source.
//!
//! A [`TagCollection`] is either a flat set of tags or a mapping from category
//! name to tag set. The representation is fixed at construction and the
//! flattened set used for filtering is computed once, up front.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Category key that marks a collection as uncategorized.
pub const UNCATEGORIZED_KEY: &str = "null";

/// A tag as listed by a source's tag endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    /// Number of posts using the tag.
    pub count: u32,
    pub name: String,
}

/// Immutable set of tags, optionally grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagCollection {
    /// Empty when the collection is uncategorized.
    categories: BTreeMap<String, BTreeSet<String>>,
    /// Union of all categories, or the literal set when uncategorized.
    tags: BTreeSet<String>,
}

impl TagCollection {
    /// Creates an empty, uncategorized collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an uncategorized collection. Blank entries are dropped.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            categories: BTreeMap::new(),
            tags: normalize(tags),
        }
    }

    /// Creates an uncategorized collection from a whitespace separated string.
    pub fn from_blob(blob: &str) -> Self {
        Self::from_tags(blob.split_whitespace())
    }

    /// Creates a categorized collection.
    ///
    /// A single category named [`UNCATEGORIZED_KEY`] yields an uncategorized
    /// collection holding that category's tags.
    pub fn from_categories<I, K, V, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (key, tags) in categories {
            map.entry(key.into()).or_default().extend(normalize(tags));
        }

        if map.is_empty() {
            return Self::new();
        }

        if map.len() == 1 {
            if let Some(tags) = map.remove(UNCATEGORIZED_KEY) {
                return Self {
                    categories: BTreeMap::new(),
                    tags,
                };
            }
        }

        let tags = map.values().flatten().cloned().collect();
        Self {
            categories: map,
            tags,
        }
    }

    /// Returns true when the collection carries categories.
    pub fn is_categorized(&self) -> bool {
        !self.categories.is_empty()
    }

    /// The flattened tag set.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Category name to tag set. Empty when uncategorized.
    pub fn categories(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.categories
    }

    pub fn category(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.categories.get(name)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// All tags joined with a single space.
    pub fn to_blob(&self) -> String {
        join(&self.tags)
    }
}

impl<'a> IntoIterator for &'a TagCollection {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

fn normalize<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .flat_map(|tag| {
            tag.as_ref()
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn join(tags: &BTreeSet<String>) -> String {
    tags.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

impl Serialize for TagCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.is_categorized() {
            return serializer.serialize_str(&self.to_blob());
        }

        let mut map = serializer.serialize_map(Some(self.categories.len()))?;
        for (category, tags) in &self.categories {
            map.serialize_entry(category, &join(tags))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TagCollection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TagCollectionVisitor)
    }
}

struct TagCollectionVisitor;

impl<'de> Visitor<'de> for TagCollectionVisitor {
    type Value = TagCollection;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a space separated tag string or a map of category to tag string")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        Ok(TagCollection::from_blob(value))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(TagCollection::new())
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(TagCollection::new())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut categories = Vec::new();
        while let Some((key, value)) = access.next_entry::<String, Option<String>>()? {
            let value = value.unwrap_or_default();
            let tags: Vec<String> = value.split_whitespace().map(str::to_string).collect();
            categories.push((key, tags));
        }
        Ok(TagCollection::from_categories(categories))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_uncategorized_round_trip() {
        let tags = TagCollection::from_blob("fox  forest\tsolo ");
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, "\"forest fox solo\"");

        let back: TagCollection = serde_json::from_str(&json).unwrap();
        assert!(!back.is_categorized());
        assert_eq!(back.tags(), &set(&["fox", "forest", "solo"]));
    }

    #[test]
    fn test_categorized_round_trip() {
        let tags = TagCollection::from_categories([
            ("artist", vec!["someone"]),
            ("general", vec!["fox", "forest"]),
        ]);
        assert!(tags.is_categorized());
        assert_eq!(tags.tags(), &set(&["someone", "fox", "forest"]));

        let json = serde_json::to_string(&tags).unwrap();
        let back: TagCollection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tags);
        assert_eq!(back.category("general"), Some(&set(&["fox", "forest"])));
    }

    #[test]
    fn test_deserialize_object_ignores_key_order_and_blank_tokens() {
        let back: TagCollection =
            serde_json::from_str(r#"{"general":"b  a ","artist":"x"}"#).unwrap();
        let expected =
            TagCollection::from_categories([("artist", vec!["x"]), ("general", vec!["a", "b"])]);
        assert_eq!(back, expected);
    }

    #[test]
    fn test_null_category_is_uncategorized() {
        let tags = TagCollection::from_categories([(UNCATEGORIZED_KEY, vec!["a", "b"])]);
        assert!(!tags.is_categorized());
        assert_eq!(serde_json::to_string(&tags).unwrap(), "\"a b\"");
    }

    #[test]
    fn test_null_json_is_empty() {
        let back: TagCollection = serde_json::from_str("null").unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn test_flattened_set_is_union_of_categories() {
        let tags = TagCollection::from_categories([
            ("character", vec!["a", "b"]),
            ("copyright", vec!["b", "c"]),
        ]);
        let union: BTreeSet<String> = tags.categories().values().flatten().cloned().collect();
        assert_eq!(tags.tags(), &union);
        assert_eq!(tags.len(), 3);
    }
}
