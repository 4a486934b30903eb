//! Built-in adapters and the registry that constructs them by name.
//!
//! Discovery works in three steps:
//! 1. Each enabled name is looked up in the registry
//! 2. The constructor runs against the shared [`SourceContext`]
//! 3. Successes are wrapped in a [`SourceHandle`], failures are recorded
//!
//! A failure never stops the remaining names from being constructed.

pub mod danbooru;
pub mod e621;
pub mod rule34;
pub mod safebooru;

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Client;
use tracing::{info, warn};

use crate::booru::config_loader::Sources;
use crate::booru::source::{Source, SourceError, SourceHandle, SourceResult};

pub use danbooru::Danbooru;
pub use e621::E621;
pub use rule34::Rule34;
pub use safebooru::Safebooru;

/// Names registered by [`SourceRegistry::builtin`], in display order.
pub const BUILTIN_SOURCES: [&str; 5] = ["danbooru", "testbooru", "safebooru", "rule34", "e621"];

/// Everything a constructor may need.
#[derive(Clone)]
pub struct SourceContext {
    pub client: Client,
    pub sources: Sources,
}

impl SourceContext {
    pub fn new(client: Client, sources: Sources) -> Self {
        Self { client, sources }
    }
}

pub type SourceConstructor = fn(&SourceContext) -> SourceResult<Arc<dyn Source>>;

/// Result of [`SourceRegistry::discover`].
#[derive(Debug, Default)]
pub struct Discovery {
    pub sources: Vec<SourceHandle>,
    pub failed: Vec<(String, SourceError)>,
}

impl Discovery {
    pub fn find(&self, name: &str) -> Option<&SourceHandle> {
        self.sources
            .iter()
            .find(|handle| handle.name().eq_ignore_ascii_case(name))
    }
}

/// Maps a lowercase source name to its constructor.
#[derive(Default)]
pub struct SourceRegistry {
    constructors: BTreeMap<String, SourceConstructor>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every adapter shipped with the crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("danbooru", |ctx| {
            Ok(Arc::new(Danbooru::danbooru(ctx.client.clone(), &ctx.sources.danbooru_url)?))
        });
        registry.register("testbooru", |ctx| {
            Ok(Arc::new(Danbooru::testbooru(ctx.client.clone(), &ctx.sources.testbooru_url)?))
        });
        registry.register("safebooru", |ctx| Ok(Arc::new(Safebooru::new(ctx.client.clone())?)));
        registry.register("rule34", |ctx| Ok(Arc::new(Rule34::new(ctx.client.clone())?)));
        registry.register("e621", |ctx| {
            Ok(Arc::new(E621::new(ctx.client.clone(), &ctx.sources.e621_url)?))
        });
        registry
    }

    /// Adds or replaces a constructor.
    pub fn register(&mut self, name: &str, constructor: SourceConstructor) {
        self.constructors.insert(name.to_ascii_lowercase(), constructor);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn construct(&self, name: &str, ctx: &SourceContext) -> SourceResult<SourceHandle> {
        let constructor = self
            .constructors
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| SourceError::UnknownSource(name.to_string()))?;
        Ok(SourceHandle::new(constructor(ctx)?))
    }

    /// Constructs each named source, collecting failures instead of aborting.
    pub fn discover<S: AsRef<str>>(&self, names: &[S], ctx: &SourceContext) -> Discovery {
        let mut discovery = Discovery::default();
        for name in names {
            let name = name.as_ref();
            match self.construct(name, ctx) {
                Ok(handle) => {
                    info!("Loaded source {} ({})", handle.name(), handle.capabilities());
                    discovery.sources.push(handle);
                }
                Err(e) => {
                    warn!("Failed to load source {}: {}", name, e);
                    discovery.failed.push((name.to_string(), e));
                }
            }
        }
        discovery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booru::source::Capabilities;

    fn context() -> SourceContext {
        SourceContext::new(Client::new(), Sources::default())
    }

    #[test]
    fn test_builtin_discovery() {
        let discovery = SourceRegistry::builtin().discover(&BUILTIN_SOURCES, &context());
        assert!(discovery.failed.is_empty());
        assert_eq!(discovery.sources.len(), 5);

        let safebooru = discovery.find("Safebooru").unwrap();
        assert_eq!(safebooru.capabilities(), Capabilities::SEARCH_POSTS);
        let danbooru = discovery.find("danbooru").unwrap();
        assert_eq!(danbooru.capabilities().bits(), 15);
    }

    #[test]
    fn test_unknown_and_failing_sources_are_recorded() {
        let mut ctx = context();
        ctx.sources.danbooru_url = "not a url".to_string();

        let mut registry = SourceRegistry::builtin();
        registry.register("broken", |_| Err(SourceError::InvalidUrl("broken".to_string())));

        let discovery = registry.discover(&["danbooru", "nowhere", "broken", "rule34"], &ctx);
        assert_eq!(discovery.sources.len(), 1);
        assert_eq!(discovery.sources[0].name(), "Rule34");

        let failed: Vec<&str> = discovery.failed.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(failed, vec!["danbooru", "nowhere", "broken"]);
        assert!(matches!(discovery.failed[0].1, SourceError::InvalidUrl(_)));
        assert!(matches!(discovery.failed[1].1, SourceError::UnknownSource(_)));
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let registry = SourceRegistry::builtin();
        assert!(registry.construct("E621", &context()).is_ok());
        assert_eq!(registry.names().count(), BUILTIN_SOURCES.len());
    }
}
