//! Bundled fetch adapters and the registry that picks one per source kind.

pub mod command;
pub mod rss_feed;
pub mod web;

pub use command::CommandSource;
pub use rss_feed::RssFeedSource;
pub use web::WebSource;

use crate::fetcher::Fetcher;
use crate::types::{FetchAdapter, FetchConfig, MonitorError, Result, SourceKind};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceKind, Arc<dyn FetchAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command, web and rss adapters sharing one HTTP fetcher.
    pub fn with_defaults(fetch_config: FetchConfig) -> Result<Self> {
        let fetcher = Arc::new(Fetcher::new(fetch_config)?);
        let mut registry = Self::new();
        registry.register(Arc::new(CommandSource::new()));
        registry.register(Arc::new(WebSource::new(fetcher.clone())));
        registry.register(Arc::new(RssFeedSource::new(fetcher)));
        Ok(registry)
    }

    /// Register an adapter under the kind it reports, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn FetchAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: SourceKind) -> Result<Arc<dyn FetchAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| MonitorError::Configuration(format!("no fetch adapter for {} sources", kind)))
    }
}
