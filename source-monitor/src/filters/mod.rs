//! Filter registry and the bundled transforms.
//!
//! A source's filter chain names transforms by string; the registry turns
//! each [`FilterSpec`] into a ready [`Transform`], validating its parameters
//! on the way. Names are persisted in source configurations, so renaming a
//! registered filter breaks existing sources.

pub mod command;
pub mod delimited;
pub mod history;
pub mod markup;
pub mod score;
pub mod text;

use crate::traits::{FilterContext, Transform, TransformOutput};
use crate::types::{FilterSpec, Item, MonitorError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub type Params = serde_json::Map<String, serde_json::Value>;

/// Failure raised by a single filter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    /// Parameters are missing or out of range; the user must fix the source.
    #[error("invalid parameters: {0}")]
    Invalid(String),
    #[error("{0}")]
    Failed(String),
}

impl FilterError {
    pub fn into_monitor(self, filter: &str) -> MonitorError {
        match self {
            FilterError::Invalid(reason) => {
                MonitorError::Configuration(format!("filter {}: {}", filter, reason))
            }
            FilterError::Failed(message) => MonitorError::Transform {
                filter: filter.to_string(),
                message,
            },
        }
    }
}

/// Deserialize a filter's parameter map into its typed settings.
pub fn parse_params<P: DeserializeOwned>(params: &Params) -> std::result::Result<P, FilterError> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| FilterError::Invalid(e.to_string()))
}

/// Synchronous filter working item by item.
///
/// Filters that look at the whole sequence (sort, join) override `filter`.
pub trait ItemFilter: Send + Sync + 'static {
    const NAME: &'static str;

    fn filter_item(&self, item: Item) -> std::result::Result<Vec<Item>, FilterError> {
        Ok(vec![item])
    }

    fn filter(&self, items: Vec<Item>) -> std::result::Result<Vec<Item>, FilterError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.extend(self.filter_item(item)?);
        }
        Ok(out)
    }
}

/// Lifts an [`ItemFilter`] onto the [`Transform`] seam.
pub struct Simple<F>(pub F);

#[async_trait]
impl<F: ItemFilter> Transform for Simple<F> {
    fn name(&self) -> &str {
        F::NAME
    }

    async fn apply(
        &self,
        items: Vec<Item>,
        _state: Option<serde_json::Value>,
        _ctx: &FilterContext<'_>,
    ) -> Result<TransformOutput> {
        self.0
            .filter(items)
            .map(TransformOutput::items)
            .map_err(|e| e.into_monitor(F::NAME))
    }
}

pub type FilterFactory = fn(&Params) -> std::result::Result<Arc<dyn Transform>, FilterError>;

pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding every bundled filter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(text::Html2Text::NAME, text::Html2Text::build);
        registry.register(text::Strip::NAME, text::Strip::build);
        registry.register(text::Compact::NAME, text::Compact::build);
        registry.register(text::Head::NAME, text::Head::build);
        registry.register(text::Sort::NAME, text::Sort::build);
        registry.register(text::Grep::NAME, text::Grep::build);
        registry.register(text::Wrap::NAME, text::Wrap::build);
        registry.register(text::Split::NAME, text::Split::build);
        registry.register(text::Join::NAME, text::Join::build);
        registry.register(markup::ByCss::NAME, markup::ByCss::build);
        registry.register(markup::ByXpath::NAME, markup::ByXpath::build);
        registry.register(markup::ById::NAME, markup::ById::build);
        registry.register(markup::ByRegex::NAME, markup::ByRegex::build);
        registry.register(markup::FixUrls::NAME, markup::FixUrls::build);
        registry.register(score::Score::NAME, score::Score::build);
        registry.register(delimited::SplitCsv::NAME, delimited::SplitCsv::build);
        registry.register(command::CommandFilter::NAME, command::CommandFilter::build);
        registry.register(history::RemoveVisited::NAME, history::RemoveVisited::build);
        registry.register(history::NDiff::NAME, history::NDiff::build);
        registry
    }

    pub fn register(&mut self, name: &str, factory: FilterFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            debug!("Replaced filter registration for {}", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate one step; unknown names and bad parameters are configuration errors.
    pub fn build(&self, spec: &FilterSpec) -> Result<Arc<dyn Transform>> {
        let factory = self.factories.get(&spec.name).ok_or_else(|| {
            MonitorError::Configuration(format!("unknown filter: {}", spec.name))
        })?;
        factory(&spec.params).map_err(|e| match e {
            FilterError::Failed(reason) => FilterError::Invalid(reason).into_monitor(&spec.name),
            invalid => invalid.into_monitor(&spec.name),
        })
    }

    /// Check a whole chain without keeping the instances, for edit-time validation.
    pub fn validate_chain(&self, specs: &[FilterSpec]) -> Result<()> {
        for spec in specs {
            self.build(spec)?;
        }
        Ok(())
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Shorthand used by filter factories.
pub(crate) fn boxed<T: Transform + 'static>(transform: T) -> std::result::Result<Arc<dyn Transform>, FilterError> {
    Ok(Arc::new(transform))
}
