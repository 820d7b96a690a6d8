use crate::types::{Item, MonitorError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Read access to the identities a source has already produced.
#[async_trait]
pub trait HistoryLookup: Send + Sync {
    async fn seen(&self, source_id: Uuid, oid: &str) -> Result<bool>;
}

/// What a transform gets to see besides its items.
pub struct FilterContext<'a> {
    pub source_id: Uuid,
    pub history: &'a dyn HistoryLookup,
}

/// Items plus the state a stateful filter wants persisted for next cycle.
#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub items: Vec<Item>,
    pub state: Option<serde_json::Value>,
}

impl TransformOutput {
    pub fn items(items: Vec<Item>) -> Self {
        Self { items, state: None }
    }
}

/// One configured step of a filter chain.
///
/// `state` is whatever this step returned on the last successful cycle, or
/// `None` on first run. Stateless steps ignore it and return no state.
#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(
        &self,
        items: Vec<Item>,
        state: Option<serde_json::Value>,
        ctx: &FilterContext<'_>,
    ) -> Result<TransformOutput>;
}

/// Filter that carries a typed state blob between cycles.
#[async_trait]
pub trait StatefulTransform: Send + Sync {
    type State: Serialize + DeserializeOwned + Default + Send;

    fn name(&self) -> &str;

    async fn apply_with_state(
        &self,
        items: Vec<Item>,
        state: &mut Self::State,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Item>>;
}

/// Adapts a [`StatefulTransform`] to the untyped [`Transform`] seam.
pub struct Stateful<T> {
    inner: T,
}

impl<T: StatefulTransform> Stateful<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T> Transform for Stateful<T>
where
    T: StatefulTransform,
    T::State: 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn apply(
        &self,
        items: Vec<Item>,
        state: Option<serde_json::Value>,
        ctx: &FilterContext<'_>,
    ) -> Result<TransformOutput> {
        let mut typed: T::State = match state {
            Some(value) => serde_json::from_value(value).map_err(|e| MonitorError::Transform {
                filter: self.inner.name().to_string(),
                message: format!("stored state is unreadable: {}", e),
            })?,
            None => T::State::default(),
        };
        let items = self.inner.apply_with_state(items, &mut typed, ctx).await?;
        Ok(TransformOutput {
            items,
            state: Some(serde_json::to_value(&typed)?),
        })
    }
}
