use crate::fetcher::{Fetcher, HttpFetch};
use crate::types::{FetchAdapter, FetchError, FetchErrorKind, FetchOutcome, Item, Props, SourceKind, SourceSettings};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A single page; the body is one item carrying the page url.
pub struct WebSource {
    fetcher: Arc<Fetcher>,
}

impl WebSource {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl FetchAdapter for WebSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Web
    }

    async fn fetch(&self, settings: &SourceSettings, hints: &Props) -> Result<FetchOutcome, FetchError> {
        let SourceSettings::Web(settings) = settings else {
            return Err(FetchError::permanent(
                FetchErrorKind::Other,
                format!("web adapter got {} settings", settings.kind()),
            ));
        };

        let timeout = settings.timeout_seconds.map(Duration::from_secs);
        match self.fetcher.fetch(&settings.url, hints, timeout).await? {
            HttpFetch::NotModified => Ok(FetchOutcome::NotModified),
            HttpFetch::Body { body, hints } => Ok(FetchOutcome::Content {
                items: vec![Item::new(body).with_url(settings.url.clone())],
                hints,
            }),
        }
    }
}
