use crate::fetcher::{Fetcher, HttpFetch};
use crate::types::{FetchAdapter, FetchError, FetchErrorKind, FetchOutcome, Item, Props, SourceKind, SourceSettings};
use async_trait::async_trait;
use feed_rs::parser;
use std::sync::Arc;
use tracing::{debug, info};

/// RSS/Atom feed; one item per feed entry.
pub struct RssFeedSource {
    fetcher: Arc<Fetcher>,
}

impl RssFeedSource {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

/// Parse a feed document into items, newest-first as the feed lists them.
pub fn parse_feed(content: &str, max_items: Option<usize>) -> Result<Vec<Item>, FetchError> {
    debug!("Parsing feed content ({} bytes)", content.len());

    let feed = parser::parse(content.as_bytes())
        .map_err(|e| FetchError::permanent(FetchErrorKind::Parse, format!("failed to parse feed: {}", e)))?;

    let limit = max_items.unwrap_or(usize::MAX);
    let items: Vec<Item> = feed
        .entries
        .into_iter()
        .take(limit)
        .map(|entry| {
            let body = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_default();

            let mut item = Item::new(body);
            item.title = entry.title.map(|t| t.content);
            item.url = entry.links.first().map(|l| l.href.clone());
            if let Some(published) = entry.published.or(entry.updated) {
                item.set_opt("published", published.to_rfc3339());
            }
            if let Some(author) = entry.authors.first() {
                item.set_opt("author", author.name.clone());
            }
            if !entry.id.is_empty() {
                item.set_opt("guid", entry.id);
            }
            item.set_opt("content-type", "html");
            item
        })
        .collect();

    info!("Parsed feed with {} entries", items.len());
    Ok(items)
}

#[async_trait]
impl FetchAdapter for RssFeedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }

    async fn fetch(&self, settings: &SourceSettings, hints: &Props) -> Result<FetchOutcome, FetchError> {
        let SourceSettings::Rss(settings) = settings else {
            return Err(FetchError::permanent(
                FetchErrorKind::Other,
                format!("rss adapter got {} settings", settings.kind()),
            ));
        };

        match self.fetcher.fetch(&settings.url, hints, None).await? {
            HttpFetch::NotModified => Ok(FetchOutcome::NotModified),
            HttpFetch::Body { body, hints } => Ok(FetchOutcome::Content {
                items: parse_feed(&body, settings.max_items)?,
                hints,
            }),
        }
    }
}
