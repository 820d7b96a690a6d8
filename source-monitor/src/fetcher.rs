use crate::types::{FetchConfig, FetchError, FetchErrorKind, MonitorError, Props, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

pub const ETAG: &str = "etag";
pub const LAST_MODIFIED: &str = "last_modified";

/// Result of a conditional GET.
#[derive(Debug)]
pub enum HttpFetch {
    NotModified,
    Body { body: String, hints: Props },
}

/// HTTP client shared by the web and rss adapters.
///
/// Sends conditional requests from stored hints, retries transient failures
/// with exponential backoff and spaces out requests to the same host.
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| MonitorError::Configuration(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn fetch(&self, url: &str, hints: &Props, timeout: Option<Duration>) -> std::result::Result<HttpFetch, FetchError> {
        let start_time = Instant::now();
        let parsed = Url::parse(url)
            .map_err(|e| FetchError::permanent(FetchErrorKind::Other, format!("invalid url {}: {}", url, e)))?;

        let etag = hints.get(ETAG).map(String::as_str);
        let last_modified = hints.get(LAST_MODIFIED).map(String::as_str);

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 32),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds * 60)),
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(&parsed).await;

            let error = match self.send(url, etag, last_modified, timeout).await {
                Ok(response) => match self.read_response(url, response).await {
                    Ok(result) => {
                        debug!("Fetched {} in {}ms", url, start_time.elapsed().as_millis());
                        return Ok(result);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if !error.retryable {
                return Err(error);
            }

            if attempt < self.config.max_retries {
                if let Some(delay) = backoff.next_backoff() {
                    warn!("Attempt {} failed for {}: {}; retrying in {:?}", attempt + 1, url, error, delay);
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            last_error = Some(error);
            break;
        }

        warn!("Giving up on {} after {} attempts", url, self.config.max_retries + 1);
        Err(last_error.unwrap_or_else(|| FetchError::retryable(FetchErrorKind::Other, "no attempt was made")))
    }

    async fn send(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Response, FetchError> {
        let mut request = self.client.get(url);

        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }

        if let Some(last_modified) = last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }

        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        request.send().await.map_err(classify_transport)
    }

    async fn read_response(&self, url: &str, response: Response) -> std::result::Result<HttpFetch, FetchError> {
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!("Not modified: {}", url);
            return Ok(HttpFetch::NotModified);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::permanent(
                FetchErrorKind::Authorization,
                format!("HTTP {} from {}", status, url),
            ));
        }

        if !status.is_success() {
            let message = format!("HTTP {}: {}", status, status.canonical_reason().unwrap_or("Unknown"));
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                FetchError::retryable(FetchErrorKind::Status, message)
            } else {
                FetchError::permanent(FetchErrorKind::Status, message)
            });
        }

        let mut hints = Props::new();
        if let Some(etag) = response.headers().get("etag").and_then(|v| v.to_str().ok()) {
            hints.insert(ETAG.to_string(), etag.to_string());
        }
        if let Some(modified) = response.headers().get("last-modified").and_then(|v| v.to_str().ok()) {
            hints.insert(LAST_MODIFIED.to_string(), modified.to_string());
        }

        let max_bytes = self.config.max_body_size_mb * 1024 * 1024;
        if let Some(content_length) = response.content_length() {
            if content_length as usize > max_bytes {
                return Err(FetchError::permanent(
                    FetchErrorKind::Other,
                    format!("body too large: {}MB", content_length as usize / (1024 * 1024)),
                ));
            }
        }

        let body = response.text().await.map_err(classify_transport)?;
        if body.len() > max_bytes {
            return Err(FetchError::permanent(
                FetchErrorKind::Other,
                format!("body too large: {}MB", body.len() / (1024 * 1024)),
            ));
        }

        info!("Fetched {} ({} bytes)", url, body.len());
        Ok(HttpFetch::Body { body, hints })
    }

    async fn apply_rate_limit(&self, url: &Url) {
        let host = url.host_str().unwrap_or("").to_string();
        let min_interval = Duration::from_millis(self.config.min_host_interval_ms);

        // Held across the sleep so concurrent requests to one host queue up
        let mut rate_limiter = self.rate_limiter.lock().await;
        if let Some(last_request) = rate_limiter.get(&host) {
            let elapsed = last_request.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!("Rate limiting {}: waiting {:?}", host, wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        rate_limiter.insert(host, Instant::now());
    }
}

fn classify_transport(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::retryable(FetchErrorKind::Timeout, error.to_string())
    } else if error.is_builder() {
        FetchError::permanent(FetchErrorKind::Other, error.to_string())
    } else {
        FetchError::retryable(FetchErrorKind::Network, error.to_string())
    }
}
