use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Adapter hints persisted between cycles (etag, last-modified, markers).
pub type Props = BTreeMap<String, String>;

/// One unit of content flowing from a fetch adapter through the filter chain.
///
/// Fields an adapter does not know stay empty; nothing downstream infers them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub opts: BTreeMap<String, serde_json::Value>,
}

impl Item {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Copy of this item carrying different content.
    pub fn derive(&self, content: impl Into<String>) -> Self {
        Self {
            title: self.title.clone(),
            url: self.url.clone(),
            content: content.into(),
            opts: self.opts.clone(),
        }
    }

    pub fn set_opt(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.opts.insert(key.to_string(), value.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Command,
    Web,
    Rss,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Command => "command",
            SourceKind::Web => "web",
            SourceKind::Rss => "rss",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSettings {
    pub command: String,
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: u64,
}

fn default_command_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSettings {
    pub url: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RssSettings {
    pub url: String,
    #[serde(default)]
    pub max_items: Option<usize>,
}

/// Per-kind source configuration. The tag selects the fetch adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "settings", rename_all = "snake_case")]
pub enum SourceSettings {
    Command(CommandSettings),
    Web(WebSettings),
    Rss(RssSettings),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct SettingsError {
    pub field: &'static str,
    pub reason: String,
}

impl SourceSettings {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSettings::Command(_) => SourceKind::Command,
            SourceSettings::Web(_) => SourceKind::Web,
            SourceSettings::Rss(_) => SourceKind::Rss,
        }
    }

    /// Edit-time validation; the UI calls this before saving a source.
    pub fn validate(&self) -> Result<(), SettingsError> {
        match self {
            SourceSettings::Command(settings) => {
                if settings.command.trim().is_empty() {
                    return Err(SettingsError {
                        field: "command",
                        reason: "command is empty".to_string(),
                    });
                }
                if settings.timeout_seconds == 0 {
                    return Err(SettingsError {
                        field: "timeout_seconds",
                        reason: "must be at least 1".to_string(),
                    });
                }
                Ok(())
            }
            SourceSettings::Web(settings) => {
                validate_http_url(&settings.url)?;
                if settings.timeout_seconds == Some(0) {
                    return Err(SettingsError {
                        field: "timeout_seconds",
                        reason: "must be at least 1".to_string(),
                    });
                }
                Ok(())
            }
            SourceSettings::Rss(settings) => {
                validate_http_url(&settings.url)?;
                if settings.max_items == Some(0) {
                    return Err(SettingsError {
                        field: "max_items",
                        reason: "must be at least 1".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

fn validate_http_url(url: &str) -> Result<(), SettingsError> {
    let url = url.trim();
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| SettingsError {
            field: "url",
            reason: format!("{} is not an http(s) url", url),
        })?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(SettingsError {
            field: "url",
            reason: format!("{} has no host", url),
        });
    }
    Ok(())
}

/// Successful result of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Fresh content plus the hints to store for the next cycle.
    Content { items: Vec<Item>, hints: Props },
    /// Nothing changed since the hints were recorded.
    NotModified,
}

impl FetchOutcome {
    /// Single-payload content, the common case for pages and commands.
    pub fn single(content: impl Into<String>, hints: Props) -> Self {
        FetchOutcome::Content {
            items: vec![Item::new(content)],
            hints,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Network,
    Timeout,
    Status,
    Authorization,
    Subprocess,
    Parse,
    Other,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?} error: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl FetchError {
    pub fn retryable(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::retryable(
            FetchErrorKind::Timeout,
            format!("no response within {}s", seconds),
        )
    }
}

/// Retrieves raw content for one kind of source.
///
/// `hints` is whatever the previous successful cycle stored in the source
/// state props; adapters use it to skip unchanged content.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, settings: &SourceSettings, hints: &Props) -> Result<FetchOutcome, FetchError>;
}
