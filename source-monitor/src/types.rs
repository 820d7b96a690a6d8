use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;
// Collaborator contracts shared with adapters live in the interfaces crate
pub use interfaces::defs::{FetchAdapter, FetchError, FetchErrorKind, FetchOutcome, Item, Props, SourceKind, SourceSettings};

/// Activation status of a source as set by the UI (or by the disable policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    NotActivated,
    Active,
    Disabled,
}

/// Outcome of the most recent cycle recorded in the source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStatus {
    New,
    Ok,
    NotModified,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    New,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMark {
    Unread,
    /// Marked read automatically at creation (low score).
    Read,
    /// Marked read by the user.
    ManualRead,
}

/// Which classified items become entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    #[default]
    Added,
    Deleted,
    Modified,
    #[serde(alias = "current")]
    Last,
}

/// How a filter step sees its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemMode {
    #[default]
    Whole,
    Line,
}

/// Coarse error class persisted with the source state for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Fetch,
    Transform,
    Configuration,
    Persistence,
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = MonitorError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(MonitorError::General(format!(
                        "invalid {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(SourceStatus {
    NotActivated => "not_activated",
    Active => "active",
    Disabled => "disabled",
});

string_enum!(StateStatus {
    New => "new",
    Ok => "ok",
    NotModified => "not_modified",
    Error => "error",
});

string_enum!(EntryStatus {
    New => "new",
    Updated => "updated",
});

string_enum!(DiffMode {
    Added => "added",
    Deleted => "deleted",
    Modified => "modified",
    Last => "last",
});

string_enum!(ErrorCategory {
    Fetch => "fetch",
    Transform => "transform",
    Configuration => "configuration",
    Persistence => "persistence",
});

impl ReadMark {
    pub fn as_i64(&self) -> i64 {
        match self {
            ReadMark::Unread => 0,
            ReadMark::Read => 1,
            ReadMark::ManualRead => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => ReadMark::Read,
            2 => ReadMark::ManualRead,
            _ => ReadMark::Unread,
        }
    }

    pub fn is_read(&self) -> bool {
        !matches!(self, ReadMark::Unread)
    }
}

/// One step of a source's filter chain, e.g. `{"name": "split", "separator": ";"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub mode: ItemMode,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl FilterSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: ItemMode::Whole,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn in_line_mode(mut self) -> Self {
        self.mode = ItemMode::Line;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub user_id: Uuid,
    pub group_id: Option<Uuid>,
    pub name: String,
    pub settings: SourceSettings,
    pub filters: Vec<FilterSpec>,
    pub interval: Option<String>,
    pub diff_mode: DiffMode,
    pub default_score: i64,
    pub status: SourceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        self.settings.kind()
    }
}

/// Source definition as submitted by the UI.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub user_id: Uuid,
    pub group_id: Option<Uuid>,
    pub name: String,
    pub settings: SourceSettings,
    pub filters: Vec<FilterSpec>,
    pub interval: Option<String>,
    pub diff_mode: DiffMode,
    pub default_score: i64,
    pub status: SourceStatus,
}

impl NewSource {
    pub fn new(user_id: Uuid, name: &str, settings: SourceSettings) -> Self {
        Self {
            user_id,
            group_id: None,
            name: name.to_string(),
            settings,
            filters: Vec::new(),
            interval: None,
            diff_mode: DiffMode::Added,
            default_score: 0,
            status: SourceStatus::Active,
        }
    }

    pub fn with_filters(mut self, filters: Vec<FilterSpec>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_interval(mut self, interval: &str) -> Self {
        self.interval = Some(interval.to_string());
        self
    }

    pub fn with_group(mut self, group_id: Uuid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_diff_mode(mut self, diff_mode: DiffMode) -> Self {
        self.diff_mode = diff_mode;
        self
    }

    pub fn with_default_score(mut self, score: i64) -> Self {
        self.default_score = score;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceGroup {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceState {
    pub source_id: Uuid,
    pub next_update: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    pub error_counter: u32,
    pub success_counter: u32,
    pub status: StateStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorCategory>,
    pub config_error_streak: u32,
    pub props: Props,
    pub lease_owner: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub source_id: Uuid,
    pub user_id: Uuid,
    pub oid: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content: String,
    pub opts: BTreeMap<String, serde_json::Value>,
    pub status: EntryStatus,
    pub read_mark: ReadMark,
    pub star_mark: bool,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pattern: String,
    pub active: bool,
    pub score_change: i64,
}

impl ScoringRule {
    pub fn new(user_id: Uuid, pattern: &str, score_change: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            pattern: pattern.to_string(),
            active: true,
            score_change,
        }
    }
}

/// Result of one `process` call, as reported to the caller and logs.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Updated { new_entries: usize },
    NotModified,
    Failed { category: ErrorCategory, message: String },
    /// Another worker holds the lease.
    Busy,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub source_id: Uuid,
    pub outcome: CycleOutcome,
    pub next_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub workers: usize,
    pub lease_ttl: Duration,
    pub fetch_timeout: Duration,
    pub due_batch_limit: usize,
    pub default_interval: String,
    pub jitter_window: Duration,
    pub error_backoff_initial: Duration,
    pub error_backoff_max: Duration,
    pub auto_read_threshold: Option<i64>,
    pub disable_after_config_errors: Option<u32>,
    pub poll_period: Duration,
    pub maintenance_every: u32,
    pub keep_entries_days: Option<u32>,
    pub keep_history_days: u32,
    pub max_history_per_source: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            lease_ttl: Duration::from_secs(15 * 60),
            fetch_timeout: Duration::from_secs(60),
            due_batch_limit: 100,
            default_interval: "1d".to_string(),
            jitter_window: Duration::from_secs(2 * 3600),
            error_backoff_initial: Duration::from_secs(10 * 60),
            error_backoff_max: Duration::from_secs(24 * 3600),
            auto_read_threshold: None,
            disable_after_config_errors: None,
            poll_period: Duration::from_secs(60),
            maintenance_every: 60,
            keep_entries_days: Some(90),
            keep_history_days: 180,
            max_history_per_source: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub max_body_size_mb: usize,
    pub max_redirects: usize,
    pub min_host_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Source-Monitor/1.0".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 5,
            max_body_size_mb: 10,
            max_redirects: 5,
            min_host_interval_ms: 1000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Filter {filter} failed: {message}")]
    Transform { filter: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source not found: {id}")]
    SourceNotFound { id: Uuid },

    #[error("Lease on source {id} lost before commit")]
    LeaseLost { id: Uuid },

    #[error("General error: {0}")]
    General(String),
}

impl MonitorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MonitorError::Fetch(_) | MonitorError::Io(_) | MonitorError::General(_) => ErrorCategory::Fetch,
            MonitorError::Transform { .. } => ErrorCategory::Transform,
            MonitorError::Configuration(_) | MonitorError::SourceNotFound { .. } => ErrorCategory::Configuration,
            MonitorError::Database(_)
            | MonitorError::Migration(_)
            | MonitorError::Serialization(_)
            | MonitorError::LeaseLost { .. } => ErrorCategory::Persistence,
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
