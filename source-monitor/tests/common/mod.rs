#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use interfaces::{CommandSettings, WebSettings};
use source_monitor::{
    AdapterRegistry, Clock, FetchAdapter, FetchError, FetchOutcome, FilterRegistry, ManualClock, MonitorConfig, NewSource,
    Props, Result, Scheduler, Source, SourceKind, SourceManager, SourceSettings,
};
use source_monitor::sources::CommandSource;
use source_monitor::traits::Transform;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Web adapter that replays queued responses and counts its calls.
#[derive(Default)]
pub struct ScriptedAdapter {
    responses: Mutex<VecDeque<std::result::Result<FetchOutcome, FetchError>>>,
    hints_seen: Mutex<Vec<Props>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    fetch_takes: Mutex<Option<(ManualClock, chrono::Duration)>>,
}

impl ScriptedAdapter {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Move `clock` forward by `by` inside every fetch.
    pub fn advance_clock_on_fetch(&self, clock: &ManualClock, by: chrono::Duration) {
        *self.fetch_takes.lock().unwrap() = Some((clock.clone(), by));
    }

    pub fn push(&self, response: std::result::Result<FetchOutcome, FetchError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_content(&self, content: &str) {
        self.push(Ok(FetchOutcome::single(content, Props::new())));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn hints_seen(&self) -> Vec<Props> {
        self.hints_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchAdapter for ScriptedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Web
    }

    async fn fetch(&self, _settings: &SourceSettings, hints: &Props) -> std::result::Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hints_seen.lock().unwrap().push(hints.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((clock, by)) = self.fetch_takes.lock().unwrap().as_ref() {
            clock.advance(*by);
        }
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(FetchOutcome::single("", Props::new())))
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub manager: SourceManager,
    pub clock: ManualClock,
    pub adapter: Arc<ScriptedAdapter>,
    pub user_id: Uuid,
}

impl Harness {
    pub async fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_adapter(config, ScriptedAdapter::default()).await
    }

    pub async fn with_adapter(config: MonitorConfig, adapter: ScriptedAdapter) -> Result<Self> {
        init_tracing();
        let manager = SourceManager::in_memory().await?;
        let clock = ManualClock::new(start_time());
        let adapter = Arc::new(adapter);

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(CommandSource::new()));
        adapters.register(adapter.clone());

        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let scheduler = Scheduler::new(manager, FilterRegistry::with_defaults(), adapters, shared_clock, config)?;

        Ok(Self {
            manager: scheduler.manager().clone(),
            scheduler,
            clock,
            adapter,
            user_id: Uuid::new_v4(),
        })
    }

    pub async fn add(&self, new: NewSource) -> Result<Source> {
        self.manager.create_source(new, self.clock.now()).await
    }

    pub fn command_source(&self, name: &str, command: &str) -> NewSource {
        NewSource::new(
            self.user_id,
            name,
            SourceSettings::Command(CommandSettings {
                command: command.to_string(),
                timeout_seconds: 10,
            }),
        )
    }

    pub fn web_source(&self, name: &str) -> NewSource {
        NewSource::new(
            self.user_id,
            name,
            SourceSettings::Web(WebSettings {
                url: "https://example.com/page".to_string(),
                timeout_seconds: None,
            }),
        )
    }
}

/// History backed by a fixed set of fingerprints.
#[derive(Default)]
pub struct MemoryHistory {
    pub oids: std::collections::HashSet<String>,
}

impl MemoryHistory {
    pub fn with(oids: &[String]) -> Self {
        Self {
            oids: oids.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl source_monitor::traits::HistoryLookup for MemoryHistory {
    async fn seen(&self, _source_id: Uuid, oid: &str) -> Result<bool> {
        Ok(self.oids.contains(oid))
    }
}

/// Build `spec` from the default registry and run it once without state.
pub async fn run_filter(
    spec: source_monitor::FilterSpec,
    items: Vec<source_monitor::Item>,
) -> Result<Vec<source_monitor::Item>> {
    let history = MemoryHistory::default();
    let ctx = source_monitor::traits::FilterContext {
        source_id: Uuid::nil(),
        history: &history,
    };
    let transform = FilterRegistry::with_defaults().build(&spec)?;
    Ok(transform.apply(items, None, &ctx).await?.items)
}

pub fn contents(items: &[source_monitor::Item]) -> Vec<&str> {
    items.iter().map(|item| item.content.as_str()).collect()
}
