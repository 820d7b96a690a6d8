use crate::clock::Clock;
use crate::dedup::{self, DIFF_SNAPSHOT};
use crate::filters::FilterRegistry;
use crate::materializer::{materialize, Scorer};
use crate::pipeline::FilterChain;
use crate::policy::SchedulePolicy;
use crate::source_manager::{CycleCommit, CycleFailure, SourceManager};
use crate::sources::AdapterRegistry;
use crate::traits::FilterContext;
use crate::types::{
    CycleOutcome, CycleReport, Entry, FetchError, FetchOutcome, MonitorConfig, MonitorError, Result, Source,
    StateStatus,
};
use crate::utils::format_duration;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Drives sources through fetch, filters, dedup and commit.
///
/// Cheap to clone; clones share the store, registries and clock.
#[derive(Clone)]
pub struct Scheduler {
    manager: SourceManager,
    filters: Arc<FilterRegistry>,
    adapters: Arc<AdapterRegistry>,
    policy: Arc<SchedulePolicy>,
    clock: Arc<dyn Clock>,
    config: Arc<MonitorConfig>,
}

impl Scheduler {
    pub fn new(
        manager: SourceManager,
        filters: FilterRegistry,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Result<Self> {
        let policy = SchedulePolicy::from_config(&config)?;
        let filters = Arc::new(filters);
        Ok(Self {
            manager: manager.with_filters(filters.clone()),
            filters,
            adapters: Arc::new(adapters),
            policy: Arc::new(policy),
            clock,
            config: Arc::new(config),
        })
    }

    pub fn manager(&self) -> &SourceManager {
        &self.manager
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// Run one full cycle for a source, unless another worker holds its lease.
    ///
    /// Cycle failures are recorded in the source state and reported, not
    /// returned; only an unknown source or a store that cannot take the lease
    /// yields `Err`.
    pub async fn process(&self, source_id: Uuid) -> Result<CycleReport> {
        let owner = Uuid::new_v4();
        let now = self.clock.now();

        if !self
            .manager
            .try_acquire_lease(source_id, owner, now, self.config.lease_ttl)
            .await?
        {
            // Distinguishes a missing source from a busy one
            self.manager.get_state(source_id).await?;
            debug!("Source {} is leased by another worker, skipping", source_id);
            return Ok(CycleReport {
                source_id,
                outcome: CycleOutcome::Busy,
                next_update: None,
            });
        }

        let result = match self.run_cycle(source_id, owner).await {
            Ok(commit) => {
                let next_update = commit.next_update;
                let status = commit.status;
                self.manager
                    .commit_cycle(commit)
                    .await
                    .map(|new_entries| (status, new_entries, next_update))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((StateStatus::NotModified, _, next_update)) => {
                info!("Source {} not modified; next update {}", source_id, next_update);
                Ok(CycleReport {
                    source_id,
                    outcome: CycleOutcome::NotModified,
                    next_update: Some(next_update),
                })
            }
            Ok((_, new_entries, next_update)) => {
                info!(
                    "Source {} updated with {} new entries; next update {}",
                    source_id, new_entries, next_update
                );
                Ok(CycleReport {
                    source_id,
                    outcome: CycleOutcome::Updated { new_entries },
                    next_update: Some(next_update),
                })
            }
            Err(e) => Ok(self.fail(source_id, owner, e).await),
        }
    }

    async fn fail(&self, source_id: Uuid, owner: Uuid, e: MonitorError) -> CycleReport {
        let category = e.category();
        let message = e.to_string();

        if let MonitorError::LeaseLost { .. } = e {
            // The new holder owns the state now
            return CycleReport {
                source_id,
                outcome: CycleOutcome::Failed { category, message },
                next_update: None,
            };
        }

        let failure = CycleFailure {
            source_id,
            lease_owner: owner,
            now: self.clock.now(),
            category,
            message: message.clone(),
        };

        let next_update = match self
            .manager
            .record_failure(&failure, &self.policy, self.config.disable_after_config_errors)
            .await
        {
            Ok(state) => Some(state.next_update),
            Err(record_error) => {
                error!("Cannot record failure of source {}: {}", source_id, record_error);
                if let Err(release_error) = self.manager.release_lease(source_id, owner).await {
                    error!("Cannot release lease on source {}: {}", source_id, release_error);
                }
                None
            }
        };

        CycleReport {
            source_id,
            outcome: CycleOutcome::Failed { category, message },
            next_update,
        }
    }

    async fn run_cycle(&self, source_id: Uuid, owner: Uuid) -> Result<CycleCommit> {
        let source = self.manager.get_source(source_id).await?;
        let group = match source.group_id {
            Some(group_id) => self.manager.get_group(group_id).await?,
            None => None,
        };
        let interval = self.policy.effective_interval(&source, group.as_ref())?;
        let chain = FilterChain::build(&self.filters, &source.filters)?;
        let adapter = self.adapters.get(source.kind())?;
        let state = self.manager.get_state(source_id).await?;

        debug!("Fetching {} source {} ({})", source.kind(), source.name, source.id);
        let timeout = self.config.fetch_timeout;
        let fetched = tokio::time::timeout(timeout, adapter.fetch(&source.settings, &state.props))
            .await
            .map_err(|_| FetchError::timeout(timeout.as_secs()))??;

        let (items, hints) = match fetched {
            FetchOutcome::NotModified => {
                let now = self.clock.now();
                let next_update = self.next_on_success(now, interval);
                return Ok(CycleCommit::not_modified(source_id, owner, now, next_update));
            }
            FetchOutcome::Content { items, hints } => (items, hints),
        };

        let mut prior = self.manager.filter_states(source_id).await?;
        let snapshot = prior.remove(DIFF_SNAPSHOT);
        let ctx = FilterContext {
            source_id,
            history: &self.manager,
        };
        let fetched_count = items.len();
        let output = chain.run(items, &prior, &ctx).await?;
        debug!(
            "Source {}: {} fetched items became {} after {} filters",
            source_id,
            fetched_count,
            output.items.len(),
            chain.len()
        );

        let classification = dedup::classify(source.diff_mode, source_id, output.items, snapshot, &self.manager).await?;

        // Schedule from the end of the cycle, not the lease
        let now = self.clock.now();
        let next_update = self.next_on_success(now, interval);
        let entries = self.score_and_build(&source, classification.emitted, now).await?;

        let mut filter_states = output.states;
        if let Some(snapshot) = classification.snapshot {
            filter_states.insert(DIFF_SNAPSHOT.to_string(), snapshot);
        }

        debug!(
            "Source {} interval {}, next update {}",
            source_id,
            format_duration(interval),
            next_update
        );

        Ok(CycleCommit {
            source_id,
            lease_owner: owner,
            now,
            next_update,
            status: StateStatus::Ok,
            props: Some(hints),
            entries,
            filter_states,
            seen_oids: classification.current_oids,
        })
    }

    fn next_on_success(&self, now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
        let mut rng = rand::thread_rng();
        self.policy.next_on_success(now, interval, &mut rng)
    }

    async fn score_and_build(
        &self,
        source: &Source,
        emitted: Vec<dedup::Fingerprinted>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entry>> {
        if emitted.is_empty() {
            return Ok(Vec::new());
        }
        let rules = self.manager.active_scoring_rules(source.user_id).await?;
        let scorer = Scorer::new(&rules, self.config.auto_read_threshold);
        Ok(materialize(source, emitted, &scorer, now))
    }

    /// Process every due source once, at most `workers` at a time.
    pub async fn run_once(&self) -> Result<Vec<CycleReport>> {
        let now = self.clock.now();
        let due = self.manager.select_due(now, self.config.due_batch_limit).await?;
        if due.is_empty() {
            debug!("No sources due at {}", now);
            return Ok(Vec::new());
        }

        info!("Processing {} due sources with {} workers", due.len(), self.config.workers);

        let results = stream::iter(due)
            .map(|source_id| {
                let scheduler = self.clone();
                async move {
                    let handle = tokio::spawn(async move { scheduler.process(source_id).await });
                    (source_id, handle.await)
                }
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut reports = Vec::with_capacity(results.len());
        for (source_id, result) in results {
            match result {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => error!("Cycle for source {} could not start: {}", source_id, e),
                Err(e) => error!("Worker for source {} panicked: {}", source_id, e),
            }
        }

        let failed = reports
            .iter()
            .filter(|r| matches!(r.outcome, CycleOutcome::Failed { .. }))
            .count();
        info!("Finished {} cycles ({} failed)", reports.len(), failed);
        Ok(reports)
    }

    /// Poll for due sources until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Scheduler started: {} workers, polling every {}",
            self.config.workers,
            format_duration(self.config.poll_period)
        );

        let mut tick: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.run_once().await {
                error!("Scheduling pass failed: {}", e);
            }

            tick = tick.wrapping_add(1);
            if self.config.maintenance_every > 0 && tick % self.config.maintenance_every == 0 {
                if let Err(e) = self.maintenance().await {
                    error!("Maintenance failed: {}", e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Retention pass over history fingerprints and read entries.
    pub async fn maintenance(&self) -> Result<()> {
        let now = self.clock.now();
        let keep_history = Duration::from_secs(u64::from(self.config.keep_history_days) * 86_400);
        let pruned = self
            .manager
            .prune_history(now, keep_history, self.config.max_history_per_source)
            .await?;

        let deleted = match self.config.keep_entries_days {
            Some(days) => {
                let cutoff = now - chrono::Duration::days(i64::from(days));
                self.manager.delete_old_entries(cutoff).await?
            }
            None => 0,
        };

        if pruned + deleted > 0 {
            info!("Maintenance removed {} fingerprints and {} entries", pruned, deleted);
        } else {
            debug!("Maintenance found nothing to remove");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.config.workers)
            .field("filters", &self.filters.names())
            .finish()
    }
}
