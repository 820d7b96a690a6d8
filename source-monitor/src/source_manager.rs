use crate::filters::FilterRegistry;
use crate::policy::SchedulePolicy;
use crate::traits::HistoryLookup;
use crate::types::{
    DiffMode, Entry, EntryStatus, ErrorCategory, FilterSpec, MonitorError, NewSource, Props, ReadMark, Result,
    ScoringRule, Source, SourceGroup, SourceSettings, SourceState, SourceStatus, StateStatus,
};
use crate::utils::parse_interval;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_error<E>(e: E) -> MonitorError
where
    E: std::error::Error + Send + Sync + 'static,
{
    MonitorError::Database(sqlx::Error::Decode(Box::new(e)))
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(decode_error)
}

fn parse_opt_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(decode_error)
}

/// Which entries a report query covers.
#[derive(Debug, Clone, Copy)]
pub enum EntryScope {
    Source(Uuid),
    Group(Uuid),
}

/// Everything a successful cycle writes, committed as one transaction.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    pub source_id: Uuid,
    pub lease_owner: Uuid,
    pub now: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub status: StateStatus,
    /// `None` keeps the stored props (not-modified cycles).
    pub props: Option<Props>,
    pub entries: Vec<Entry>,
    pub filter_states: BTreeMap<String, serde_json::Value>,
    pub seen_oids: Vec<String>,
}

impl CycleCommit {
    pub fn not_modified(source_id: Uuid, lease_owner: Uuid, now: DateTime<Utc>, next_update: DateTime<Utc>) -> Self {
        Self {
            source_id,
            lease_owner,
            now,
            next_update,
            status: StateStatus::NotModified,
            props: None,
            entries: Vec::new(),
            filter_states: BTreeMap::new(),
            seen_oids: Vec::new(),
        }
    }
}

/// Error bookkeeping for a failed cycle.
#[derive(Debug, Clone)]
pub struct CycleFailure {
    pub source_id: Uuid,
    pub lease_owner: Uuid,
    pub now: DateTime<Utc>,
    pub category: ErrorCategory,
    pub message: String,
}

/// Persistence gateway for sources, their state, history and entries.
#[derive(Clone)]
pub struct SourceManager {
    db: SqlitePool,
    filters: Arc<FilterRegistry>,
}

impl SourceManager {
    /// Open (creating if needed) a database file and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let db = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let manager = Self {
            db,
            filters: Arc::new(FilterRegistry::with_defaults()),
        };
        manager.migrate().await?;
        Ok(manager)
    }

    /// Private in-memory database; the single connection is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let manager = Self {
            db,
            filters: Arc::new(FilterRegistry::with_defaults()),
        };
        manager.migrate().await?;
        Ok(manager)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }

    /// Registry used to check filter chains when sources are saved.
    pub fn with_filters(mut self, filters: Arc<FilterRegistry>) -> Self {
        self.filters = filters;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    pub async fn create_group(&self, user_id: Uuid, name: &str, interval: Option<&str>) -> Result<SourceGroup> {
        if let Some(interval) = interval {
            parse_interval(interval)?;
        }
        let group = SourceGroup {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            interval: interval.map(str::to_string),
        };

        sqlx::query("INSERT INTO source_groups (id, user_id, name, interval) VALUES (?, ?, ?, ?)")
            .bind(group.id.to_string())
            .bind(group.user_id.to_string())
            .bind(&group.name)
            .bind(&group.interval)
            .execute(&self.db)
            .await?;

        info!("Created source group {} ({})", group.name, group.id);
        Ok(group)
    }

    pub async fn get_group(&self, group_id: Uuid) -> Result<Option<SourceGroup>> {
        let row = sqlx::query("SELECT id, user_id, name, interval FROM source_groups WHERE id = ?")
            .bind(group_id.to_string())
            .fetch_optional(&self.db)
            .await?;

        row.map(|row| {
            Ok(SourceGroup {
                id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
                name: row.try_get("name")?,
                interval: row.try_get("interval")?,
            })
        })
        .transpose()
    }

    /// Store a new source and its initial state, due immediately.
    pub async fn create_source(&self, new: NewSource, now: DateTime<Utc>) -> Result<Source> {
        validate_definition(&new.settings, new.interval.as_deref())?;
        self.filters.validate_chain(&new.filters)?;

        let source = Source {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            group_id: new.group_id,
            name: new.name,
            settings: new.settings,
            filters: new.filters,
            interval: new.interval,
            diff_mode: new.diff_mode,
            default_score: new.default_score,
            status: new.status,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sources (id, user_id, group_id, name, kind, settings, filters, interval,
                                 diff_mode, default_score, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source.id.to_string())
        .bind(source.user_id.to_string())
        .bind(source.group_id.map(|g| g.to_string()))
        .bind(&source.name)
        .bind(source.kind().as_str())
        .bind(serde_json::to_string(&source.settings)?)
        .bind(serde_json::to_string(&source.filters)?)
        .bind(&source.interval)
        .bind(source.diff_mode.as_str())
        .bind(source.default_score)
        .bind(source.status.as_str())
        .bind(ts(&now))
        .bind(ts(&now))
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO source_state (source_id, next_update, status) VALUES (?, ?, ?)")
            .bind(source.id.to_string())
            .bind(ts(&now))
            .bind(StateStatus::New.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Created {} source {} ({})", source.kind(), source.name, source.id);
        Ok(source)
    }

    /// Replace the editable definition of a source. State and history are kept.
    pub async fn update_source(&self, source: &Source, now: DateTime<Utc>) -> Result<()> {
        validate_definition(&source.settings, source.interval.as_deref())?;
        self.filters.validate_chain(&source.filters)?;

        let result = sqlx::query(
            r#"
            UPDATE sources
            SET group_id = ?, name = ?, kind = ?, settings = ?, filters = ?, interval = ?,
                diff_mode = ?, default_score = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(source.group_id.map(|g| g.to_string()))
        .bind(&source.name)
        .bind(source.kind().as_str())
        .bind(serde_json::to_string(&source.settings)?)
        .bind(serde_json::to_string(&source.filters)?)
        .bind(&source.interval)
        .bind(source.diff_mode.as_str())
        .bind(source.default_score)
        .bind(source.status.as_str())
        .bind(ts(&now))
        .bind(source.id.to_string())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MonitorError::SourceNotFound { id: source.id });
        }
        debug!("Updated source {}", source.id);
        Ok(())
    }

    /// Activation changes from the UI. Activating makes the source due now.
    pub async fn set_source_status(&self, source_id: Uuid, status: SourceStatus, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query("UPDATE sources SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(ts(&now))
            .bind(source_id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MonitorError::SourceNotFound { id: source_id });
        }

        if status == SourceStatus::Active {
            sqlx::query("UPDATE source_state SET next_update = ?, config_error_streak = 0 WHERE source_id = ?")
                .bind(ts(&now))
                .bind(source_id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!("Source {} is now {}", source_id, status);
        Ok(())
    }

    pub async fn get_source(&self, source_id: Uuid) -> Result<Source> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(source_id.to_string())
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => row_to_source(&row),
            None => Err(MonitorError::SourceNotFound { id: source_id }),
        }
    }

    pub async fn list_sources(&self, user_id: Uuid) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources WHERE user_id = ? ORDER BY name")
            .bind(user_id.to_string())
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(row_to_source).collect()
    }

    pub async fn get_state(&self, source_id: Uuid) -> Result<SourceState> {
        let row = sqlx::query("SELECT * FROM source_state WHERE source_id = ?")
            .bind(source_id.to_string())
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => row_to_state(&row),
            None => Err(MonitorError::SourceNotFound { id: source_id }),
        }
    }

    /// Make a source due immediately (manual refresh from the UI).
    pub async fn refresh(&self, source_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE source_state SET next_update = ? WHERE source_id = ?")
            .bind(ts(&now))
            .bind(source_id.to_string())
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MonitorError::SourceNotFound { id: source_id });
        }
        info!("Source {} queued for refresh", source_id);
        Ok(())
    }

    /// Replace a user's scoring rules; the slice order is the evaluation order.
    pub async fn save_scoring_rules(&self, user_id: Uuid, rules: &[ScoringRule]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM scoring_rules WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;

        for (position, rule) in rules.iter().enumerate() {
            sqlx::query(
                "INSERT INTO scoring_rules (id, user_id, position, pattern, active, score_change) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(rule.id.to_string())
            .bind(user_id.to_string())
            .bind(position as i64)
            .bind(&rule.pattern)
            .bind(rule.active)
            .bind(rule.score_change)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Saved {} scoring rules for user {}", rules.len(), user_id);
        Ok(())
    }

    pub async fn active_scoring_rules(&self, user_id: Uuid) -> Result<Vec<ScoringRule>> {
        let rows = sqlx::query(
            "SELECT id, user_id, pattern, active, score_change FROM scoring_rules WHERE user_id = ? AND active = 1 ORDER BY position",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ScoringRule {
                    id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                    user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
                    pattern: row.try_get("pattern")?,
                    active: row.try_get("active")?,
                    score_change: row.try_get("score_change")?,
                })
            })
            .collect()
    }

    pub async fn list_entries(&self, source_id: Uuid) -> Result<Vec<Entry>> {
        let rows = sqlx::query("SELECT * FROM entries WHERE source_id = ? ORDER BY created_at, rowid")
            .bind(source_id.to_string())
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Entries created at or after `since` for a source or a whole group.
    pub async fn entries_created_since(&self, since: DateTime<Utc>, scope: EntryScope) -> Result<Vec<Entry>> {
        let rows = match scope {
            EntryScope::Source(source_id) => {
                sqlx::query(
                    "SELECT * FROM entries WHERE source_id = ? AND created_at >= ? ORDER BY created_at, rowid",
                )
                .bind(source_id.to_string())
                .bind(ts(&since))
                .fetch_all(&self.db)
                .await?
            }
            EntryScope::Group(group_id) => {
                sqlx::query(
                    r#"
                    SELECT e.* FROM entries e
                    JOIN sources s ON s.id = e.source_id
                    WHERE s.group_id = ? AND e.created_at >= ?
                    ORDER BY e.created_at, e.rowid
                    "#,
                )
                .bind(group_id.to_string())
                .bind(ts(&since))
                .fetch_all(&self.db)
                .await?
            }
        };
        rows.iter().map(row_to_entry).collect()
    }

    pub async fn mark_read(&self, entry_id: Uuid, read: bool) -> Result<()> {
        let mark = if read { ReadMark::ManualRead } else { ReadMark::Unread };
        sqlx::query("UPDATE entries SET read_mark = ? WHERE id = ?")
            .bind(mark.as_i64())
            .bind(entry_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_star(&self, entry_id: Uuid, star: bool) -> Result<()> {
        sqlx::query("UPDATE entries SET star_mark = ? WHERE id = ?")
            .bind(star)
            .bind(entry_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<BTreeMap<String, i64>> {
        let queries = [
            ("total_sources", "SELECT COUNT(*) FROM sources"),
            ("active_sources", "SELECT COUNT(*) FROM sources WHERE status = 'active'"),
            ("disabled_sources", "SELECT COUNT(*) FROM sources WHERE status = 'disabled'"),
            (
                "failing_sources",
                "SELECT COUNT(*) FROM source_state st JOIN sources s ON s.id = st.source_id \
                 WHERE st.status = 'error' AND s.status = 'active'",
            ),
            ("leased_sources", "SELECT COUNT(*) FROM source_state WHERE lease_owner IS NOT NULL"),
            ("total_entries", "SELECT COUNT(*) FROM entries"),
            ("unread_entries", "SELECT COUNT(*) FROM entries WHERE read_mark = 0"),
            ("history_oids", "SELECT COUNT(*) FROM history_oids"),
        ];

        let mut stats = BTreeMap::new();
        for (name, query) in queries {
            let count: i64 = sqlx::query_scalar(query).fetch_one(&self.db).await?;
            stats.insert(name.to_string(), count);
        }
        Ok(stats)
    }

    /// Active sources due at `now` whose lease is free, oldest-due first.
    pub async fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id FROM sources s
            JOIN source_state st ON st.source_id = s.id
            WHERE s.status = 'active'
              AND st.next_update <= ?
              AND (st.lease_expires_at IS NULL OR st.lease_expires_at <= ?)
            ORDER BY st.next_update ASC
            LIMIT ?
            "#,
        )
        .bind(ts(&now))
        .bind(ts(&now))
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| parse_uuid(&row.try_get::<String, _>("id")?))
            .collect()
    }

    /// Claim the source for `owner` until `now + ttl`.
    ///
    /// Succeeds only when no lease exists or the existing one has expired.
    pub async fn try_acquire_lease(&self, source_id: Uuid, owner: Uuid, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
        let expires = now + crate::utils::to_chrono(ttl);
        let result = sqlx::query(
            r#"
            UPDATE source_state SET lease_owner = ?, lease_expires_at = ?
            WHERE source_id = ? AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
            "#,
        )
        .bind(owner.to_string())
        .bind(ts(&expires))
        .bind(source_id.to_string())
        .bind(ts(&now))
        .execute(&self.db)
        .await?;

        let acquired = result.rows_affected() == 1;
        if acquired {
            debug!("Lease on source {} taken by {} until {}", source_id, owner, expires);
        }
        Ok(acquired)
    }

    /// Drop a lease without touching anything else, if `owner` still holds it.
    pub async fn release_lease(&self, source_id: Uuid, owner: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE source_state SET lease_owner = NULL, lease_expires_at = NULL WHERE source_id = ? AND lease_owner = ?",
        )
        .bind(source_id.to_string())
        .bind(owner.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn filter_states(&self, source_id: Uuid) -> Result<HashMap<String, serde_json::Value>> {
        let rows = sqlx::query("SELECT filter_name, state FROM filter_state WHERE source_id = ?")
            .bind(source_id.to_string())
            .fetch_all(&self.db)
            .await?;

        let mut states = HashMap::new();
        for row in rows {
            let name: String = row.try_get("filter_name")?;
            let state: String = row.try_get("state")?;
            states.insert(name, serde_json::from_str(&state)?);
        }
        Ok(states)
    }

    /// Write every effect of a successful cycle atomically and release the lease.
    ///
    /// Fails with `LeaseLost` (writing nothing) when `lease_owner` no longer holds it.
    pub async fn commit_cycle(&self, commit: CycleCommit) -> Result<usize> {
        let source_id = commit.source_id.to_string();
        let now = ts(&commit.now);
        let mut tx = self.db.begin().await?;

        let holder: Option<String> = sqlx::query_scalar::<_, Option<String>>("SELECT lease_owner FROM source_state WHERE source_id = ?")
            .bind(&source_id)
            .fetch_optional(&mut *tx)
            .await?
            .flatten();
        if holder.as_deref() != Some(commit.lease_owner.to_string().as_str()) {
            tx.rollback().await?;
            warn!("Lease on source {} lost before commit", commit.source_id);
            return Err(MonitorError::LeaseLost { id: commit.source_id });
        }

        for entry in &commit.entries {
            sqlx::query(
                r#"
                INSERT INTO entries (id, source_id, user_id, oid, title, url, content, opts, status,
                                     read_mark, star_mark, score, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (source_id, oid) DO UPDATE SET
                    title = excluded.title,
                    url = excluded.url,
                    content = excluded.content,
                    opts = excluded.opts,
                    status = 'updated',
                    score = excluded.score,
                    updated_at = excluded.updated_at
                WHERE entries.star_mark = 0
                "#,
            )
            .bind(entry.id.to_string())
            .bind(&source_id)
            .bind(entry.user_id.to_string())
            .bind(&entry.oid)
            .bind(&entry.title)
            .bind(&entry.url)
            .bind(&entry.content)
            .bind(serde_json::to_string(&entry.opts)?)
            .bind(entry.status.as_str())
            .bind(entry.read_mark.as_i64())
            .bind(entry.star_mark)
            .bind(entry.score)
            .bind(ts(&entry.created_at))
            .bind(ts(&entry.updated_at))
            .execute(&mut *tx)
            .await?;
        }

        for (name, state) in &commit.filter_states {
            sqlx::query(
                r#"
                INSERT INTO filter_state (source_id, filter_name, state, updated_at) VALUES (?, ?, ?, ?)
                ON CONFLICT (source_id, filter_name) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
                "#,
            )
            .bind(&source_id)
            .bind(name)
            .bind(serde_json::to_string(state)?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        for oid in &commit.seen_oids {
            sqlx::query(
                r#"
                INSERT INTO history_oids (source_id, oid, created_at, last_seen) VALUES (?, ?, ?, ?)
                ON CONFLICT (source_id, oid) DO UPDATE SET last_seen = excluded.last_seen
                "#,
            )
            .bind(&source_id)
            .bind(oid)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        let props = commit.props.as_ref().map(serde_json::to_string).transpose()?;
        let last_update = (commit.status == StateStatus::Ok).then(|| now.clone());
        sqlx::query(
            r#"
            UPDATE source_state
            SET next_update = ?,
                last_update = COALESCE(?, last_update),
                last_check = ?,
                error_counter = 0,
                success_counter = success_counter + 1,
                status = ?,
                error = NULL,
                error_kind = NULL,
                config_error_streak = 0,
                props = COALESCE(?, props),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE source_id = ?
            "#,
        )
        .bind(ts(&commit.next_update))
        .bind(last_update)
        .bind(&now)
        .bind(commit.status.as_str())
        .bind(props)
        .bind(&source_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "Committed cycle for source {}: {} entries, {} fingerprints, next update {}",
            commit.source_id,
            commit.entries.len(),
            commit.seen_oids.len(),
            commit.next_update
        );
        Ok(commit.entries.len())
    }

    /// Record a failed cycle, reschedule it with backoff and release the lease.
    ///
    /// With `disable_after` set, that many consecutive configuration failures
    /// disable the source.
    pub async fn record_failure(
        &self,
        failure: &CycleFailure,
        policy: &SchedulePolicy,
        disable_after: Option<u32>,
    ) -> Result<SourceState> {
        let source_id = failure.source_id.to_string();
        let mut tx = self.db.begin().await?;

        let row = sqlx::query("SELECT error_counter, config_error_streak, lease_owner FROM source_state WHERE source_id = ?")
            .bind(&source_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(MonitorError::SourceNotFound { id: failure.source_id })?;

        let holder: Option<String> = row.try_get("lease_owner")?;
        if holder.as_deref() != Some(failure.lease_owner.to_string().as_str()) {
            tx.rollback().await?;
            return Err(MonitorError::LeaseLost { id: failure.source_id });
        }

        let error_counter = row.try_get::<i64, _>("error_counter")?.max(0) as u32 + 1;
        let config_streak = if failure.category == ErrorCategory::Configuration {
            row.try_get::<i64, _>("config_error_streak")?.max(0) as u32 + 1
        } else {
            0
        };
        let next_update = policy.next_on_error(failure.now, error_counter);

        sqlx::query(
            r#"
            UPDATE source_state
            SET next_update = ?,
                last_error = ?,
                error_counter = ?,
                success_counter = 0,
                status = ?,
                error = ?,
                error_kind = ?,
                config_error_streak = ?,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE source_id = ?
            "#,
        )
        .bind(ts(&next_update))
        .bind(ts(&failure.now))
        .bind(error_counter as i64)
        .bind(StateStatus::Error.as_str())
        .bind(&failure.message)
        .bind(failure.category.as_str())
        .bind(config_streak as i64)
        .bind(&source_id)
        .execute(&mut *tx)
        .await?;

        if let Some(threshold) = disable_after.filter(|t| *t > 0 && config_streak >= *t) {
            sqlx::query("UPDATE sources SET status = ?, updated_at = ? WHERE id = ?")
                .bind(SourceStatus::Disabled.as_str())
                .bind(ts(&failure.now))
                .bind(&source_id)
                .execute(&mut *tx)
                .await?;
            warn!(
                "Disabled source {} after {} consecutive configuration errors (threshold {})",
                failure.source_id, config_streak, threshold
            );
        }

        tx.commit().await?;

        warn!(
            "Source {} failed ({} error #{}): {}; next attempt {}",
            failure.source_id, failure.category, error_counter, failure.message, next_update
        );
        self.get_state(failure.source_id).await
    }

    /// Trim the fingerprint ledger by age and by per-source row count.
    ///
    /// Rows seen on or after their source's last content update are never
    /// removed, whatever their age or rank.
    pub async fn prune_history(&self, now: DateTime<Utc>, keep: Duration, max_rows: u32) -> Result<u64> {
        let cutoff = ts(&(now - crate::utils::to_chrono(keep)));

        let by_age = sqlx::query(
            r#"
            DELETE FROM history_oids
            WHERE last_seen < ?
              AND last_seen < COALESCE(
                    (SELECT st.last_update FROM source_state st WHERE st.source_id = history_oids.source_id), ?)
            "#,
        )
        .bind(&cutoff)
        .bind(&cutoff)
        .execute(&self.db)
        .await?
        .rows_affected();

        let by_count = sqlx::query(
            r#"
            DELETE FROM history_oids WHERE rowid IN (
                SELECT ranked.rid FROM (
                    SELECT h.rowid AS rid, h.source_id, h.last_seen,
                           ROW_NUMBER() OVER (PARTITION BY h.source_id ORDER BY h.last_seen DESC, h.rowid DESC) AS rn
                    FROM history_oids h
                ) ranked
                WHERE ranked.rn > ?
                  AND ranked.last_seen < COALESCE(
                        (SELECT st.last_update FROM source_state st WHERE st.source_id = ranked.source_id), '')
            )
            "#,
        )
        .bind(max_rows as i64)
        .execute(&self.db)
        .await?
        .rows_affected();

        if by_age + by_count > 0 {
            info!("Pruned {} old and {} surplus history fingerprints", by_age, by_count);
        }
        Ok(by_age + by_count)
    }

    /// Remove read, unstarred entries created before `cutoff`.
    pub async fn delete_old_entries(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM entries WHERE created_at < ? AND read_mark > 0 AND star_mark = 0")
            .bind(ts(&cutoff))
            .execute(&self.db)
            .await?
            .rows_affected();

        if deleted > 0 {
            info!("Deleted {} old entries", deleted);
        }
        Ok(deleted)
    }
}

#[async_trait]
impl HistoryLookup for SourceManager {
    async fn seen(&self, source_id: Uuid, oid: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM history_oids WHERE source_id = ? AND oid = ?")
            .bind(source_id.to_string())
            .bind(oid)
            .fetch_optional(&self.db)
            .await?;
        Ok(found.is_some())
    }
}

fn validate_definition(settings: &SourceSettings, interval: Option<&str>) -> Result<()> {
    settings
        .validate()
        .map_err(|e| MonitorError::Configuration(e.to_string()))?;
    if let Some(interval) = interval.filter(|i| !i.trim().is_empty()) {
        parse_interval(interval)?;
    }
    Ok(())
}

fn row_to_source(row: &SqliteRow) -> Result<Source> {
    let id = parse_uuid(&row.try_get::<String, _>("id")?)?;
    let settings: String = row.try_get("settings")?;
    let filters: String = row.try_get("filters")?;
    let settings: SourceSettings = serde_json::from_str(&settings)
        .map_err(|e| MonitorError::Configuration(format!("source {} settings: {}", id, e)))?;
    let filters: Vec<FilterSpec> = serde_json::from_str(&filters)
        .map_err(|e| MonitorError::Configuration(format!("source {} filter chain: {}", id, e)))?;

    Ok(Source {
        id,
        user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
        group_id: row
            .try_get::<Option<String>, _>("group_id")?
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        name: row.try_get("name")?,
        settings,
        filters,
        interval: row.try_get("interval")?,
        diff_mode: DiffMode::from_str(&row.try_get::<String, _>("diff_mode")?)?,
        default_score: row.try_get("default_score")?,
        status: SourceStatus::from_str(&row.try_get::<String, _>("status")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_state(row: &SqliteRow) -> Result<SourceState> {
    let props: String = row.try_get("props")?;
    Ok(SourceState {
        source_id: parse_uuid(&row.try_get::<String, _>("source_id")?)?,
        next_update: parse_ts(&row.try_get::<String, _>("next_update")?)?,
        last_update: parse_opt_ts(row.try_get("last_update")?)?,
        last_check: parse_opt_ts(row.try_get("last_check")?)?,
        last_error: parse_opt_ts(row.try_get("last_error")?)?,
        error_counter: row.try_get::<i64, _>("error_counter")?.max(0) as u32,
        success_counter: row.try_get::<i64, _>("success_counter")?.max(0) as u32,
        status: StateStatus::from_str(&row.try_get::<String, _>("status")?)?,
        error: row.try_get("error")?,
        error_kind: row
            .try_get::<Option<String>, _>("error_kind")?
            .as_deref()
            .map(ErrorCategory::from_str)
            .transpose()?,
        config_error_streak: row.try_get::<i64, _>("config_error_streak")?.max(0) as u32,
        props: serde_json::from_str(&props)?,
        lease_owner: row
            .try_get::<Option<String>, _>("lease_owner")?
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        lease_expires_at: parse_opt_ts(row.try_get("lease_expires_at")?)?,
    })
}

fn row_to_entry(row: &SqliteRow) -> Result<Entry> {
    let opts: String = row.try_get("opts")?;
    Ok(Entry {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        source_id: parse_uuid(&row.try_get::<String, _>("source_id")?)?,
        user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
        oid: row.try_get("oid")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        content: row.try_get("content")?,
        opts: serde_json::from_str(&opts)?,
        status: EntryStatus::from_str(&row.try_get::<String, _>("status")?)?,
        read_mark: ReadMark::from_i64(row.try_get("read_mark")?),
        star_mark: row.try_get("star_mark")?,
        score: row.try_get("score")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}
