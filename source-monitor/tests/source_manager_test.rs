mod common;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{start_time, Harness};
use source_monitor::dedup::{fingerprint, Fingerprinted};
use source_monitor::materializer::{materialize, Scorer};
use source_monitor::source_manager::{CycleCommit, CycleFailure};
use source_monitor::{
    Entry, EntryScope, EntryStatus, ErrorCategory, FilterSpec, Item, MonitorConfig, MonitorError, ReadMark, Result, ScoringRule,
    Source, SourceStatus, StateStatus,
};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(60);

fn entries_for(source: &Source, contents: &[&str], now: DateTime<Utc>) -> Vec<Entry> {
    let emitted = contents
        .iter()
        .map(|c| {
            let item = Item::new(*c);
            Fingerprinted {
                oid: fingerprint(&item),
                item,
            }
        })
        .collect();
    materialize(source, emitted, &Scorer::new(&[], None), now)
}

fn commit(source: &Source, owner: Uuid, now: DateTime<Utc>, contents: &[&str]) -> CycleCommit {
    let entries = entries_for(source, contents, now);
    let seen_oids = entries.iter().map(|e| e.oid.clone()).collect();
    CycleCommit {
        source_id: source.id,
        lease_owner: owner,
        now,
        next_update: now + ChronoDuration::hours(1),
        status: StateStatus::Ok,
        props: Some(BTreeMap::from([("etag".to_string(), "\"v1\"".to_string())])),
        entries,
        filter_states: BTreeMap::new(),
        seen_oids,
    }
}

async fn leased_commit(h: &Harness, source: &Source, now: DateTime<Utc>, contents: &[&str]) -> Result<usize> {
    let owner = Uuid::new_v4();
    assert!(h.manager.try_acquire_lease(source.id, owner, now, TTL).await?);
    h.manager.commit_cycle(commit(source, owner, now, contents)).await
}

#[tokio::test]
async fn test_new_source_is_due_immediately() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("echo", "echo hi")).await?;

    let state = h.manager.get_state(source.id).await?;
    assert_eq!(state.status, StateStatus::New);
    assert_eq!(state.next_update, start_time());
    assert_eq!(state.error_counter, 0);
    assert!(state.lease_owner.is_none());

    assert_eq!(h.manager.select_due(start_time(), 10).await?, vec![source.id]);
    assert_eq!(h.manager.get_source(source.id).await?.name, "echo");
    Ok(())
}

#[tokio::test]
async fn test_invalid_definitions_are_rejected() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;

    let blank = h.add(h.command_source("blank", "   ")).await;
    assert!(matches!(blank, Err(MonitorError::Configuration(_))));

    let bad_interval = h.add(h.command_source("bad", "true").with_interval("soon")).await;
    assert!(matches!(bad_interval, Err(MonitorError::Configuration(_))));

    let bad_chain = h
        .add(h.command_source("chain", "true").with_filters(vec![FilterSpec::new("split").with_param("separator", "")]))
        .await;
    assert!(matches!(bad_chain, Err(MonitorError::Configuration(_))));

    let missing = h.manager.get_source(Uuid::new_v4()).await;
    assert!(matches!(missing, Err(MonitorError::SourceNotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_select_due_orders_and_filters() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let first = h.add(h.command_source("first", "true")).await?;
    h.clock.advance(ChronoDuration::minutes(1));
    let second = h.add(h.command_source("second", "true")).await?;
    h.clock.advance(ChronoDuration::minutes(1));
    let third = h.add(h.command_source("third", "true")).await?;
    h.clock.advance(ChronoDuration::minutes(1));
    let future = h.add(h.command_source("later", "true")).await?;
    h.manager.refresh(future.id, start_time() + ChronoDuration::days(1)).await?;

    let now = start_time() + ChronoDuration::minutes(5);
    assert_eq!(h.manager.select_due(now, 10).await?, vec![first.id, second.id, third.id]);
    assert_eq!(h.manager.select_due(now, 2).await?, vec![first.id, second.id]);

    h.manager.set_source_status(second.id, SourceStatus::Disabled, now).await?;
    assert!(h.manager.try_acquire_lease(third.id, Uuid::new_v4(), now, TTL).await?);
    assert_eq!(h.manager.select_due(now, 10).await?, vec![first.id]);
    Ok(())
}

#[tokio::test]
async fn test_lease_is_exclusive_until_expiry() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let t0 = start_time();

    assert!(h.manager.try_acquire_lease(source.id, a, t0, TTL).await?);
    assert!(!h.manager.try_acquire_lease(source.id, b, t0 + ChronoDuration::seconds(30), TTL).await?);

    // Releasing with the wrong owner is a no-op
    h.manager.release_lease(source.id, b).await?;
    assert_eq!(h.manager.get_state(source.id).await?.lease_owner, Some(a));

    assert!(h.manager.try_acquire_lease(source.id, b, t0 + ChronoDuration::seconds(60), TTL).await?);
    assert_eq!(h.manager.get_state(source.id).await?.lease_owner, Some(b));

    let stale = h.manager.commit_cycle(commit(&source, a, t0, &["x"])).await;
    assert!(matches!(stale, Err(MonitorError::LeaseLost { .. })));
    assert!(h.manager.list_entries(source.id).await?.is_empty());

    h.manager.release_lease(source.id, b).await?;
    assert!(h.manager.get_state(source.id).await?.lease_owner.is_none());
    Ok(())
}

#[tokio::test]
async fn test_commit_writes_everything_and_releases() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let now = start_time();

    let written = leased_commit(&h, &source, now, &["a", "b"]).await?;
    assert_eq!(written, 2);

    let state = h.manager.get_state(source.id).await?;
    assert_eq!(state.status, StateStatus::Ok);
    assert_eq!(state.last_update, Some(now));
    assert_eq!(state.last_check, Some(now));
    assert_eq!(state.next_update, now + ChronoDuration::hours(1));
    assert_eq!(state.success_counter, 1);
    assert_eq!(state.props.get("etag").map(String::as_str), Some("\"v1\""));
    assert!(state.lease_owner.is_none());

    use source_monitor::traits::HistoryLookup;
    assert!(h.manager.seen(source.id, &fingerprint(&Item::new("a"))).await?);
    assert!(!h.manager.seen(source.id, &fingerprint(&Item::new("c"))).await?);

    let entries = h.manager.list_entries(source.id).await?;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == EntryStatus::New && e.read_mark == ReadMark::Unread));
    Ok(())
}

#[tokio::test]
async fn test_not_modified_commit_keeps_props() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let t0 = start_time();
    leased_commit(&h, &source, t0, &["a"]).await?;

    let t1 = t0 + ChronoDuration::hours(2);
    let owner = Uuid::new_v4();
    assert!(h.manager.try_acquire_lease(source.id, owner, t1, TTL).await?);
    h.manager
        .commit_cycle(CycleCommit::not_modified(source.id, owner, t1, t1 + ChronoDuration::hours(1)))
        .await?;

    let state = h.manager.get_state(source.id).await?;
    assert_eq!(state.status, StateStatus::NotModified);
    assert_eq!(state.last_update, Some(t0));
    assert_eq!(state.last_check, Some(t1));
    assert_eq!(state.props.get("etag").map(String::as_str), Some("\"v1\""));
    Ok(())
}

#[tokio::test]
async fn test_entry_upsert_respects_star() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let t0 = start_time();
    leased_commit(&h, &source, t0, &["a", "b"]).await?;

    let entries = h.manager.list_entries(source.id).await?;
    let starred = entries.iter().find(|e| e.content == "b").map(|e| e.id).unwrap();
    h.manager.mark_star(starred, true).await?;

    // Same oids again, as a last-mode source would emit them
    let t1 = t0 + ChronoDuration::hours(1);
    leased_commit(&h, &source, t1, &["a", "b"]).await?;

    let entries = h.manager.list_entries(source.id).await?;
    assert_eq!(entries.len(), 2);
    let a = entries.iter().find(|e| e.content == "a").unwrap();
    let b = entries.iter().find(|e| e.content == "b").unwrap();
    assert_eq!(a.status, EntryStatus::Updated);
    assert_eq!(a.updated_at, t1);
    assert_eq!(b.status, EntryStatus::New);
    assert!(b.star_mark);
    assert_eq!(b.updated_at, t0);
    Ok(())
}

#[tokio::test]
async fn test_record_failure_counts_and_disables() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let policy = h.scheduler.policy().clone();

    let mut now = start_time();
    for attempt in 1..=3u32 {
        let owner = Uuid::new_v4();
        assert!(h.manager.try_acquire_lease(source.id, owner, now, TTL).await?);
        let failure = CycleFailure {
            source_id: source.id,
            lease_owner: owner,
            now,
            category: ErrorCategory::Configuration,
            message: "bad filter".to_string(),
        };
        let state = h.manager.record_failure(&failure, &policy, Some(3)).await?;
        assert_eq!(state.error_counter, attempt);
        assert_eq!(state.config_error_streak, attempt);
        assert_eq!(state.status, StateStatus::Error);
        assert_eq!(state.error_kind, Some(ErrorCategory::Configuration));
        assert_eq!(state.next_update, now + ChronoDuration::from_std(policy.error_delay(attempt)).unwrap());
        assert!(state.lease_owner.is_none());
        now = state.next_update;
    }

    assert_eq!(h.manager.get_source(source.id).await?.status, SourceStatus::Disabled);
    assert!(h.manager.select_due(now + ChronoDuration::days(30), 10).await?.is_empty());

    // Reactivation makes it due and clears the streak
    h.manager.set_source_status(source.id, SourceStatus::Active, now).await?;
    assert_eq!(h.manager.select_due(now, 10).await?, vec![source.id]);
    assert_eq!(h.manager.get_state(source.id).await?.config_error_streak, 0);
    Ok(())
}

#[tokio::test]
async fn test_record_failure_requires_lease() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let failure = CycleFailure {
        source_id: source.id,
        lease_owner: Uuid::new_v4(),
        now: start_time(),
        category: ErrorCategory::Fetch,
        message: "boom".to_string(),
    };
    let result = h.manager.record_failure(&failure, h.scheduler.policy(), None).await;
    assert!(matches!(result, Err(MonitorError::LeaseLost { .. })));
    assert_eq!(h.manager.get_state(source.id).await?.error_counter, 0);
    Ok(())
}

#[tokio::test]
async fn test_prune_keeps_current_content() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let t0 = start_time();
    leased_commit(&h, &source, t0, &["old", "kept"]).await?;

    let t1 = t0 + ChronoDuration::days(200);
    leased_commit(&h, &source, t1, &["kept"]).await?;

    let keep = Duration::from_secs(180 * 86_400);
    assert_eq!(h.manager.prune_history(t1, keep, 10_000).await?, 1);

    // Even a zero row budget never removes what the last update saw
    assert_eq!(h.manager.prune_history(t1, keep, 0).await?, 0);

    use source_monitor::traits::HistoryLookup;
    assert!(!h.manager.seen(source.id, &fingerprint(&Item::new("old"))).await?);
    assert!(h.manager.seen(source.id, &fingerprint(&Item::new("kept"))).await?);
    Ok(())
}

#[tokio::test]
async fn test_prune_by_row_count() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let t0 = start_time();
    leased_commit(&h, &source, t0, &["1"]).await?;
    leased_commit(&h, &source, t0 + ChronoDuration::hours(1), &["2"]).await?;
    leased_commit(&h, &source, t0 + ChronoDuration::hours(2), &["3"]).await?;

    let now = t0 + ChronoDuration::hours(3);
    let removed = h.manager.prune_history(now, Duration::from_secs(365 * 86_400), 1).await?;
    assert_eq!(removed, 2);
    assert_eq!(h.manager.stats().await?.get("history_oids"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn test_delete_old_entries_spares_unread_and_starred() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let source = h.add(h.command_source("s", "true")).await?;
    let t0 = start_time();
    leased_commit(&h, &source, t0, &["read", "unread", "starred"]).await?;

    for entry in h.manager.list_entries(source.id).await? {
        match entry.content.as_str() {
            "read" => h.manager.mark_read(entry.id, true).await?,
            "starred" => {
                h.manager.mark_read(entry.id, true).await?;
                h.manager.mark_star(entry.id, true).await?;
            }
            _ => {}
        }
    }

    let deleted = h.manager.delete_old_entries(t0 + ChronoDuration::days(1)).await?;
    assert_eq!(deleted, 1);

    let left: Vec<String> = h
        .manager
        .list_entries(source.id)
        .await?
        .into_iter()
        .map(|e| e.content)
        .collect();
    assert_eq!(left, vec!["unread".to_string(), "starred".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_entries_by_group_scope() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let group = h.manager.create_group(h.user_id, "news", Some("6h")).await?;
    let grouped = h.add(h.command_source("grouped", "true").with_group(group.id)).await?;
    let loose = h.add(h.command_source("loose", "true")).await?;
    let t0 = start_time();
    leased_commit(&h, &grouped, t0, &["g"]).await?;
    leased_commit(&h, &loose, t0, &["l"]).await?;

    let in_group = h.manager.entries_created_since(t0, EntryScope::Group(group.id)).await?;
    assert_eq!(in_group.len(), 1);
    assert_eq!(in_group[0].content, "g");

    let later = h
        .manager
        .entries_created_since(t0 + ChronoDuration::seconds(1), EntryScope::Source(loose.id))
        .await?;
    assert!(later.is_empty());

    assert_eq!(h.manager.get_group(group.id).await?.and_then(|g| g.interval), Some("6h".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_scoring_rules_keep_order() -> Result<()> {
    let h = Harness::new(MonitorConfig::default()).await?;
    let mut inactive = ScoringRule::new(h.user_id, "ignored", 1);
    inactive.active = false;
    let rules = vec![
        ScoringRule::new(h.user_id, "first", 1),
        inactive,
        ScoringRule::new(h.user_id, "second", -1),
    ];
    h.manager.save_scoring_rules(h.user_id, &rules).await?;

    let active = h.manager.active_scoring_rules(h.user_id).await?;
    let patterns: Vec<&str> = active.iter().map(|r| r.pattern.as_str()).collect();
    assert_eq!(patterns, vec!["first", "second"]);
    assert!(h.manager.active_scoring_rules(Uuid::new_v4()).await?.is_empty());
    Ok(())
}
