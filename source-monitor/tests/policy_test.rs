use chrono::Utc;
use interfaces::CommandSettings;
use rand::rngs::StdRng;
use rand::SeedableRng;
use source_monitor::{
    DiffMode, MonitorConfig, MonitorError, Result, SchedulePolicy, Source, SourceGroup, SourceSettings, SourceStatus,
};
use std::time::Duration;
use uuid::Uuid;

fn source(interval: Option<&str>) -> Source {
    Source {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        group_id: None,
        name: "s".to_string(),
        settings: SourceSettings::Command(CommandSettings {
            command: "true".to_string(),
            timeout_seconds: 5,
        }),
        filters: Vec::new(),
        interval: interval.map(str::to_string),
        diff_mode: DiffMode::Added,
        default_score: 0,
        status: SourceStatus::Active,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn group(interval: Option<&str>) -> SourceGroup {
    SourceGroup {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        name: "g".to_string(),
        interval: interval.map(str::to_string),
    }
}

#[test]
fn test_error_backoff_is_monotonic_and_capped() -> Result<()> {
    let policy = SchedulePolicy::from_config(&MonitorConfig::default())?;
    let cap = Duration::from_secs(24 * 3600);

    let mut previous = Duration::ZERO;
    for errors in 1..=100 {
        let delay = policy.error_delay(errors);
        assert!(delay >= previous, "delay shrank at {} errors", errors);
        assert!(delay <= cap);
        previous = delay;
    }
    assert_eq!(policy.error_delay(20), cap);
    assert_eq!(policy.error_delay(u32::MAX), cap);
    Ok(())
}

#[test]
fn test_error_backoff_ignores_jitter() -> Result<()> {
    let policy = SchedulePolicy::from_config(&MonitorConfig::default())?;
    let now = Utc::now();
    assert_eq!(policy.next_on_error(now, 1), now + chrono::Duration::seconds(600));
    assert_eq!(policy.next_on_error(now, 1), policy.next_on_error(now, 1));
    Ok(())
}

#[test]
fn test_success_schedule_stays_within_jitter() -> Result<()> {
    let policy = SchedulePolicy::from_config(&MonitorConfig::default())?;
    let mut rng = StdRng::seed_from_u64(7);
    let now = Utc::now();
    let interval = Duration::from_secs(3600);
    let bound = policy.jitter_bound(interval);
    assert_eq!(bound, Duration::from_secs(900));

    for _ in 0..200 {
        let next = policy.next_on_success(now, interval, &mut rng);
        let delay = (next - now).to_std().unwrap();
        assert!(delay >= interval);
        assert!(delay <= interval + bound);
    }
    Ok(())
}

#[test]
fn test_zero_jitter_window_is_exact() -> Result<()> {
    let config = MonitorConfig {
        jitter_window: Duration::ZERO,
        ..MonitorConfig::default()
    };
    let policy = SchedulePolicy::from_config(&config)?;
    let mut rng = StdRng::seed_from_u64(1);
    let now = Utc::now();
    assert_eq!(
        policy.next_on_success(now, Duration::from_secs(60), &mut rng),
        now + chrono::Duration::seconds(60)
    );
    Ok(())
}

#[test]
fn test_interval_precedence() -> Result<()> {
    let policy = SchedulePolicy::from_config(&MonitorConfig::default())?;

    assert_eq!(
        policy.effective_interval(&source(Some("30m")), Some(&group(Some("2h"))))?,
        Duration::from_secs(1800)
    );
    assert_eq!(
        policy.effective_interval(&source(None), Some(&group(Some("2h"))))?,
        Duration::from_secs(7200)
    );
    assert_eq!(
        policy.effective_interval(&source(None), Some(&group(None)))?,
        Duration::from_secs(86_400)
    );
    assert_eq!(policy.effective_interval(&source(None), None)?, Duration::from_secs(86_400));
    Ok(())
}

#[test]
fn test_bad_interval_is_a_configuration_error() -> Result<()> {
    let policy = SchedulePolicy::from_config(&MonitorConfig::default())?;
    assert!(matches!(
        policy.effective_interval(&source(Some("every tuesday")), None),
        Err(MonitorError::Configuration(_))
    ));

    let config = MonitorConfig {
        default_interval: "0s".to_string(),
        ..MonitorConfig::default()
    };
    assert!(SchedulePolicy::from_config(&config).is_err());
    Ok(())
}
