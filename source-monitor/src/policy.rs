use crate::types::{MonitorConfig, Result, Source, SourceGroup};
use crate::utils::{parse_interval, to_chrono};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

// Past this many doublings every realistic delay sits on the cap.
const MAX_BACKOFF_STEPS: u32 = 64;

/// Computes when a source is due next.
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    default_interval: Duration,
    jitter_window: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl SchedulePolicy {
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        Ok(Self {
            default_interval: parse_interval(&config.default_interval)?,
            jitter_window: config.jitter_window,
            backoff_initial: config.error_backoff_initial.max(Duration::from_secs(1)),
            backoff_max: config.error_backoff_max.max(config.error_backoff_initial),
        })
    }

    /// Source override, else group override, else the global default.
    pub fn effective_interval(&self, source: &Source, group: Option<&SourceGroup>) -> Result<Duration> {
        if let Some(interval) = source.interval.as_deref().filter(|i| !i.trim().is_empty()) {
            return parse_interval(interval);
        }
        if let Some(interval) = group
            .and_then(|g| g.interval.as_deref())
            .filter(|i| !i.trim().is_empty())
        {
            return parse_interval(interval);
        }
        Ok(self.default_interval)
    }

    /// Upper bound of the random delay added after a success.
    pub fn jitter_bound(&self, interval: Duration) -> Duration {
        self.jitter_window.min(interval / 4)
    }

    pub fn next_on_success<R: Rng + ?Sized>(&self, now: DateTime<Utc>, interval: Duration, rng: &mut R) -> DateTime<Utc> {
        let bound = self.jitter_bound(interval).as_millis() as u64;
        let jitter = if bound == 0 { 0 } else { rng.gen_range(0..=bound) };
        now + to_chrono(interval) + chrono::Duration::milliseconds(jitter as i64)
    }

    /// Delay after `error_count` consecutive failures: doubling from the
    /// initial delay, capped, never randomized.
    pub fn error_delay(&self, error_count: u32) -> Duration {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: self.backoff_initial,
            initial_interval: self.backoff_initial,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.backoff_max,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut delay = self.backoff_initial;
        for _ in 0..error_count.clamp(1, MAX_BACKOFF_STEPS) {
            match backoff.next_backoff() {
                // Whole seconds only
                Some(next) => delay = Duration::from_secs(next.as_secs_f64().round() as u64),
                None => break,
            }
        }
        delay.clamp(Duration::from_secs(1), self.backoff_max)
    }

    pub fn next_on_error(&self, now: DateTime<Utc>, error_count: u32) -> DateTime<Utc> {
        now + to_chrono(self.error_delay(error_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_delay_doubles() {
        let policy = SchedulePolicy::from_config(&MonitorConfig::default()).unwrap();
        assert_eq!(policy.error_delay(1), Duration::from_secs(600));
        assert_eq!(policy.error_delay(2), Duration::from_secs(1200));
        assert_eq!(policy.error_delay(3), Duration::from_secs(2400));
    }

    #[test]
    fn test_jitter_bound_scales_with_interval() {
        let policy = SchedulePolicy::from_config(&MonitorConfig::default()).unwrap();
        assert_eq!(policy.jitter_bound(Duration::from_secs(86_400)), Duration::from_secs(7200));
        assert_eq!(policy.jitter_bound(Duration::from_secs(600)), Duration::from_secs(150));
    }
}
