//! Restart-rate accounting and launch backoff.

use std::time::{Duration, Instant};

use rand::Rng;

use foreman_model::RestartLimits;

/// Sliding window of recent start timestamps.
///
/// A (re)start is allowed while the number of starts inside the monitoring
/// period stays below the cap. The window is cleared by the first restart
/// that follows a Healthy interval, so a component that recovers does not
/// inherit stale strikes.
#[derive(Debug)]
pub struct RestartTracker {
    max: u32,
    period: Duration,
    starts: Vec<Instant>,
}

impl RestartTracker {
    pub fn new(limits: RestartLimits) -> Self {
        Self {
            max: limits.max_restarts_per_period,
            period: limits.restart_monitoring_period,
            starts: Vec::new(),
        }
    }

    /// Record a start at `now`.
    pub fn record_start(&mut self, now: Instant) {
        self.prune(now);
        self.starts.push(now);
    }

    /// Whether another start is allowed at `now`.
    pub fn restart_allowed(&mut self, now: Instant) -> bool {
        self.prune(now);
        (self.starts.len() as u32) < self.max
    }

    /// When blocked, how long until the oldest entry drains from the window.
    pub fn time_until_slot(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        if (self.starts.len() as u32) < self.max {
            return None;
        }
        let oldest = *self.starts.first()?;
        Some((oldest + self.period).saturating_duration_since(now))
    }

    /// Adopt new limits from a model update, keeping recorded starts.
    pub fn update_limits(&mut self, limits: RestartLimits) {
        self.max = limits.max_restarts_per_period;
        self.period = limits.restart_monitoring_period;
    }

    /// Forget all recorded starts.
    pub fn clear(&mut self) {
        self.starts.clear();
    }

    fn prune(&mut self, now: Instant) {
        let period = self.period;
        self.starts
            .retain(|t| now.saturating_duration_since(*t) < period);
    }
}

/// Exponential backoff with jitter for launch retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Backoff anchored at the spec's restart timeout.
    pub fn for_restart(base: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(1)),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }

    /// Delay before attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(16) as i32);
        let capped = exp.min(self.max.as_millis() as f64);
        let jitter = capped * self.jitter * rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: u32, period_ms: u64) -> RestartLimits {
        RestartLimits {
            max_restarts_per_period: max,
            restart_monitoring_period: Duration::from_millis(period_ms),
        }
    }

    #[test]
    fn window_blocks_at_cap() {
        let mut tracker = RestartTracker::new(limits(2, 10_000));
        let now = Instant::now();

        assert!(tracker.restart_allowed(now));
        tracker.record_start(now);
        assert!(tracker.restart_allowed(now));
        tracker.record_start(now);
        assert!(!tracker.restart_allowed(now));
        assert!(tracker.time_until_slot(now).is_some());
    }

    #[test]
    fn window_drains_over_time() {
        let mut tracker = RestartTracker::new(limits(1, 50));
        let start = Instant::now();
        tracker.record_start(start);
        assert!(!tracker.restart_allowed(start));

        let later = start + Duration::from_millis(60);
        assert!(tracker.restart_allowed(later));
    }

    #[test]
    fn clear_resets_the_window() {
        let mut tracker = RestartTracker::new(limits(1, 60_000));
        let now = Instant::now();
        tracker.record_start(now);
        assert!(!tracker.restart_allowed(now));

        tracker.clear();
        assert!(tracker.restart_allowed(now));
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(200),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(10), Duration::from_millis(200));
    }
}
