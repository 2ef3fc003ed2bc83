//! Adaptive pacing (`spec.md` §4.1).
//!
//! `delay_rate` is kept as a pure function of `(elapsed, threshold, cap)` so
//! it is unit-testable without a real clock, per the DESIGN NOTES. Everything
//! else in this module is thin plumbing around it.

use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

pub use defer_ids::{Clock, SystemClock, TestClock};

use crate::config::EngineConfig;

/// Computes the delay-rate multiplier for an operation that took `elapsed`
/// against a `threshold` below which no delay is applied, capped at `cap`.
pub fn delay_rate(elapsed: Duration, threshold: Duration, cap: f64) -> f64 {
    if elapsed <= threshold {
        1.0
    } else if threshold.is_zero() {
        cap.max(1.0)
    } else {
        (elapsed.as_secs_f64() / threshold.as_secs_f64())
            .min(cap)
            .max(1.0)
    }
}

/// `next_execution_calculator` from `spec.md` §4.1: the next time an item in
/// this state machine is eligible for another check.
pub fn next_execution_calculator(
    now: DateTime<Utc>,
    config: &EngineConfig,
    fatal: bool,
    delay_rate: f64,
) -> DateTime<Utc> {
    let multiplier = if fatal {
        f64::from(config.fatal_error_interval_multiplier)
    } else {
        1.0
    };
    let millis = config.check_interval().as_millis() as f64 * multiplier * delay_rate;
    now + ChronoDuration::milliseconds(millis.round() as i64)
}

/// A scoped timer begun before a backend call and closed with [`Self::finish`]
/// after, yielding the delay-rate multiplier for that call.
///
/// Mirrors the original's `utils.ExecutionTimer` context manager: Rust has no
/// `with`-block equivalent, so callers bracket the call explicitly:
///
/// ```ignore
/// let timer = ExecutionTimer::start(&config);
/// let result = driver.is_running(&ctx, &vmid).await;
/// let rate = timer.finish();
/// ```
pub struct ExecutionTimer {
    start: Instant,
    threshold: Duration,
    max_delay_rate: f64,
}

impl ExecutionTimer {
    pub fn start(config: &EngineConfig) -> Self {
        Self {
            start: Instant::now(),
            threshold: Duration::from_secs_f64(config.operation_delay_threshold_secs),
            max_delay_rate: config.max_delay_rate,
        }
    }

    /// Returns the delay-rate multiplier observed for the bracketed call.
    pub fn finish(&self) -> f64 {
        delay_rate(self.start.elapsed(), self.threshold, self.max_delay_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_calls_get_rate_one() {
        assert_eq!(
            delay_rate(Duration::from_millis(10), Duration::from_secs(5), 10.0),
            1.0
        );
    }

    #[test]
    fn slow_calls_scale_linearly_up_to_the_cap() {
        let rate = delay_rate(Duration::from_secs(10), Duration::from_secs(5), 10.0);
        assert_eq!(rate, 2.0);

        let capped = delay_rate(Duration::from_secs(1000), Duration::from_secs(5), 10.0);
        assert_eq!(capped, 10.0);
    }

    #[test]
    fn next_execution_applies_fatal_multiplier_and_delay_rate() {
        let config = EngineConfig::default();
        let now = Utc::now();
        let plain = next_execution_calculator(now, &config, false, 1.0);
        assert_eq!(plain, now + ChronoDuration::seconds(config.check_interval_secs as i64));

        let fatal = next_execution_calculator(now, &config, true, 2.0);
        let expected_millis = config.check_interval().as_millis() as f64
            * f64::from(config.fatal_error_interval_multiplier)
            * 2.0;
        assert_eq!(fatal, now + ChronoDuration::milliseconds(expected_millis.round() as i64));
    }
}
