use std::time::Duration;

use crate::config::BackoffOptions;

/// Bounded exponential backoff for the reconnect loop
///
/// Counts consecutive failures. A failed attempt or a close before the connection
/// became stable adds one; a close after the stable uptime restarts the count at one,
/// so the next delay is the minimum again.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: BackoffOptions,
    failures: u32,
}

impl Backoff {
    pub fn new(options: BackoffOptions) -> Self {
        Self {
            options,
            failures: 0,
        }
    }

    /// Delay to wait before the next connection attempt
    ///
    /// Zero before the first attempt.
    pub fn next_delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }

        let min = self.options.min_delay();
        let max = self.options.max_delay();
        let exponent = i32::try_from(self.failures - 1).unwrap_or(i32::MAX);
        // NaN and factors below one never shrink the delay under the minimum
        let factor = self.options.grow_factor.max(1.0);
        let secs = min.as_secs_f64() * factor.powi(exponent);

        if !secs.is_finite() || secs >= max.as_secs_f64() {
            max.max(min)
        } else {
            Duration::from_secs_f64(secs).max(min)
        }
    }

    /// A connection attempt failed or timed out before opening
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    /// An open connection closed after `uptime`
    pub fn record_close(&mut self, uptime: Duration) {
        if uptime >= self.options.min_uptime() {
            self.failures = 1;
        } else {
            self.record_failure();
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
