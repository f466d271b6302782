//! Driver health monitoring

use std::time::{Duration, Instant};

use tracing::debug;

const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Counters for the mixing thread or callback, logged once per second
#[derive(Debug, Clone)]
pub(crate) struct DriverMetrics {
    /// Periods mixed and submitted
    pub periods_mixed: u64,
    /// Underruns recovered with prepare
    pub underruns: u64,
    /// Suspends recovered with resume or prepare
    pub suspends: u64,
    /// Writes retried after "try again"
    pub retries: u64,
    /// Average time to mix one period (microseconds)
    pub avg_mix_time_us: f64,
    last_log_time: Instant,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self {
            periods_mixed: 0,
            underruns: 0,
            suspends: 0,
            retries: 0,
            avg_mix_time_us: 0.0,
            last_log_time: Instant::now(),
        }
    }

    pub fn record_mix(&mut self, elapsed_us: f64) {
        self.periods_mixed += 1;
        self.avg_mix_time_us = 0.1 * elapsed_us + 0.9 * self.avg_mix_time_us;
    }

    /// Log and reset the per-interval counters if a second has passed
    pub fn maybe_log(&mut self) {
        if self.last_log_time.elapsed() < LOG_INTERVAL {
            return;
        }

        debug!(
            "SOUND MIXER [tid={:?}]: periods={}, underruns={}, suspends={}, retries={}, avg_mix={:.2}μs",
            std::thread::current().id(),
            self.periods_mixed,
            self.underruns,
            self.suspends,
            self.retries,
            self.avg_mix_time_us
        );

        self.periods_mixed = 0;
        self.underruns = 0;
        self.suspends = 0;
        self.retries = 0;
        self.last_log_time = Instant::now();
    }
}
