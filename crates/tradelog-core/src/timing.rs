//! Explicit timing of operations.
//!
//! [`PerformanceMonitor`] keeps per-operation counters. Call sites wrap the
//! work in [`PerformanceMonitor::measure`], which times the closure, records
//! whether it succeeded and logs calls slower than the given threshold.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Aggregated statistics for one named operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OperationStats {
    /// Number of completed calls.
    pub total_calls: u64,
    /// Calls that returned `Ok`.
    pub successful_calls: u64,
    /// Calls that returned `Err`.
    pub failed_calls: u64,
    /// Calls slower than their threshold.
    pub slow_calls: u64,
    /// Sum of all call durations.
    pub total_time: Duration,
    /// Fastest call.
    pub min_time: Option<Duration>,
    /// Slowest call.
    pub max_time: Duration,
}

impl OperationStats {
    /// Average call duration, zero before the first call.
    #[must_use]
    pub fn avg_time(&self) -> Duration {
        if self.total_calls == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_time.as_secs_f64() / self.total_calls as f64)
    }

    /// Fraction of calls that succeeded, zero before the first call.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64
    }

    fn record(&mut self, elapsed: Duration, success: bool, slow: bool) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        if slow {
            self.slow_calls += 1;
        }
        self.total_time += elapsed;
        self.min_time = Some(self.min_time.map_or(elapsed, |min| min.min(elapsed)));
        self.max_time = self.max_time.max(elapsed);
    }
}

/// Collects [`OperationStats`] keyed by operation name.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    stats: Mutex<HashMap<String, OperationStats>>,
}

impl PerformanceMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f`, records its duration and outcome under `name`, and logs a
    /// warning if it took longer than `slow_threshold`.
    pub fn measure<T, E, F>(&self, name: &str, slow_threshold: Duration, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        let slow = elapsed > slow_threshold;
        if slow {
            warn!(
                operation = name,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = slow_threshold.as_millis() as u64,
                "Slow operation"
            );
        }
        self.record(name, elapsed, result.is_ok(), slow);
        result
    }

    /// Records an externally timed call.
    pub fn record(&self, name: &str, elapsed: Duration, success: bool, slow: bool) {
        let mut stats = self.stats.lock();
        stats
            .entry(name.to_string())
            .or_default()
            .record(elapsed, success, slow);
    }

    /// Returns the statistics for one operation.
    #[must_use]
    pub fn stats(&self, name: &str) -> Option<OperationStats> {
        self.stats.lock().get(name).cloned()
    }

    /// Returns a copy of all statistics.
    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, OperationStats> {
        self.stats.lock().clone()
    }

    /// Drops all recorded statistics.
    pub fn reset(&self) {
        self.stats.lock().clear();
    }
}
