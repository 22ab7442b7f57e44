//! Thread-safe counters for probe throughput and scheduler idling.

use crate::fetcher::ProbeOutcome;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub checks_total: AtomicU64,
    pub success_total: AtomicU64,
    pub failure_total: AtomicU64,
    pub timeout_total: AtomicU64,
    /// Seconds workers spent sleeping because every owner was locked or
    /// cooling down.
    pub wait_sleep_secs: AtomicU64,
    status_counts: DashMap<i32, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, outcome: &ProbeOutcome) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        if outcome.success {
            self.success_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_total.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.timed_out {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        *self.status_counts.entry(outcome.return_code).or_insert(0) += 1;
    }

    pub fn record_wait_sleep(&self, secs: u64) {
        self.wait_sleep_secs.fetch_add(secs, Ordering::Relaxed);
    }

    pub fn status_count(&self, return_code: i32) -> u64 {
        self.status_counts
            .get(&return_code)
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            checks: self.checks_total.load(Ordering::Relaxed),
            successes: self.success_total.load(Ordering::Relaxed),
            failures: self.failure_total.load(Ordering::Relaxed),
            timeouts: self.timeout_total.load(Ordering::Relaxed),
            wait_sleep_secs: self.wait_sleep_secs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSummary {
    pub checks: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub wait_sleep_secs: u64,
}

impl MetricsSummary {
    pub fn success_rate(&self) -> f64 {
        if self.checks == 0 {
            return 0.0;
        }
        self.successes as f64 / self.checks as f64 * 100.0
    }
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} checks ({:.1}% ok), {} failed, {} timed out, {}s waited",
            self.checks,
            self.success_rate(),
            self.failures,
            self.timeouts,
            self.wait_sleep_secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(return_code: i32, success: bool, timed_out: bool) -> ProbeOutcome {
        ProbeOutcome {
            return_code,
            detail: String::new(),
            body: Vec::new(),
            success,
            timed_out,
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_outcome(&outcome(200, true, false));
        metrics.record_outcome(&outcome(200, true, false));
        metrics.record_outcome(&outcome(500, false, false));
        metrics.record_outcome(&outcome(-1, false, true));
        metrics.record_wait_sleep(1);
        metrics.record_wait_sleep(1);

        let summary = metrics.summary();
        assert_eq!(summary.checks, 4);
        assert_eq!(summary.successes, 2);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.timeouts, 1);
        assert_eq!(summary.wait_sleep_secs, 2);
        assert_eq!(metrics.status_count(200), 2);
        assert_eq!(metrics.status_count(500), 1);
        assert_eq!(metrics.status_count(-1), 1);
        assert!((summary.success_rate() - 50.0).abs() < f64::EPSILON);
    }
}
