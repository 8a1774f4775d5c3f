//! Metrics collected by the engine.

use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use warden_core::{FailureKind, Priority};

/// Point-in-time copy of every counter the engine maintains.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests submitted, including resubmissions from the store.
    pub total_requests: u64,
    /// Retried attempts that went on to succeed.
    pub successful_retries: u64,
    /// Retried attempts that failed again.
    pub failed_retries: u64,
    /// Requests that failed terminally.
    pub completely_failed_requests: u64,
    /// Requests that ended by cancellation.
    pub cancelled_requests: u64,
    /// Critical-priority requests that failed terminally.
    pub completely_failed_critical_requests: u64,
    /// Retry attempts keyed by attempt number.
    pub retries_by_attempt: BTreeMap<u32, u64>,
    /// Retry attempts keyed by priority.
    pub retries_by_priority: BTreeMap<i32, u64>,
    /// Submissions keyed by priority.
    pub requests_by_priority: BTreeMap<i32, u64>,
    /// Cumulative time spent waiting for admission.
    pub total_queue_wait_ms: u64,
    /// Cumulative time spent sleeping between retry attempts.
    pub total_retry_delay_ms: u64,
    /// Terminal and per-attempt error tallies by classified kind.
    pub errors_by_kind: BTreeMap<&'static str, u64>,
}

/// Shared recorder handed around the engine.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsSnapshot>,
}

impl Metrics {
    pub(crate) fn record_submission(&self, priority: Priority) {
        let mut m = self.inner.lock();
        m.total_requests += 1;
        *m.requests_by_priority.entry(priority.0).or_default() += 1;
    }

    pub(crate) fn record_retry_scheduled(&self, attempt: u32, priority: Priority, delay: Duration) {
        let mut m = self.inner.lock();
        *m.retries_by_attempt.entry(attempt).or_default() += 1;
        *m.retries_by_priority.entry(priority.0).or_default() += 1;
        m.total_retry_delay_ms += delay.as_millis() as u64;
    }

    pub(crate) fn record_retry_outcome(&self, success: bool) {
        let mut m = self.inner.lock();
        if success {
            m.successful_retries += 1;
        } else {
            m.failed_retries += 1;
        }
    }

    pub(crate) fn record_terminal_failure(&self, critical: bool) {
        let mut m = self.inner.lock();
        m.completely_failed_requests += 1;
        if critical {
            m.completely_failed_critical_requests += 1;
        }
    }

    pub(crate) fn record_cancelled(&self) {
        self.inner.lock().cancelled_requests += 1;
    }

    pub(crate) fn record_error(&self, kind: FailureKind) {
        *self.inner.lock().errors_by_kind.entry(kind.as_str()).or_default() += 1;
    }

    pub(crate) fn record_queue_wait(&self, wait: Duration) {
        self.inner.lock().total_queue_wait_ms += wait.as_millis() as u64;
    }

    /// A copy of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }
}

/// Gauges around every engine-owned sleep, for leak detection.
#[derive(Debug, Default)]
pub struct TimerGauges {
    retry_sleeps: AtomicUsize,
    queue_timers: AtomicUsize,
}

impl TimerGauges {
    pub(crate) fn retry_sleep_started(&self) {
        self.retry_sleeps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry_sleep_finished(&self) {
        self.retry_sleeps.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn queue_timers_started(&self) {
        self.queue_timers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queue_timers_finished(&self) {
        self.queue_timers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current gauge values plus a health score.
    pub fn stats(&self) -> TimerStats {
        let retry = self.retry_sleeps.load(Ordering::Relaxed);
        let queue = self.queue_timers.load(Ordering::Relaxed);
        TimerStats {
            active_retry_sleeps: retry,
            active_queue_timers: queue,
            // Monotone indicator in (0, 1]: 1.0 when no timers are live,
            // decaying as the active count grows. Not a calibrated metric.
            health_score: 1.0 / (1.0 + (retry + queue) as f64 / 64.0),
        }
    }
}

/// Snapshot of the engine's live timers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TimerStats {
    /// Retry-delay sleeps currently in progress.
    pub active_retry_sleeps: usize,
    /// Queue-delay timers currently armed.
    pub active_queue_timers: usize,
    /// `1 / (1 + active / 64)`; 1.0 means no live timers.
    pub health_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::default();
        m.record_submission(Priority::HIGH);
        m.record_submission(Priority::HIGH);
        m.record_submission(Priority::LOW);
        m.record_retry_scheduled(1, Priority::HIGH, Duration::from_millis(1000));
        m.record_retry_scheduled(2, Priority::HIGH, Duration::from_millis(2000));
        m.record_retry_outcome(true);
        m.record_retry_outcome(false);
        m.record_terminal_failure(true);
        m.record_cancelled();
        m.record_error(FailureKind::Server);
        m.record_error(FailureKind::Server);
        m.record_queue_wait(Duration::from_millis(30));

        let s = m.snapshot();
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.requests_by_priority[&Priority::HIGH.0], 2);
        assert_eq!(s.retries_by_attempt[&1], 1);
        assert_eq!(s.retries_by_attempt[&2], 1);
        assert_eq!(s.total_retry_delay_ms, 3000);
        assert_eq!(s.successful_retries, 1);
        assert_eq!(s.failed_retries, 1);
        assert_eq!(s.completely_failed_requests, 1);
        assert_eq!(s.completely_failed_critical_requests, 1);
        assert_eq!(s.cancelled_requests, 1);
        assert_eq!(s.errors_by_kind["server5xx"], 2);
        assert_eq!(s.total_queue_wait_ms, 30);
    }

    #[test]
    fn snapshot_serializes() {
        let m = Metrics::default();
        m.record_submission(Priority::MEDIUM);
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["total_requests"], 1);
    }

    #[test]
    fn timer_health_decays_with_live_timers() {
        let g = TimerGauges::default();
        let healthy = g.stats();
        assert!((healthy.health_score - 1.0).abs() < f64::EPSILON);
        g.retry_sleep_started();
        g.queue_timers_started();
        let busy = g.stats();
        assert_eq!(busy.active_retry_sleeps, 1);
        assert_eq!(busy.active_queue_timers, 1);
        assert!(busy.health_score < healthy.health_score);
        g.retry_sleep_finished();
        g.queue_timers_finished();
        assert!((g.stats().health_score - 1.0).abs() < f64::EPSILON);
    }
}
