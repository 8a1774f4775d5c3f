//! Circuit-breaker plugin: fails fast while a backend is unhealthy and
//! probes its recovery through a half-open gate.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;
use warden_core::{Failure, FailureKind, RequestDescriptor};

use super::{DispatchOutcome, Plugin, PluginContext};

/// Breaker states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Traffic flows; failures are being counted.
    Closed,
    /// Traffic is rejected without touching the network.
    Open,
    /// A bounded number of probes may pass to test recovery.
    HalfOpen,
}

/// How failures accumulate towards the threshold.
#[derive(Clone, Copy, Debug)]
pub enum FailureCounting {
    /// Consecutive failures; any success resets the count.
    Consecutive,
    /// Failures within the trailing window.
    SlidingWindow(Duration),
}

/// Breaker knobs.
#[derive(Clone, Debug)]
pub struct CircuitBreakerOptions {
    /// Failures that trip the breaker.
    pub failure_threshold: u32,
    /// Counting mode.
    pub counting: FailureCounting,
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
    /// Probes admitted per half-open period.
    pub half_open_max: u32,
    /// Consecutive probe successes required to close.
    pub success_threshold: u32,
    /// URL substrings that bypass the gate entirely.
    pub excluded_urls: Vec<String>,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            counting: FailureCounting::Consecutive,
            open_timeout: Duration::from_secs(30),
            half_open_max: 1,
            success_threshold: 1,
            excluded_urls: Vec::new(),
        }
    }
}

/// Counters reported by [`CircuitBreakerPlugin::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BreakerStats {
    /// Times the breaker transitioned to open.
    pub opened_count: u64,
    /// Dispatches rejected while open (or probe-saturated).
    pub rejected_requests: u64,
    /// Probes admitted in half-open periods.
    pub probes: u64,
    /// Failures counted since the breaker last closed.
    pub recorded_failures: u64,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    window: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_admitted: u32,
    probe_successes: u32,
    stats: BreakerStats,
}

/// The breaker. Register via
/// [`RetryManager::use_plugin`](crate::RetryManager::use_plugin).
pub struct CircuitBreakerPlugin {
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreakerPlugin {
    /// Build a breaker with the given options.
    pub fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
                opened_at: None,
                probes_admitted: 0,
                probe_successes: 0,
                stats: BreakerStats::default(),
            }),
        }
    }

    /// The current breaker state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Current breaker counters.
    pub fn stats(&self) -> BreakerStats {
        self.inner.lock().stats
    }

    fn excluded(&self, descriptor: &RequestDescriptor) -> bool {
        let uri = descriptor.uri.to_string();
        self.options.excluded_urls.iter().any(|p| uri.contains(p))
    }

    fn open(inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_admitted = 0;
        inner.probe_successes = 0;
        inner.stats.opened_count += 1;
        tracing::warn!("circuit breaker opened");
    }

    fn close(inner: &mut BreakerInner) {
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.consecutive_failures = 0;
        inner.window.clear();
        inner.probes_admitted = 0;
        inner.probe_successes = 0;
        inner.stats.recorded_failures = 0;
        tracing::info!("circuit breaker closed");
    }

    // Failures that say something about backend health. Client errors and
    // cancellations do not move the breaker.
    fn counts_as_failure(failure: &Failure) -> bool {
        matches!(failure.kind, FailureKind::Network | FailureKind::Server)
    }

    fn record_failure(&self, inner: &mut BreakerInner) {
        inner.stats.recorded_failures += 1;
        let tripped = match self.options.counting {
            FailureCounting::Consecutive => {
                inner.consecutive_failures += 1;
                inner.consecutive_failures >= self.options.failure_threshold
            }
            FailureCounting::SlidingWindow(window) => {
                let now = Instant::now();
                inner.window.push_back(now);
                while inner
                    .window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.window.pop_front();
                }
                inner.window.len() as u32 >= self.options.failure_threshold
            }
        };
        if tripped {
            Self::open(inner);
        }
    }
}

#[async_trait]
impl Plugin for CircuitBreakerPlugin {
    fn name(&self) -> &str {
        "circuit-breaker"
    }

    fn version(&self) -> &str {
        "1.0.2"
    }

    async fn before_dispatch(
        &self,
        _ctx: &PluginContext<'_>,
        descriptor: &mut RequestDescriptor,
    ) -> Result<Option<http::Response<bytes::Bytes>>, Failure> {
        if self.excluded(descriptor) {
            return Ok(None);
        }
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(None),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.options.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_admitted = 1;
                    inner.probe_successes = 0;
                    inner.stats.probes += 1;
                    tracing::debug!("circuit breaker half-open, admitting probe");
                    Ok(None)
                } else {
                    inner.stats.rejected_requests += 1;
                    Err(Failure::network("circuit breaker open", descriptor))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_admitted < self.options.half_open_max {
                    inner.probes_admitted += 1;
                    inner.stats.probes += 1;
                    Ok(None)
                } else {
                    inner.stats.rejected_requests += 1;
                    Err(Failure::network("circuit breaker half-open, probe budget spent", descriptor))
                }
            }
        }
    }

    async fn after_dispatch(
        &self,
        _ctx: &PluginContext<'_>,
        descriptor: &RequestDescriptor,
        outcome: &DispatchOutcome,
    ) {
        if self.excluded(descriptor) {
            return;
        }
        let mut inner = self.inner.lock();
        match outcome {
            Ok(response) if response.status().is_success() => match inner.state {
                BreakerState::Closed => {
                    inner.consecutive_failures = 0;
                }
                BreakerState::HalfOpen => {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.options.success_threshold {
                        Self::close(&mut inner);
                    }
                }
                BreakerState::Open => {}
            },
            Ok(response) => {
                let failure = Failure::from_status(response.status(), descriptor);
                self.note_outcome_failure(&mut inner, &failure);
            }
            Err(failure) => {
                self.note_outcome_failure(&mut inner, failure);
            }
        }
    }
}

impl CircuitBreakerPlugin {
    fn note_outcome_failure(&self, inner: &mut BreakerInner, failure: &Failure) {
        if !Self::counts_as_failure(failure) {
            return;
        }
        match inner.state {
            BreakerState::Closed => self.record_failure(inner),
            // Any probe failure re-opens immediately.
            BreakerState::HalfOpen => Self::open(inner),
            BreakerState::Open => {}
        }
    }
}
