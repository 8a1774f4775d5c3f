//! The retry manager: wires the transport, queue, strategy, store, and
//! plugin bus into one request lifecycle.

use bytes::Bytes;
use http::{Request, Response, Uri};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_core::{
    BackoffKind, DefaultStrategy, Failure, FailureKind, InMemoryStore, Priority,
    RequestDescriptor, RequestId, RequestStore, RetryMode, RetryStrategy, SanitizeOptions,
};

use crate::{
    error::{Error, Result},
    events::{Event, EventPayload, ListenerId, Listeners},
    log::RequestLogger,
    metrics::{Metrics, MetricsSnapshot, TimerGauges, TimerStats},
    plugins::{Plugin, PluginContext, PluginDescriptor, PluginRegistry, RecoveryDecision},
    queue::{CriticalPredicate, QueueOptions, RequestQueue},
    transport::Transport,
};

mod active;
use active::ActiveRegistry;

/// What a finished attempt means for the pipeline.
enum AttemptOutcome {
    Success(Response<Bytes>),
    Failure(Failure),
}

struct ManagerInner {
    mode: RetryMode,
    retries: u32,
    strategy: Arc<dyn RetryStrategy>,
    backoff: BackoffKind,
    blocking_threshold: Option<Priority>,
    throw_on_failed_retries: bool,
    throw_on_cancel: bool,
    transport: Transport,
    queue: RequestQueue,
    store: Mutex<Box<dyn RequestStore>>,
    registry: PluginRegistry,
    listeners: Listeners,
    metrics: Metrics,
    timers: Arc<TimerGauges>,
    logger: RequestLogger,
    active: ActiveRegistry,
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

/// The request-governance orchestrator.
///
/// Cheap to clone; all clones share one queue, registry, store, and metric
/// set. Construct via [`RetryManager::builder`].
#[derive(Clone)]
pub struct RetryManager {
    inner: Arc<ManagerInner>,
}

impl RetryManager {
    /// Start building a manager.
    pub fn builder() -> RetryManagerBuilder {
        RetryManagerBuilder::default()
    }

    /// Submit a request through the governed pipeline.
    ///
    /// Resolves with `Ok(Some(response))` on success. Terminal failures
    /// reject with [`Error::Failed`] unless `throw_error_on_failed_retries`
    /// is off, in which case they resolve with `Ok(None)` (hooks still
    /// fire). Cancellations reject with [`Error::Cancelled`] unless
    /// `throw_error_on_cancel_request` is off.
    ///
    /// Fails synchronously with [`Error::QueueFull`] when the waiting list
    /// is saturated.
    pub async fn execute(&self, mut descriptor: RequestDescriptor) -> Result<Option<Response<Bytes>>> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::InvalidConfig("manager has been destroyed".into()));
        }
        descriptor.stamp(self.fresh_id());
        let id = descriptor.id.clone();
        let critical = self.is_critical(&descriptor);
        let token = CancellationToken::new();
        if inner
            .active
            .register(id.clone(), token.clone(), critical)
            .is_err()
        {
            return Err(Error::InvalidConfig(format!(
                "request id {id} is already tracked"
            )));
        }
        inner.metrics.record_submission(descriptor.priority);
        inner.logger.lifecycle(&descriptor, "submitted");

        // The cleanup guard drops the registry entry (and closes the session
        // if this was the last active request) even if the caller drops this
        // future mid-flight.
        let cleanup = ActiveCleanup { manager: self, id };
        let result = self.run_pipeline(descriptor, &token).await;
        drop(cleanup);
        result
    }

    /// The request lifecycle from first admission to terminal completion.
    async fn run_pipeline(
        &self,
        mut descriptor: RequestDescriptor,
        token: &CancellationToken,
    ) -> Result<Option<Response<Bytes>>> {
        let inner = &self.inner;
        loop {
            // Queue admission. A saturated waiting list fails synchronously.
            let critical = self.is_critical(&descriptor);
            let queued_at = Instant::now();
            let admission = inner.queue.enqueue(descriptor)?;
            descriptor = match admission.admitted().await {
                Ok(d) => d,
                Err(err) => {
                    // Removed from the queue by cancellation.
                    return self.finish_cancelled_unadmitted(err);
                }
            };
            inner.metrics.record_queue_wait(queued_at.elapsed());
            if inner.active.mark_started(&descriptor.id) {
                self.emit_started();
            }

            // The guard returns the slot if this future is dropped while the
            // attempt is in flight.
            let mut slot = SlotGuard::new(&inner.queue, critical);

            // Cancellation observed before dispatch must not reach the
            // transport.
            if token.is_cancelled() {
                slot.release();
                inner.metrics.record_error(FailureKind::Cancelled);
                return self.finish_cancelled(&descriptor);
            }

            let outcome = self.dispatch_attempt(&mut descriptor, token).await;
            // The slot is released as soon as the attempt resolves; a retry
            // re-enters the queue as a fresh admission.
            slot.release();

            let failure = match outcome {
                AttemptOutcome::Success(response) => {
                    return self.finish_success(&descriptor, response);
                }
                AttemptOutcome::Failure(failure) => failure,
            };
            inner.metrics.record_error(failure.kind);
            inner.logger.failure(&descriptor, &failure);

            if failure.kind == FailureKind::Cancelled {
                return self.finish_cancelled(&descriptor);
            }

            // A failed attempt that was itself a retry closes its hook pair
            // before anything else happens.
            if descriptor.in_retry {
                self.emit_after_retry(&descriptor, false);
                inner.metrics.record_retry_outcome(false);
            }

            // Recovery interception (token refresh): a plugin may resume the
            // request immediately without consuming a strategy attempt.
            match self.offer_recovery(&mut descriptor, &failure).await {
                RecoveryDecision::RetryNow => continue,
                RecoveryDecision::Fail(error) => {
                    return self.finish_terminal_failure(descriptor, Err(error));
                }
                RecoveryDecision::Continue => {}
            }

            let attempt = descriptor.attempt + 1;
            let max = descriptor.effective_max_retries(inner.retries);
            let automatic = descriptor.effective_mode(inner.mode) == RetryMode::Automatic;
            if automatic && inner.strategy.should_retry(&failure, attempt, max) {
                descriptor.in_retry = true;
                descriptor.attempt = attempt;
                self.emit_before_retry(&mut descriptor);
                let delay = inner.strategy.delay(attempt, max, inner.backoff);
                inner
                    .metrics
                    .record_retry_scheduled(attempt, descriptor.priority, delay);
                if !self.retry_sleep(delay, token).await {
                    // Cancelled mid-delay: terminal, no transport call.
                    inner.metrics.record_error(FailureKind::Cancelled);
                    return self.finish_cancelled(&descriptor);
                }
                if token.is_cancelled() {
                    inner.metrics.record_error(FailureKind::Cancelled);
                    return self.finish_cancelled(&descriptor);
                }
                tracing::debug!(id = %descriptor.id, attempt, "resubmitting after backoff");
                continue;
            }

            return self.finish_terminal_failure(descriptor, Ok(failure));
        }
    }

    /// One transport attempt, with plugin interception on both sides and
    /// cancellation racing the send.
    async fn dispatch_attempt(
        &self,
        descriptor: &mut RequestDescriptor,
        token: &CancellationToken,
    ) -> AttemptOutcome {
        let inner = &self.inner;
        let ctx = self.plugin_ctx();

        // before_dispatch: serve from a plugin (cache) or fail fast
        // (open circuit) without touching the network.
        let mut short_circuit = None;
        for plugin in inner.registry.snapshot() {
            match plugin.before_dispatch(&ctx, descriptor).await {
                Ok(None) => {}
                Ok(Some(response)) => {
                    short_circuit = Some(Ok(response));
                    break;
                }
                Err(failure) => {
                    short_circuit = Some(Err(failure));
                    break;
                }
            }
        }

        let raw = match short_circuit {
            Some(outcome) => outcome,
            None => {
                inner.logger.lifecycle(descriptor, "dispatching");
                let request = match build_request(descriptor) {
                    Ok(request) => request,
                    Err(error) => {
                        let failure =
                            Failure::network(format!("invalid request: {error}"), descriptor);
                        self.after_dispatch(&ctx, descriptor, &Err(failure.clone())).await;
                        return AttemptOutcome::Failure(failure);
                    }
                };
                tokio::select! {
                    res = inner.transport.send(request) => {
                        res.map_err(|error| Failure::network(error.to_string(), descriptor))
                    }
                    () = token.cancelled() => Err(Failure::cancelled(descriptor)),
                }
            }
        };

        self.after_dispatch(&ctx, descriptor, &raw).await;

        match raw {
            Ok(response) if response.status().is_success() => AttemptOutcome::Success(response),
            Ok(response) => {
                AttemptOutcome::Failure(Failure::from_status(response.status(), descriptor))
            }
            Err(failure) => AttemptOutcome::Failure(failure),
        }
    }

    async fn after_dispatch(
        &self,
        ctx: &PluginContext<'_>,
        descriptor: &RequestDescriptor,
        outcome: &std::result::Result<Response<Bytes>, Failure>,
    ) {
        for plugin in self.inner.registry.snapshot() {
            plugin.after_dispatch(ctx, descriptor, outcome).await;
        }
    }

    async fn offer_recovery(
        &self,
        descriptor: &mut RequestDescriptor,
        failure: &Failure,
    ) -> RecoveryDecision {
        let ctx = self.plugin_ctx();
        for plugin in self.inner.registry.snapshot() {
            match plugin.recover(&ctx, descriptor, failure).await {
                RecoveryDecision::Continue => {}
                decision => return decision,
            }
        }
        RecoveryDecision::Continue
    }

    /// Sleep out a retry delay. Returns false when cancelled mid-sleep.
    async fn retry_sleep(&self, delay: Duration, token: &CancellationToken) -> bool {
        if delay.is_zero() {
            return true;
        }
        let timers = &self.inner.timers;
        timers.retry_sleep_started();
        let outcome = tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = token.cancelled() => false,
        };
        timers.retry_sleep_finished();
        outcome
    }

    fn finish_success(
        &self,
        descriptor: &RequestDescriptor,
        response: Response<Bytes>,
    ) -> Result<Option<Response<Bytes>>> {
        if descriptor.in_retry {
            self.emit_after_retry(descriptor, true);
            self.inner.metrics.record_retry_outcome(true);
        }
        self.inner.logger.lifecycle(descriptor, "completed");
        Ok(Some(response))
    }

    /// Terminal failure: hook pair already closed; fire `on_failure`, store
    /// the descriptor, and cascade if it was critical.
    ///
    /// `failure` is `Err` when a recovery plugin substituted its own error
    /// (token refresh exhaustion) for the transport's.
    fn finish_terminal_failure(
        &self,
        descriptor: RequestDescriptor,
        failure: std::result::Result<Failure, Error>,
    ) -> Result<Option<Response<Bytes>>> {
        let inner = &self.inner;
        let critical = self.is_critical(&descriptor);
        self.emit_failure(&descriptor);
        let evicted = inner.store.lock().add(descriptor.clone());
        if let Some(evicted) = evicted {
            self.emit_removed_from_store(&evicted);
        }
        inner.metrics.record_terminal_failure(critical);
        if critical {
            self.emit_critical_failed();
            self.cancel_non_critical();
        }
        if !inner.throw_on_failed_retries {
            return Ok(None);
        }
        Err(match failure {
            Ok(failure) => Error::Failed {
                id: descriptor.id,
                attempt: descriptor.attempt,
                failure,
            },
            Err(error) => error,
        })
    }

    /// Cancellation that was observed after at least one admission.
    ///
    /// Emits `on_failure` only: no retry hooks fire for cancellations, and
    /// the descriptor is not stored for replay.
    fn finish_cancelled(&self, descriptor: &RequestDescriptor) -> Result<Option<Response<Bytes>>> {
        let inner = &self.inner;
        inner.metrics.record_cancelled();
        self.emit_failure(descriptor);
        if !inner.throw_on_cancel {
            return Ok(None);
        }
        Err(Error::Cancelled {
            id: descriptor.id.clone(),
        })
    }

    /// Cancellation that removed the entry while it was still waiting.
    fn finish_cancelled_unadmitted(&self, err: Error) -> Result<Option<Response<Bytes>>> {
        let inner = &self.inner;
        if err.is_cancelled() {
            inner.metrics.record_cancelled();
            inner.metrics.record_error(FailureKind::Cancelled);
            if !inner.throw_on_cancel {
                return Ok(None);
            }
        }
        Err(err)
    }

    fn cancel_non_critical(&self) {
        for (id, token) in self.inner.active.non_critical() {
            tracing::debug!(%id, "cancelling non-critical request after critical failure");
            token.cancel();
            self.inner.queue.cancel_waiting(&id);
        }
    }

    fn is_critical(&self, descriptor: &RequestDescriptor) -> bool {
        self.inner
            .blocking_threshold
            .is_some_and(|t| descriptor.priority.is_critical(t))
    }

    fn fresh_id(&self) -> RequestId {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId::new(format!("req-{n}"))
    }

    fn plugin_ctx(&self) -> PluginContext<'_> {
        PluginContext {
            registry: &self.inner.registry,
            listeners: &self.inner.listeners,
        }
    }

    // Event emission: plugin hooks first (registration order), then the
    // listener channel.

    fn emit_started(&self) {
        self.inner
            .registry
            .dispatch("on_retry_process_started", |p| p.on_retry_process_started());
        self.inner
            .listeners
            .emit(Event::RetryProcessStarted, &EventPayload::None);
    }

    fn emit_finished(&self) {
        self.inner
            .registry
            .dispatch("on_retry_process_finished", |p| p.on_retry_process_finished());
        self.inner
            .listeners
            .emit(Event::RetryProcessFinished, &EventPayload::None);
    }

    fn emit_before_retry(&self, descriptor: &mut RequestDescriptor) {
        self.inner
            .registry
            .dispatch("before_retry", |p| p.before_retry(descriptor));
        self.inner.listeners.emit(
            Event::BeforeRetry,
            &EventPayload::Descriptor(descriptor.clone()),
        );
    }

    fn emit_after_retry(&self, descriptor: &RequestDescriptor, success: bool) {
        self.inner
            .registry
            .dispatch("after_retry", |p| p.after_retry(descriptor, success));
        self.inner.listeners.emit(
            Event::AfterRetry,
            &EventPayload::RetryOutcome {
                descriptor: descriptor.clone(),
                success,
            },
        );
    }

    fn emit_failure(&self, descriptor: &RequestDescriptor) {
        self.inner
            .registry
            .dispatch("on_failure", |p| p.on_failure(descriptor));
        self.inner.listeners.emit(
            Event::Failure,
            &EventPayload::Descriptor(descriptor.clone()),
        );
    }

    fn emit_removed_from_store(&self, descriptor: &RequestDescriptor) {
        self.inner.registry.dispatch("on_request_removed_from_store", |p| {
            p.on_request_removed_from_store(descriptor)
        });
        self.inner.listeners.emit(
            Event::RequestRemovedFromStore,
            &EventPayload::Descriptor(descriptor.clone()),
        );
    }

    fn emit_critical_failed(&self) {
        self.inner.registry.dispatch("on_critical_request_failed", |p| {
            p.on_critical_request_failed()
        });
        self.inner
            .listeners
            .emit(Event::CriticalRequestFailed, &EventPayload::None);
    }
}

/// Additional operations beyond the per-request pipeline.
impl RetryManager {
    /// Cancel a request by id: triggers its token and removes it from the
    /// waiting list if queued. Idempotent. Returns whether the id was known.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        let Some(token) = self.inner.active.token(id) else {
            return false;
        };
        tracing::debug!(%id, "cancelling request");
        token.cancel();
        self.inner.queue.cancel_waiting(id);
        true
    }

    /// Cancel every tracked request. Idempotent.
    pub fn cancel_all_requests(&self) {
        for (id, token) in self.inner.active.all_tokens() {
            token.cancel();
            self.inner.queue.cancel_waiting(&id);
        }
    }

    /// Replay everything in the failed-request store through the pipeline.
    ///
    /// Attempt counters reset to 1 and identities are preserved. Resolves
    /// with the collected responses; the first terminal failure rejects the
    /// batch (failed replays re-enter the store).
    pub async fn retry_failed_requests(&self) -> Result<Vec<Option<Response<Bytes>>>> {
        let drained = self.inner.store.lock().drain();
        for descriptor in &drained {
            self.emit_removed_from_store(descriptor);
        }
        let replays = drained.into_iter().map(|mut descriptor| {
            descriptor.attempt = 1;
            descriptor.in_retry = false;
            self.execute(descriptor)
        });
        // Run every replay to completion before surfacing the first error;
        // aborting mid-batch would strand the remaining requests in flight.
        let results = futures::future::join_all(replays).await;
        let mut responses = Vec::with_capacity(results.len());
        for result in results {
            responses.push(result?);
        }
        Ok(responses)
    }

    /// Register a plugin; its `initialize` runs before this returns.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.inner.registry.register(plugin, self)
    }

    /// Unregister a plugin by name. Returns whether one was removed.
    pub fn unuse_plugin(&self, name: &str) -> bool {
        self.inner.registry.unregister(name, self)
    }

    /// Registered plugins, in registration order.
    pub fn list_plugins(&self) -> Vec<PluginDescriptor> {
        self.inner.registry.list()
    }

    /// Subscribe to a lifecycle event.
    pub fn on(&self, event: Event, callback: impl Fn(&EventPayload) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.on(event, callback)
    }

    /// Unsubscribe. Returns whether a listener was removed.
    pub fn off(&self, event: Event, id: ListenerId) -> bool {
        self.inner.listeners.off(event, id)
    }

    /// Emit an event on the listener channel (application-level use).
    pub fn emit(&self, event: Event, payload: &EventPayload) {
        self.inner.listeners.emit(event, payload);
    }

    /// A copy of the current metric counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The lifecycle logger.
    pub fn logger(&self) -> &RequestLogger {
        &self.inner.logger
    }

    /// Live engine-owned timer gauges and a health score.
    pub fn timer_stats(&self) -> TimerStats {
        self.inner.timers.stats()
    }

    /// The transport handle, for callers that need raw access.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Failed requests currently held for replay.
    pub fn failed_requests(&self) -> Vec<RequestDescriptor> {
        self.inner.store.lock().get_all()
    }

    /// Number of requests tracked by the active registry.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// The admission queue, for observation.
    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    /// Tear the engine down: cancel everything, run every plugin's
    /// `on_before_destroyed`, and drop listeners. Idempotent; subsequent
    /// submissions fail.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("destroying retry manager");
        self.cancel_all_requests();
        self.inner.registry.clear(self);
        self.inner.listeners.clear();
    }
}

/// Returns an admitted queue slot exactly once, even when the pipeline
/// future is dropped mid-attempt.
struct SlotGuard<'a> {
    queue: &'a RequestQueue,
    critical: bool,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(queue: &'a RequestQueue, critical: bool) -> Self {
        Self {
            queue,
            critical,
            armed: true,
        }
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.armed) {
            self.queue.mark_complete(self.critical);
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drops the active-registry entry at terminal completion, even when the
/// caller drops the `execute` future mid-flight.
struct ActiveCleanup<'a> {
    manager: &'a RetryManager,
    id: RequestId,
}

impl Drop for ActiveCleanup<'_> {
    fn drop(&mut self) {
        if self.manager.inner.active.remove(&self.id) {
            self.manager.emit_finished();
        }
    }
}

/// Render a descriptor into a transport request.
fn build_request(descriptor: &RequestDescriptor) -> Result<Request<Bytes>> {
    let uri = if descriptor.params.is_empty() {
        descriptor.uri.clone()
    } else {
        append_params(&descriptor.uri, &descriptor.params)?
    };
    let mut request = Request::builder()
        .method(descriptor.method.clone())
        .uri(uri)
        .body(descriptor.body.clone())
        .map_err(|e| Error::Service(e.into()))?;
    *request.headers_mut() = descriptor.headers.clone();
    Ok(request)
}

fn append_params(uri: &Uri, params: &[(String, String)]) -> Result<Uri> {
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();
    let path = uri.path();
    let merged = match uri.query() {
        Some(existing) => format!("{path}?{existing}&{encoded}"),
        None => format!("{path}?{encoded}"),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        merged
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::Service(e.into()))?,
    );
    Uri::from_parts(parts).map_err(|e| Error::Service(e.into()))
}

/// Builder covering the full configuration surface of the engine.
pub struct RetryManagerBuilder {
    mode: RetryMode,
    retries: u32,
    strategy: Option<Arc<dyn RetryStrategy>>,
    backoff: BackoffKind,
    store: Option<Box<dyn RequestStore>>,
    max_requests_to_store: usize,
    max_concurrent: usize,
    max_queue_size: usize,
    queue_delay: Duration,
    blocking_threshold: Option<Priority>,
    throw_on_failed_retries: bool,
    throw_on_cancel: bool,
    debug: bool,
    enable_sanitization: bool,
    sanitize_options: Option<SanitizeOptions>,
    hooks: Vec<(Event, Box<dyn Fn(&EventPayload) + Send + Sync>)>,
}

impl Default for RetryManagerBuilder {
    fn default() -> Self {
        Self {
            mode: RetryMode::Automatic,
            retries: 3,
            strategy: None,
            backoff: BackoffKind::Exponential,
            store: None,
            max_requests_to_store: 100,
            max_concurrent: 5,
            max_queue_size: 0,
            queue_delay: Duration::ZERO,
            blocking_threshold: None,
            throw_on_failed_retries: true,
            throw_on_cancel: true,
            debug: false,
            enable_sanitization: true,
            sanitize_options: None,
            hooks: Vec::new(),
        }
    }
}

impl RetryManagerBuilder {
    /// Retry automatically or store failures for manual replay.
    #[must_use]
    pub fn mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Default max retries per request.
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Replace the retry strategy (defaults to [`DefaultStrategy`]).
    #[must_use]
    pub fn retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Backoff kind for retry delays.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffKind) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the failed-request store (defaults to a bounded in-memory
    /// FIFO of `max_requests_to_store` entries).
    #[must_use]
    pub fn request_store(mut self, store: Box<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Capacity of the default store.
    #[must_use]
    pub fn max_requests_to_store(mut self, capacity: usize) -> Self {
        self.max_requests_to_store = capacity;
        self
    }

    /// Queue concurrency cap (must be ≥ 1).
    #[must_use]
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Waiting-list cap; 0 means unbounded.
    #[must_use]
    pub fn max_queue_size(mut self, max: usize) -> Self {
        self.max_queue_size = max;
        self
    }

    /// Minimum interval between queue admissions.
    #[must_use]
    pub fn queue_delay(mut self, delay: Duration) -> Self {
        self.queue_delay = delay;
        self
    }

    /// Priorities at or below this value are critical and block
    /// non-critical admissions while in flight.
    #[must_use]
    pub fn blocking_queue_threshold(mut self, threshold: Priority) -> Self {
        self.blocking_threshold = Some(threshold);
        self
    }

    /// Whether terminal failures reject (`true`, default) or resolve with
    /// `None`.
    #[must_use]
    pub fn throw_error_on_failed_retries(mut self, throw: bool) -> Self {
        self.throw_on_failed_retries = throw;
        self
    }

    /// Whether cancellations reject (`true`, default) or resolve with
    /// `None`.
    #[must_use]
    pub fn throw_error_on_cancel_request(mut self, throw: bool) -> Self {
        self.throw_on_cancel = throw;
        self
    }

    /// Enable debug-level lifecycle logging.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Redact sensitive request material in logs (on by default).
    #[must_use]
    pub fn enable_sanitization(mut self, enable: bool) -> Self {
        self.enable_sanitization = enable;
        self
    }

    /// Override the sanitizer's sensitive-field lists.
    #[must_use]
    pub fn sanitize_options(mut self, options: SanitizeOptions) -> Self {
        self.sanitize_options = Some(options);
        self
    }

    /// Subscribe a hook before the engine starts.
    #[must_use]
    pub fn hook(mut self, event: Event, callback: impl Fn(&EventPayload) + Send + Sync + 'static) -> Self {
        self.hooks.push((event, Box::new(callback)));
        self
    }

    /// Assemble the manager around a transport.
    ///
    /// Must run inside a tokio runtime. Fails when `max_concurrent_requests`
    /// is zero.
    pub fn build(self, transport: Transport) -> Result<RetryManager> {
        let timers = Arc::new(TimerGauges::default());
        let threshold = self.blocking_threshold;
        let is_critical: CriticalPredicate = Arc::new(move |d: &RequestDescriptor| {
            threshold.is_some_and(|t| d.priority.is_critical(t))
        });
        let queue = RequestQueue::new(
            QueueOptions {
                max_concurrent: self.max_concurrent,
                max_queue_size: self.max_queue_size,
                queue_delay: self.queue_delay,
            },
            is_critical,
            timers.clone(),
        )?;
        let sanitize = self
            .enable_sanitization
            .then(|| self.sanitize_options.unwrap_or_default());
        let listeners = Listeners::default();
        for (event, callback) in self.hooks {
            listeners.on(event, callback);
        }
        Ok(RetryManager {
            inner: Arc::new(ManagerInner {
                mode: self.mode,
                retries: self.retries,
                strategy: self
                    .strategy
                    .unwrap_or_else(|| Arc::new(DefaultStrategy::default())),
                backoff: self.backoff,
                blocking_threshold: self.blocking_threshold,
                throw_on_failed_retries: self.throw_on_failed_retries,
                throw_on_cancel: self.throw_on_cancel,
                transport,
                queue,
                store: Mutex::new(self.store.unwrap_or_else(|| {
                    Box::new(InMemoryStore::new(self.max_requests_to_store))
                })),
                registry: PluginRegistry::default(),
                listeners,
                metrics: Metrics::default(),
                timers,
                logger: RequestLogger::new(self.debug, sanitize),
                active: ActiveRegistry::default(),
                next_id: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}
