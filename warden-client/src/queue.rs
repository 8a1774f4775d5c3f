//! Priority-ordered, concurrency-bounded admission for requests.
//!
//! The queue decides *when* a submitted request may be dispatched: at most
//! `max_concurrent` requests run at once, waiting entries are ordered by
//! `(priority, submission timestamp, insertion sequence)`, and admissions
//! are spaced at least `queue_delay` apart. While a critical request is in
//! flight, only other critical entries are admitted.

use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, time::Instant};
use warden_core::{RequestDescriptor, RequestId};

use crate::{
    error::{Error, Result},
    metrics::TimerGauges,
};

/// Classifies descriptors whose failure may block non-critical traffic.
pub type CriticalPredicate = Arc<dyn Fn(&RequestDescriptor) -> bool + Send + Sync>;

/// Queue construction parameters.
#[derive(Clone)]
pub struct QueueOptions {
    /// Maximum requests in flight at once. Must be ≥ 1.
    pub max_concurrent: usize,
    /// Waiting-list capacity. `0` means unbounded.
    pub max_queue_size: usize,
    /// Minimum interval between two successive admissions.
    pub queue_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 0,
            queue_delay: Duration::ZERO,
        }
    }
}

/// Sort key for waiting entries. Priority dominates; ties break by earlier
/// submission, then by insertion order.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct OrderKey {
    priority: i32,
    submitted_at_ms: u64,
    seq: u64,
}

struct Waiter {
    key: OrderKey,
    critical: bool,
    descriptor: RequestDescriptor,
    tx: oneshot::Sender<Result<RequestDescriptor>>,
}

#[derive(Default)]
struct Inner {
    waiting: Vec<Waiter>,
    seq: u64,
    in_flight: usize,
    critical_in_flight: usize,
    last_admission: Option<Instant>,
    delay_timer_armed: bool,
}

/// The admission engine. Clone-cheap; all clones share one waiting list.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Mutex<Inner>>,
    options: QueueOptions,
    is_critical: CriticalPredicate,
    timers: Arc<TimerGauges>,
}

/// A pending admission. Resolves with the descriptor once the queue selects
/// it for dispatch, or rejects if the entry is cancelled while waiting.
#[derive(Debug)]
pub struct Admission {
    id: RequestId,
    rx: oneshot::Receiver<Result<RequestDescriptor>>,
}

impl Admission {
    /// Wait until the queue admits this entry.
    pub async fn admitted(self) -> Result<RequestDescriptor> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The queue was dropped wholesale; treat as cancellation.
            Err(_) => Err(Error::Cancelled { id: self.id }),
        }
    }
}

impl RequestQueue {
    /// Build a queue. Fails when `max_concurrent` is zero.
    pub fn new(
        options: QueueOptions,
        is_critical: CriticalPredicate,
        timers: Arc<TimerGauges>,
    ) -> Result<Self> {
        if options.max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            options,
            is_critical,
            timers,
        })
    }

    /// Insert a descriptor into the waiting list.
    ///
    /// Fails synchronously with [`Error::QueueFull`] (descriptor attached)
    /// when the waiting list is at capacity. Otherwise returns an
    /// [`Admission`] future resolving when the entry is selected.
    pub fn enqueue(&self, descriptor: RequestDescriptor) -> Result<Admission> {
        let mut inner = self.inner.lock();
        if self.options.max_queue_size > 0 && inner.waiting.len() >= self.options.max_queue_size {
            tracing::warn!(id = %descriptor.id, waiting = inner.waiting.len(), "queue full");
            return Err(Error::QueueFull {
                descriptor: Box::new(descriptor),
            });
        }
        inner.seq += 1;
        let key = OrderKey {
            priority: descriptor.priority.0,
            submitted_at_ms: descriptor.submitted_at_ms,
            seq: inner.seq,
        };
        let id = descriptor.id.clone();
        let critical = (self.is_critical)(&descriptor);
        let (tx, rx) = oneshot::channel();
        // `seq` is unique, so the key never collides and insertion is stable.
        let at = inner.waiting.partition_point(|w| w.key < key);
        inner.waiting.insert(
            at,
            Waiter {
                key,
                critical,
                descriptor,
                tx,
            },
        );
        tracing::trace!(%id, position = at, "queued");
        self.admit_ready(&mut inner);
        Ok(Admission { id, rx })
    }

    /// Release a slot held by a completed (or terminally failed) request.
    /// `was_critical` must reflect the completing descriptor's classification
    /// at admission time.
    pub fn mark_complete(&self, was_critical: bool) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if was_critical {
            inner.critical_in_flight = inner.critical_in_flight.saturating_sub(1);
        }
        self.admit_ready(&mut inner);
    }

    /// Remove a waiting entry, rejecting its admission future with
    /// [`Error::Cancelled`]. Returns whether an entry was removed.
    pub fn cancel_waiting(&self, id: &RequestId) -> bool {
        let waiter = {
            let mut inner = self.inner.lock();
            match inner.waiting.iter().position(|w| &w.descriptor.id == id) {
                Some(at) => inner.waiting.remove(at),
                None => return false,
            }
        };
        // Receiver may already be gone; that is fine.
        let _ = waiter.tx.send(Err(Error::Cancelled { id: id.clone() }));
        true
    }

    /// Number of entries waiting for admission.
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Number of admitted entries that have not completed.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// True when the waiting list is empty — i.e. *nothing is left to
    /// admit*. Note the deliberately counter-intuitive name, preserved from
    /// the upstream behavior this engine models: requests may still be in
    /// flight while `is_busy` returns true. Admission loops use it as an
    /// idle/ready signal, not as a load indicator.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().waiting.is_empty()
    }

    /// Defensive copy of the waiting descriptors, in admission order.
    pub fn snapshot_waiting(&self) -> Vec<RequestDescriptor> {
        self.inner
            .lock()
            .waiting
            .iter()
            .map(|w| w.descriptor.clone())
            .collect()
    }

    /// Admit as many waiting entries as the rules allow.
    ///
    /// Admission requires a free slot, the critical-blocking rule to pass,
    /// and `queue_delay` to have elapsed since the previous admission. When
    /// only the delay is missing, a timer re-runs admission at readiness.
    fn admit_ready(&self, inner: &mut Inner) {
        loop {
            if inner.in_flight >= self.options.max_concurrent {
                return;
            }
            let Some(next) = inner.waiting.first() else {
                return;
            };
            // While a critical request is in flight, non-critical entries
            // stay queued; critical arrivals pass through normally.
            if inner.critical_in_flight > 0 && !next.critical {
                return;
            }
            if !self.options.queue_delay.is_zero() {
                if let Some(last) = inner.last_admission {
                    let ready_at = last + self.options.queue_delay;
                    let now = Instant::now();
                    if now < ready_at {
                        self.arm_delay_timer(inner, ready_at - now);
                        return;
                    }
                }
            }
            let waiter = inner.waiting.remove(0);
            inner.in_flight += 1;
            if waiter.critical {
                inner.critical_in_flight += 1;
            }
            inner.last_admission = Some(Instant::now());
            tracing::trace!(id = %waiter.descriptor.id, in_flight = inner.in_flight, "admitted");
            if waiter.tx.send(Ok(waiter.descriptor)).is_err() {
                // Caller gave up before admission; release the slot.
                inner.in_flight -= 1;
                if waiter.critical {
                    inner.critical_in_flight -= 1;
                }
            }
        }
    }

    fn arm_delay_timer(&self, inner: &mut Inner, wait: Duration) {
        if inner.delay_timer_armed {
            return;
        }
        inner.delay_timer_armed = true;
        let queue = self.clone();
        queue.timers.queue_timers_started();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            queue.timers.queue_timers_finished();
            let mut inner = queue.inner.lock();
            inner.delay_timer_armed = false;
            queue.admit_ready(&mut inner);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use http::Uri;
    use tokio::time::{advance, pause};
    use warden_core::Priority;

    fn queue(options: QueueOptions) -> RequestQueue {
        queue_with_threshold(options, None)
    }

    fn queue_with_threshold(options: QueueOptions, threshold: Option<Priority>) -> RequestQueue {
        let is_critical: CriticalPredicate = match threshold {
            Some(t) => Arc::new(move |d: &RequestDescriptor| d.priority.is_critical(t)),
            None => Arc::new(|_| false),
        };
        RequestQueue::new(options, is_critical, Arc::new(TimerGauges::default())).unwrap()
    }

    fn descriptor(id: &str, priority: Priority) -> RequestDescriptor {
        let mut d = RequestDescriptor::get(Uri::from_static("https://example.com/x"))
            .id(id)
            .priority(priority);
        d.submitted_at_ms = 1;
        d
    }

    #[test]
    fn rejects_zero_concurrency() {
        let result = RequestQueue::new(
            QueueOptions {
                max_concurrent: 0,
                ..Default::default()
            },
            Arc::new(|_| false),
            Arc::new(TimerGauges::default()),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn admits_in_priority_order_under_concurrency_one() {
        let q = queue(QueueOptions {
            max_concurrent: 1,
            ..Default::default()
        });
        let first = q.enqueue(descriptor("warm", Priority::LOW)).unwrap();
        // Occupies the only slot.
        let _running = first.admitted().await.unwrap();

        let low = q.enqueue(descriptor("low", Priority::LOW)).unwrap();
        let critical = q.enqueue(descriptor("critical", Priority::CRITICAL)).unwrap();
        let high = q.enqueue(descriptor("high", Priority::HIGH)).unwrap();
        let medium = q.enqueue(descriptor("medium", Priority::MEDIUM)).unwrap();
        assert_eq!(q.waiting_count(), 4);

        let mut order = Vec::new();
        for admission in [critical, high, medium, low] {
            q.mark_complete(false);
            let d = admission.admitted().await.unwrap();
            order.push(d.id.as_str().to_owned());
        }
        assert_eq!(order, ["critical", "high", "medium", "low"]);
    }

    #[tokio::test]
    async fn equal_keys_keep_insertion_order() {
        let q = queue(QueueOptions {
            max_concurrent: 1,
            ..Default::default()
        });
        let _running = q
            .enqueue(descriptor("warm", Priority::MEDIUM))
            .unwrap()
            .admitted()
            .await
            .unwrap();
        let a = q.enqueue(descriptor("a", Priority::MEDIUM)).unwrap();
        let b = q.enqueue(descriptor("b", Priority::MEDIUM)).unwrap();
        let c = q.enqueue(descriptor("c", Priority::MEDIUM)).unwrap();

        q.mark_complete(false);
        assert_eq!(a.admitted().await.unwrap().id.as_str(), "a");
        q.mark_complete(false);
        assert_eq!(b.admitted().await.unwrap().id.as_str(), "b");
        q.mark_complete(false);
        assert_eq!(c.admitted().await.unwrap().id.as_str(), "c");
    }

    #[tokio::test]
    async fn bounded_waiting_list_rejects_synchronously() {
        let q = queue(QueueOptions {
            max_concurrent: 1,
            max_queue_size: 2,
            ..Default::default()
        });
        let _running = q
            .enqueue(descriptor("running", Priority::MEDIUM))
            .unwrap()
            .admitted()
            .await
            .unwrap();
        let _w1 = q.enqueue(descriptor("w1", Priority::MEDIUM)).unwrap();
        let _w2 = q.enqueue(descriptor("w2", Priority::MEDIUM)).unwrap();
        let err = q.enqueue(descriptor("w3", Priority::MEDIUM)).unwrap_err();
        match err {
            Error::QueueFull { descriptor } => assert_eq!(descriptor.id.as_str(), "w3"),
            other => panic!("expected QueueFull, got {other}"),
        }
    }

    #[tokio::test]
    async fn concurrency_bound_is_respected() {
        let q = queue(QueueOptions {
            max_concurrent: 2,
            ..Default::default()
        });
        let a = q.enqueue(descriptor("a", Priority::MEDIUM)).unwrap();
        let b = q.enqueue(descriptor("b", Priority::MEDIUM)).unwrap();
        let c = q.enqueue(descriptor("c", Priority::MEDIUM)).unwrap();
        assert!(a.admitted().now_or_never().is_some());
        assert!(b.admitted().now_or_never().is_some());
        assert_eq!(q.in_flight_count(), 2);
        assert_eq!(q.waiting_count(), 1);
        let mut c = c;
        assert!(futures::poll!(&mut c.rx).is_pending());
        q.mark_complete(false);
        assert!(c.admitted().now_or_never().is_some());
    }

    #[tokio::test]
    async fn cancel_waiting_rejects_the_future() {
        let q = queue(QueueOptions {
            max_concurrent: 1,
            ..Default::default()
        });
        let _running = q
            .enqueue(descriptor("running", Priority::MEDIUM))
            .unwrap()
            .admitted()
            .await
            .unwrap();
        let waiting = q.enqueue(descriptor("victim", Priority::MEDIUM)).unwrap();
        assert!(q.cancel_waiting(&RequestId::new("victim")));
        assert!(!q.cancel_waiting(&RequestId::new("victim")));
        let err = waiting.admitted().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { ref id } if id.as_str() == "victim"));
        assert_eq!(q.waiting_count(), 0);
    }

    #[tokio::test]
    async fn critical_in_flight_blocks_non_critical_admission() {
        let q = queue_with_threshold(
            QueueOptions {
                max_concurrent: 3,
                ..Default::default()
            },
            Some(Priority::CRITICAL),
        );
        let _critical = q
            .enqueue(descriptor("c1", Priority::CRITICAL))
            .unwrap()
            .admitted()
            .await
            .unwrap();
        // Non-critical entries stay queued despite free slots.
        let low = q.enqueue(descriptor("low", Priority::LOW)).unwrap();
        assert_eq!(q.waiting_count(), 1);
        // Critical arrivals are admitted normally.
        let c2 = q.enqueue(descriptor("c2", Priority::CRITICAL)).unwrap();
        assert!(c2.admitted().now_or_never().is_some());
        assert_eq!(q.waiting_count(), 1);
        // Once the critical requests complete, the blocked entry flows.
        q.mark_complete(true);
        q.mark_complete(true);
        assert!(low.admitted().now_or_never().is_some());
    }

    #[tokio::test]
    async fn queue_delay_spaces_admissions() {
        pause();
        let q = queue(QueueOptions {
            max_concurrent: 2,
            queue_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let a = q.enqueue(descriptor("a", Priority::MEDIUM)).unwrap();
        let b = q.enqueue(descriptor("b", Priority::MEDIUM)).unwrap();
        assert!(a.admitted().now_or_never().is_some());
        // Second admission is throttled even though a slot is free.
        let mut b = b;
        assert!(futures::poll!(&mut b.rx).is_pending());
        advance(Duration::from_millis(101)).await;
        assert!(b.admitted().await.is_ok());
    }

    #[tokio::test]
    async fn is_busy_means_nothing_left_to_admit() {
        let q = queue(QueueOptions {
            max_concurrent: 1,
            ..Default::default()
        });
        assert!(q.is_busy());
        let _running = q
            .enqueue(descriptor("running", Priority::MEDIUM))
            .unwrap()
            .admitted()
            .await
            .unwrap();
        // One request in flight, none waiting: still "busy".
        assert!(q.is_busy());
        let _waiting = q.enqueue(descriptor("waiting", Priority::MEDIUM)).unwrap();
        assert!(!q.is_busy());
    }

    #[tokio::test]
    async fn snapshot_is_a_defensive_copy() {
        let q = queue(QueueOptions {
            max_concurrent: 1,
            ..Default::default()
        });
        let _running = q
            .enqueue(descriptor("running", Priority::MEDIUM))
            .unwrap()
            .admitted()
            .await
            .unwrap();
        let _w = q.enqueue(descriptor("w", Priority::LOW)).unwrap();
        let mut snapshot = q.snapshot_waiting();
        assert_eq!(snapshot.len(), 1);
        snapshot[0].priority = Priority::CRITICAL;
        assert_eq!(q.snapshot_waiting()[0].priority, Priority::LOW);
    }
}
