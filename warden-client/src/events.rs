//! The listener channel: application-level subscriptions to lifecycle
//! events without implementing the plugin contract.

use ahash::HashMap;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use warden_core::RequestDescriptor;

/// Lifecycle events observable by listeners and plugins.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Event {
    /// Active set transitioned from empty to non-empty.
    RetryProcessStarted,
    /// Active set transitioned back to empty.
    RetryProcessFinished,
    /// A retry attempt is about to be dispatched.
    BeforeRetry,
    /// A retry attempt resolved (successfully or not).
    AfterRetry,
    /// A request failed terminally.
    Failure,
    /// A descriptor left the failed-request store (eviction or removal).
    RequestRemovedFromStore,
    /// A critical-priority request failed terminally.
    CriticalRequestFailed,
    /// A token refresh is about to begin.
    BeforeTokenRefresh,
    /// A token refresh succeeded.
    TokenRefreshed,
    /// A token refresh gave up.
    TokenRefreshFailed,
}

/// Event payloads handed to listeners. Listener callbacks observe snapshots;
/// only plugin `before_retry` hooks get mutable access to descriptors.
#[derive(Clone, Debug, Default)]
pub enum EventPayload {
    /// No payload.
    #[default]
    None,
    /// A snapshot of the descriptor involved.
    Descriptor(RequestDescriptor),
    /// A retry attempt outcome.
    RetryOutcome {
        /// Snapshot of the descriptor involved.
        descriptor: RequestDescriptor,
        /// Whether the attempt succeeded.
        success: bool,
    },
    /// A freshly obtained token.
    Token(String),
}

/// Handle returned by [`Listeners::on`], used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&EventPayload) + Send + Sync>;

/// Subscription registry. Emission order follows subscription order.
#[derive(Default)]
pub struct Listeners {
    inner: Mutex<HashMap<Event, Vec<(ListenerId, Callback)>>>,
    next_id: AtomicU64,
}

impl Listeners {
    /// Subscribe to an event. The returned id unsubscribes via [`Listeners::off`].
    pub fn on(&self, event: Event, callback: impl Fn(&EventPayload) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .lock()
            .entry(event)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns whether one was removed.
    pub fn off(&self, event: Event, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(callbacks) = inner.get_mut(&event) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        before != callbacks.len()
    }

    /// Invoke every subscriber for `event`, in subscription order.
    ///
    /// Callbacks run outside the registry lock, so a listener may call
    /// [`Listeners::on`]/[`Listeners::off`] reentrantly.
    pub fn emit(&self, event: Event, payload: &EventPayload) {
        let callbacks: Vec<Callback> = {
            let inner = self.inner.lock();
            match inner.get(&event) {
                Some(cbs) => cbs.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(payload);
        }
    }

    /// Number of live subscriptions across all events.
    pub fn len(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }

    /// Whether there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_subscribers_in_order() {
        let listeners = Listeners::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());
        listeners.on(Event::Failure, move |_| l1.lock().push("first"));
        listeners.on(Event::Failure, move |_| l2.lock().push("second"));
        listeners.emit(Event::Failure, &EventPayload::None);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn off_removes_only_the_target() {
        let listeners = Listeners::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let keep = listeners.on(Event::AfterRetry, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        let c = count.clone();
        let drop_me = listeners.on(Event::AfterRetry, move |_| {
            c.fetch_add(10, Ordering::Relaxed);
        });
        assert!(listeners.off(Event::AfterRetry, drop_me));
        assert!(!listeners.off(Event::AfterRetry, drop_me));
        listeners.emit(Event::AfterRetry, &EventPayload::None);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(listeners.off(Event::AfterRetry, keep));
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let listeners = Listeners::default();
        listeners.emit(Event::TokenRefreshed, &EventPayload::Token("t".into()));
    }

    #[test]
    fn listeners_may_resubscribe_reentrantly() {
        let listeners = Arc::new(Listeners::default());
        let inner = listeners.clone();
        listeners.on(Event::RetryProcessStarted, move |_| {
            inner.on(Event::RetryProcessFinished, |_| {});
        });
        listeners.emit(Event::RetryProcessStarted, &EventPayload::None);
        assert_eq!(listeners.len(), 2);
    }
}
