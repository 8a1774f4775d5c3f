//! The active-request registry: id → cancellation token plus the bookkeeping
//! that drives the retry-session transition events.

use ahash::HashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use warden_core::RequestId;

pub(crate) struct ActiveEntry {
    pub(crate) token: CancellationToken,
    pub(crate) critical: bool,
    // Set at first admission; drives the started/finished transitions.
    started: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RequestId, ActiveEntry>,
    // Requests admitted at least once and not yet terminal.
    running: usize,
}

/// Instance-owned mapping from request id to lifecycle state. Entries exist
/// from submission until terminal completion.
#[derive(Default)]
pub(crate) struct ActiveRegistry {
    inner: Mutex<Inner>,
}

impl ActiveRegistry {
    /// Track a new submission. Fails when the id is already tracked.
    pub(crate) fn register(
        &self,
        id: RequestId,
        token: CancellationToken,
        critical: bool,
    ) -> Result<(), RequestId> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return Err(id);
        }
        inner.entries.insert(
            id,
            ActiveEntry {
                token,
                critical,
                started: false,
            },
        );
        Ok(())
    }

    /// Record the first admission of `id`. Returns whether this started a
    /// retry session (the active set went from empty to non-empty).
    pub(crate) fn mark_started(&self, id: &RequestId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(id) {
            Some(entry) if !entry.started => {
                entry.started = true;
                inner.running += 1;
                inner.running == 1
            }
            _ => false,
        }
    }

    /// Drop a terminal entry. Returns whether this ended a retry session
    /// (the entry had started and the active set is now empty).
    pub(crate) fn remove(&self, id: &RequestId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(id) {
            Some(entry) if entry.started => {
                inner.running -= 1;
                inner.running == 0
            }
            _ => false,
        }
    }

    pub(crate) fn token(&self, id: &RequestId) -> Option<CancellationToken> {
        self.inner.lock().entries.get(id).map(|e| e.token.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Tokens of every tracked request.
    pub(crate) fn all_tokens(&self) -> Vec<(RequestId, CancellationToken)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), e.token.clone()))
            .collect()
    }

    /// Ids and tokens of every non-critical tracked request.
    pub(crate) fn non_critical(&self) -> Vec<(RequestId, CancellationToken)> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| !e.critical)
            .map(|(id, e)| (id.clone(), e.token.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RequestId {
        RequestId::new(s)
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = ActiveRegistry::default();
        registry
            .register(id("a"), CancellationToken::new(), false)
            .unwrap();
        assert!(registry
            .register(id("a"), CancellationToken::new(), false)
            .is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn session_transitions_track_first_admissions_only() {
        let registry = ActiveRegistry::default();
        registry
            .register(id("a"), CancellationToken::new(), false)
            .unwrap();
        registry
            .register(id("b"), CancellationToken::new(), false)
            .unwrap();

        assert!(registry.mark_started(&id("a")));
        // Re-admissions of the same request do not restart the session.
        assert!(!registry.mark_started(&id("a")));
        assert!(!registry.mark_started(&id("b")));

        assert!(!registry.remove(&id("a")));
        assert!(registry.remove(&id("b")));
    }

    #[test]
    fn unstarted_entries_do_not_end_sessions() {
        let registry = ActiveRegistry::default();
        registry
            .register(id("waiting"), CancellationToken::new(), false)
            .unwrap();
        // Cancelled while still in the queue: never started, no transition.
        assert!(!registry.remove(&id("waiting")));
    }

    #[test]
    fn non_critical_filter() {
        let registry = ActiveRegistry::default();
        registry
            .register(id("crit"), CancellationToken::new(), true)
            .unwrap();
        registry
            .register(id("low"), CancellationToken::new(), false)
            .unwrap();
        let ids: Vec<_> = registry.non_critical().into_iter().map(|(i, _)| i).collect();
        assert_eq!(ids, vec![id("low")]);
    }
}
