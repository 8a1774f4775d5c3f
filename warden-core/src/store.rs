//! Bounded FIFO store for requests that exhausted or bypassed automatic retry.

use crate::request::{RequestDescriptor, RequestId};
use std::collections::VecDeque;

/// Pluggable failed-request store.
///
/// The engine owns hook dispatch, so [`RequestStore::add`] reports the entry
/// it evicted (if any) instead of firing callbacks itself. Stores are not
/// persisted across process restarts.
pub trait RequestStore: Send {
    /// Append a descriptor. Returns the evicted oldest entry when the store
    /// was already at capacity. Duplicates are allowed.
    fn add(&mut self, descriptor: RequestDescriptor) -> Option<RequestDescriptor>;

    /// Remove the first entry with this id, returning it.
    fn remove(&mut self, id: &RequestId) -> Option<RequestDescriptor>;

    /// A copy of all stored descriptors, oldest first.
    fn get_all(&self) -> Vec<RequestDescriptor>;

    /// Drop everything.
    fn clear(&mut self);

    /// Number of stored descriptors.
    fn len(&self) -> usize;

    /// Whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything out, oldest first.
    fn drain(&mut self) -> Vec<RequestDescriptor> {
        let all = self.get_all();
        self.clear();
        all
    }
}

/// The default store: a bounded in-memory FIFO.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: VecDeque<RequestDescriptor>,
    capacity: usize,
}

impl InMemoryStore {
    /// Create a store holding at most `capacity` descriptors.
    /// A zero capacity stores nothing and evicts immediately.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }
}

impl RequestStore for InMemoryStore {
    fn add(&mut self, descriptor: RequestDescriptor) -> Option<RequestDescriptor> {
        self.entries.push_back(descriptor);
        if self.entries.len() > self.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }

    fn remove(&mut self, id: &RequestId) -> Option<RequestDescriptor> {
        let idx = self.entries.iter().position(|d| &d.id == id)?;
        self.entries.remove(idx)
    }

    fn get_all(&self) -> Vec<RequestDescriptor> {
        self.entries.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    fn descriptor(id: &str) -> RequestDescriptor {
        RequestDescriptor::get(Uri::from_static("https://example.com/retry")).id(id)
    }

    #[test]
    fn fifo_eviction_at_capacity() {
        let mut store = InMemoryStore::new(2);
        assert!(store.add(descriptor("a")).is_none());
        assert!(store.add(descriptor("b")).is_none());
        let evicted = store.add(descriptor("c")).expect("oldest entry evicted");
        assert_eq!(evicted.id.as_str(), "a");
        assert_eq!(store.len(), 2);
        let ids: Vec<_> = store.get_all().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![RequestId::new("b"), RequestId::new("c")]);
    }

    #[test]
    fn duplicates_are_allowed() {
        let mut store = InMemoryStore::new(4);
        store.add(descriptor("a"));
        store.add(descriptor("a"));
        assert_eq!(store.len(), 2);
        // remove only takes the first match
        assert!(store.remove(&RequestId::new("a")).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_missing_is_none() {
        let mut store = InMemoryStore::new(4);
        store.add(descriptor("a"));
        assert!(store.remove(&RequestId::new("zzz")).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn drain_empties_in_order() {
        let mut store = InMemoryStore::new(4);
        store.add(descriptor("a"));
        store.add(descriptor("b"));
        let drained = store.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id.as_str(), "a");
        assert!(store.is_empty());
    }

    #[test]
    fn zero_capacity_never_retains() {
        let mut store = InMemoryStore::new(0);
        let evicted = store.add(descriptor("a")).expect("evicts immediately");
        assert_eq!(evicted.id.as_str(), "a");
        assert!(store.is_empty());
    }
}
