//! Response cache plugin: serves fresh 2xx responses without touching the
//! network, with per-key coalescing so concurrent misses fill once.

use ahash::HashMap;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Notify;
use warden_core::{request::unix_millis, RequestDescriptor};

use super::{DispatchOutcome, Plugin, PluginContext};

/// Cache behavior knobs.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// How long an entry stays fresh.
    pub ttl: Duration,
    /// Entry cap; exceeding it evicts the least recently used entry.
    pub max_items: usize,
    /// Whether header names/values participate in the cache key.
    pub include_headers: bool,
    /// Methods eligible for caching.
    pub cacheable_methods: Vec<Method>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_items: 256,
            include_headers: false,
            cacheable_methods: vec![Method::GET, Method::HEAD],
        }
    }
}

struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    stored_at_ms: u64,
    last_used_ms: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    // Keys currently being filled by an in-flight request; waiters park on
    // the Notify and re-check the cache when the filler completes.
    fills: HashMap<String, Arc<Notify>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Counters reported by [`CachePlugin::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries currently stored.
    pub entries: usize,
    /// Requests served from the cache.
    pub hits: u64,
    /// Requests that went to the network.
    pub misses: u64,
    /// Entries evicted by the size cap.
    pub evictions: u64,
}

/// The response cache. Register via
/// [`RetryManager::use_plugin`](crate::RetryManager::use_plugin).
pub struct CachePlugin {
    options: CacheOptions,
    state: Mutex<CacheState>,
    hasher: ahash::RandomState,
}

impl CachePlugin {
    /// Build a cache with the given options.
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            state: Mutex::new(CacheState::default()),
            // Fixed seeds keep keys stable within the process.
            hasher: ahash::RandomState::with_seeds(7, 31, 127, 8191),
        }
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Drop entries whose key contains `pattern`. Returns how many went.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.contains(pattern));
        before - state.entries.len()
    }

    /// Current cache counters.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    fn cache_key(&self, descriptor: &RequestDescriptor) -> String {
        let mut hasher = self.hasher.build_hasher();
        descriptor.body.hash(&mut hasher);
        if self.options.include_headers {
            for (name, value) in &descriptor.headers {
                name.as_str().hash(&mut hasher);
                value.as_bytes().hash(&mut hasher);
            }
        }
        let mut params: Vec<_> = descriptor
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        params.sort();
        format!(
            "{} {}?{}#{:x}",
            descriptor.method,
            descriptor.uri,
            params.join("&"),
            hasher.finish()
        )
    }

    fn cacheable(&self, descriptor: &RequestDescriptor) -> bool {
        self.options.cacheable_methods.contains(&descriptor.method)
    }

    fn lookup_fresh(&self, key: &str) -> Option<Response<Bytes>> {
        let now = unix_millis();
        let ttl_ms = self.options.ttl.as_millis() as u64;
        let mut state = self.state.lock();
        let stale = match state.entries.get(key) {
            Some(entry) => now.saturating_sub(entry.stored_at_ms) > ttl_ms,
            None => return None,
        };
        if stale {
            state.entries.remove(key);
            return None;
        }
        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.last_used_ms = now;
        let mut response = Response::builder()
            .status(entry.status)
            .body(entry.body.clone())
            .expect("a stored response rebuilds");
        *response.headers_mut() = entry.headers.clone();
        Some(response)
    }
}

#[async_trait]
impl Plugin for CachePlugin {
    fn name(&self) -> &str {
        "cache"
    }

    fn version(&self) -> &str {
        "1.1.0"
    }

    async fn before_dispatch(
        &self,
        _ctx: &PluginContext<'_>,
        descriptor: &mut RequestDescriptor,
    ) -> Result<Option<Response<Bytes>>, warden_core::Failure> {
        if !self.cacheable(descriptor) {
            return Ok(None);
        }
        let key = self.cache_key(descriptor);
        loop {
            if let Some(response) = self.lookup_fresh(&key) {
                tracing::trace!(id = %descriptor.id, %key, "cache hit");
                return Ok(Some(response));
            }
            // Miss. Either become the filler for this key, or wait for the
            // in-flight fill and re-check.
            let waiter = {
                let mut state = self.state.lock();
                match state.fills.get(&key) {
                    Some(notify) => notify.clone(),
                    None => {
                        state.fills.insert(key.clone(), Arc::new(Notify::new()));
                        state.misses += 1;
                        return Ok(None);
                    }
                }
            };
            let notified = waiter.notified();
            // The fill may have completed (or been replaced) between the map
            // read and creating the future; confirm ours is still the live
            // one so the eventual notify_waiters cannot be missed.
            match self.state.lock().fills.get(&key) {
                Some(current) if Arc::ptr_eq(current, &waiter) => {}
                _ => continue,
            }
            notified.await;
        }
    }

    async fn after_dispatch(
        &self,
        _ctx: &PluginContext<'_>,
        descriptor: &RequestDescriptor,
        outcome: &DispatchOutcome,
    ) {
        if !self.cacheable(descriptor) {
            return;
        }
        let key = self.cache_key(descriptor);
        let now = unix_millis();
        let mut state = self.state.lock();
        if let Ok(response) = outcome {
            if response.status().is_success() {
                state.entries.insert(
                    key.clone(),
                    CacheEntry {
                        status: response.status(),
                        headers: response.headers().clone(),
                        body: response.body().clone(),
                        stored_at_ms: now,
                        last_used_ms: now,
                    },
                );
                if state.entries.len() > self.options.max_items {
                    if let Some(oldest) = state
                        .entries
                        .iter()
                        .min_by_key(|(_, e)| e.last_used_ms)
                        .map(|(k, _)| k.clone())
                    {
                        state.entries.remove(&oldest);
                        state.evictions += 1;
                    }
                }
            }
        }
        // Release the fill slot whatever the outcome, so parked waiters can
        // serve the entry or elect a new filler.
        if let Some(notify) = state.fills.remove(&key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Listeners;
    use crate::plugins::PluginRegistry;
    use http::Uri;

    fn ctx_parts() -> (PluginRegistry, Listeners) {
        (PluginRegistry::default(), Listeners::default())
    }

    fn descriptor(uri: &'static str) -> RequestDescriptor {
        RequestDescriptor::get(Uri::from_static(uri)).id("req-1")
    }

    fn response(status: u16, body: &'static [u8]) -> Response<Bytes> {
        Response::builder()
            .status(status)
            .body(Bytes::from_static(body))
            .unwrap()
    }

    #[tokio::test]
    async fn serves_fresh_entries_without_the_network() {
        let (registry, listeners) = ctx_parts();
        let ctx = PluginContext {
            registry: &registry,
            listeners: &listeners,
        };
        let cache = CachePlugin::new(CacheOptions::default());
        let mut d = descriptor("https://example.com/users");

        // First pass: miss, then a successful fill.
        assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
        cache
            .after_dispatch(&ctx, &d, &Ok(response(200, b"cached")))
            .await;

        // Second pass: served from cache.
        let hit = cache.before_dispatch(&ctx, &mut d).await.unwrap();
        assert_eq!(hit.expect("cache hit").body().as_ref(), b"cached");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn non_success_responses_are_not_stored() {
        let (registry, listeners) = ctx_parts();
        let ctx = PluginContext {
            registry: &registry,
            listeners: &listeners,
        };
        let cache = CachePlugin::new(CacheOptions::default());
        let mut d = descriptor("https://example.com/flaky");
        assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
        cache
            .after_dispatch(&ctx, &d, &Ok(response(500, b"nope")))
            .await;
        assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn uncacheable_methods_pass_through() {
        let (registry, listeners) = ctx_parts();
        let ctx = PluginContext {
            registry: &registry,
            listeners: &listeners,
        };
        let cache = CachePlugin::new(CacheOptions::default());
        let mut d = descriptor("https://example.com/users");
        d.method = Method::POST;
        assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
        cache
            .after_dispatch(&ctx, &d, &Ok(response(200, b"post")))
            .await;
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn expired_entries_are_refilled() {
        let (registry, listeners) = ctx_parts();
        let ctx = PluginContext {
            registry: &registry,
            listeners: &listeners,
        };
        let cache = CachePlugin::new(CacheOptions {
            ttl: Duration::ZERO,
            ..Default::default()
        });
        let mut d = descriptor("https://example.com/users");
        assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
        cache
            .after_dispatch(&ctx, &d, &Ok(response(200, b"v1")))
            .await;
        std::thread::sleep(Duration::from_millis(2));
        // Entry is stale; a new fill begins.
        assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn size_cap_evicts_least_recently_used() {
        let (registry, listeners) = ctx_parts();
        let ctx = PluginContext {
            registry: &registry,
            listeners: &listeners,
        };
        let cache = CachePlugin::new(CacheOptions {
            max_items: 2,
            ..Default::default()
        });
        for uri in ["https://example.com/a", "https://example.com/b", "https://example.com/c"] {
            let mut d = descriptor("https://example.com/");
            d.uri = Uri::from_static(uri);
            assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
            cache
                .after_dispatch(&ctx, &d, &Ok(response(200, b"x")))
                .await;
            std::thread::sleep(Duration::from_millis(2));
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
        // /a was the least recently used and should be gone.
        let mut a = descriptor("https://example.com/a");
        assert!(cache.before_dispatch(&ctx, &mut a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_matches_substrings() {
        let (registry, listeners) = ctx_parts();
        let ctx = PluginContext {
            registry: &registry,
            listeners: &listeners,
        };
        let cache = CachePlugin::new(CacheOptions::default());
        for uri in ["https://example.com/users/1", "https://example.com/teams/1"] {
            let mut d = descriptor("https://example.com/");
            d.uri = uri.parse().unwrap();
            assert!(cache.before_dispatch(&ctx, &mut d).await.unwrap().is_none());
            cache
                .after_dispatch(&ctx, &d, &Ok(response(200, b"x")))
                .await;
        }
        assert_eq!(cache.invalidate("/users/"), 1);
        assert_eq!(cache.stats().entries, 1);
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_on_one_fill() {
        let (registry, listeners) = ctx_parts();
        let ctx = PluginContext {
            registry: &registry,
            listeners: &listeners,
        };
        let cache = Arc::new(CachePlugin::new(CacheOptions::default()));
        let mut first = descriptor("https://example.com/slow");
        // First caller becomes the filler.
        assert!(cache.before_dispatch(&ctx, &mut first).await.unwrap().is_none());

        // Second caller parks instead of double-filling.
        let cache2 = cache.clone();
        let second = tokio::spawn(async move {
            let registry = PluginRegistry::default();
            let listeners = Listeners::default();
            let ctx = PluginContext {
                registry: &registry,
                listeners: &listeners,
            };
            let mut d = descriptor("https://example.com/slow");
            cache2.before_dispatch(&ctx, &mut d).await.unwrap()
        });
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        // Filler completes; the waiter is served from the cache.
        cache
            .after_dispatch(&ctx, &first, &Ok(response(200, b"filled")))
            .await;
        let served = second.await.unwrap().expect("served from coalesced fill");
        assert_eq!(served.body().as_ref(), b"filled");
        assert_eq!(cache.stats().misses, 1);
    }
}
