//! The plugin contract and the registry that dispatches lifecycle hooks.
//!
//! Plugins attach cross-cutting behavior to the request lifecycle: they
//! observe hook events, may mutate descriptors in `before_retry`, and can
//! intercept the dispatch path (short-circuit it, observe its outcome, or
//! request an immediate recovery resubmission).
//!
//! Hook errors are contained: a failing handler is logged and never
//! prevents other plugins from running, nor affects the request itself.
//! Only `initialize` errors propagate, to the caller of
//! [`RetryManager::use_plugin`](crate::RetryManager::use_plugin).

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use parking_lot::Mutex;
use std::sync::Arc;
use tower::BoxError;
use warden_core::{Failure, RequestDescriptor};

use crate::{
    error::{Error, Result},
    events::Listeners,
    manager::RetryManager,
};

pub mod cache;
pub use cache::{CacheOptions, CachePlugin, CacheStats};

pub mod circuit_breaker;
pub use circuit_breaker::{
    BreakerState, BreakerStats, CircuitBreakerOptions, CircuitBreakerPlugin, FailureCounting,
};

pub mod token_refresh;
pub use token_refresh::{RefreshHandler, TokenRefreshOptions, TokenRefreshPlugin};

/// Outcome of one transport dispatch, as seen by `after_dispatch`.
///
/// `Ok` carries any received response, successful or not; `Err` carries
/// transport-level failures (network errors, cancellations, and failures
/// synthesized by `before_dispatch` short-circuits).
pub type DispatchOutcome = std::result::Result<Response<Bytes>, Failure>;

/// What a plugin's [`Plugin::recover`] wants done with a failed attempt.
#[derive(Debug)]
pub enum RecoveryDecision {
    /// Let the failure flow through the retry strategy unchanged.
    Continue,
    /// Resubmit the (possibly mutated) descriptor immediately, without
    /// consuming a strategy attempt.
    RetryNow,
    /// Fail the request terminally with this error instead of the
    /// transport's own.
    Fail(Error),
}

/// Borrowed view of the engine handed to interception hooks, so plugins can
/// emit events without holding a reference to the manager itself.
pub struct PluginContext<'a> {
    pub(crate) registry: &'a PluginRegistry,
    pub(crate) listeners: &'a Listeners,
}

impl PluginContext<'_> {
    /// Announce that a token refresh is about to start.
    pub fn emit_before_token_refresh(&self) {
        self.registry
            .dispatch("on_before_token_refresh", |p| p.on_before_token_refresh());
        self.listeners.emit(
            crate::events::Event::BeforeTokenRefresh,
            &crate::events::EventPayload::None,
        );
    }

    /// Announce a successful token refresh.
    pub fn emit_token_refreshed(&self, token: &str) {
        self.registry
            .dispatch("on_token_refreshed", |p| p.on_token_refreshed(token));
        self.listeners.emit(
            crate::events::Event::TokenRefreshed,
            &crate::events::EventPayload::Token(token.to_owned()),
        );
    }

    /// Announce that the token refresh flow gave up.
    pub fn emit_token_refresh_failed(&self) {
        self.registry
            .dispatch("on_token_refresh_failed", |p| p.on_token_refresh_failed());
        self.listeners.emit(
            crate::events::Event::TokenRefreshFailed,
            &crate::events::EventPayload::None,
        );
    }
}

/// A named, versioned extension of the request lifecycle.
///
/// All hook methods default to no-ops; implement the ones you need.
/// Versions must be `MAJOR.MINOR.PATCH`.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Plugin version, `MAJOR.MINOR.PATCH`.
    fn version(&self) -> &str;

    /// Called once at registration. Errors abort the registration.
    fn initialize(&self, _manager: &RetryManager) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called before the plugin is removed from the registry.
    fn on_before_destroyed(&self, _manager: &RetryManager) {}

    /// The active set transitioned from empty to non-empty.
    fn on_retry_process_started(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// The active set transitioned back to empty.
    fn on_retry_process_finished(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// A retry is about to be dispatched; governance fields may be mutated.
    fn before_retry(&self, _descriptor: &mut RequestDescriptor) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// A retried attempt resolved.
    fn after_retry(
        &self,
        _descriptor: &RequestDescriptor,
        _success: bool,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// A request failed terminally (fired before store insertion).
    fn on_failure(&self, _descriptor: &RequestDescriptor) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// A descriptor left the failed-request store.
    fn on_request_removed_from_store(
        &self,
        _descriptor: &RequestDescriptor,
    ) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// A critical-priority request failed terminally.
    fn on_critical_request_failed(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// A token refresh is about to start.
    fn on_before_token_refresh(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// A token refresh produced a new token.
    fn on_token_refreshed(&self, _token: &str) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// The token refresh flow gave up.
    fn on_token_refresh_failed(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Runs before the transport is invoked for an attempt.
    ///
    /// Returning `Ok(Some(response))` short-circuits the network entirely
    /// (e.g. a cache hit). Returning `Err(failure)` fails the attempt
    /// without touching the network (e.g. an open circuit); the failure
    /// then flows through the retry strategy like any other.
    async fn before_dispatch(
        &self,
        _ctx: &PluginContext<'_>,
        _descriptor: &mut RequestDescriptor,
    ) -> std::result::Result<Option<Response<Bytes>>, Failure> {
        Ok(None)
    }

    /// Observes the outcome of every attempt, including short-circuits from
    /// other plugins and cancellations.
    async fn after_dispatch(
        &self,
        _ctx: &PluginContext<'_>,
        _descriptor: &RequestDescriptor,
        _outcome: &DispatchOutcome,
    ) {
    }

    /// Offered each classified failure before the retry strategy sees it.
    async fn recover(
        &self,
        _ctx: &PluginContext<'_>,
        _descriptor: &mut RequestDescriptor,
        _failure: &Failure,
    ) -> RecoveryDecision {
        RecoveryDecision::Continue
    }
}

/// `(name, version)` pair as reported by [`PluginRegistry::list`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PluginDescriptor {
    /// Registered plugin name.
    pub name: String,
    /// Registered plugin version.
    pub version: String,
}

/// Registry of plugins in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    /// Validate and register a plugin, invoking its `initialize`.
    ///
    /// Fails on empty names, malformed versions, duplicate names, and
    /// `initialize` errors (in which case nothing is registered).
    pub fn register(&self, plugin: Arc<dyn Plugin>, manager: &RetryManager) -> Result<()> {
        let name = plugin.name().to_owned();
        if name.is_empty() {
            return Err(Error::PluginRejected("plugin name must not be empty".into()));
        }
        let version = plugin.version().to_owned();
        if !valid_version(&version) {
            return Err(Error::PluginVersion { name, version });
        }
        if self.plugins.lock().iter().any(|p| p.name() == name) {
            return Err(Error::PluginRejected(format!(
                "plugin {name:?} is already registered"
            )));
        }
        plugin
            .initialize(manager)
            .map_err(|source| Error::PluginInit {
                name: name.clone(),
                source,
            })?;
        tracing::debug!(plugin = %name, %version, "registered plugin");
        self.plugins.lock().push(plugin);
        Ok(())
    }

    /// Unregister by name, invoking `on_before_destroyed` first.
    /// Returns whether a plugin was removed.
    pub fn unregister(&self, name: &str, manager: &RetryManager) -> bool {
        let plugin = {
            let mut plugins = self.plugins.lock();
            match plugins.iter().position(|p| p.name() == name) {
                Some(at) => plugins.remove(at),
                None => return false,
            }
        };
        plugin.on_before_destroyed(manager);
        true
    }

    /// Registered `(name, version)` pairs, in registration order.
    pub fn list(&self) -> Vec<PluginDescriptor> {
        self.plugins
            .lock()
            .iter()
            .map(|p| PluginDescriptor {
                name: p.name().to_owned(),
                version: p.version().to_owned(),
            })
            .collect()
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.lock().is_empty()
    }

    /// Remove every plugin, invoking `on_before_destroyed` on each.
    pub(crate) fn clear(&self, manager: &RetryManager) {
        let plugins = std::mem::take(&mut *self.plugins.lock());
        for plugin in plugins {
            plugin.on_before_destroyed(manager);
        }
    }

    /// A clone of the plugin list, so hooks run outside the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.lock().clone()
    }

    /// Invoke a hook on every plugin in registration order, containing
    /// errors so one handler never starves the rest.
    pub(crate) fn dispatch(
        &self,
        event: &str,
        mut hook: impl FnMut(&dyn Plugin) -> std::result::Result<(), BoxError>,
    ) {
        for plugin in self.snapshot() {
            if let Err(error) = hook(plugin.as_ref()) {
                tracing::warn!(plugin = plugin.name(), event, %error, "plugin hook failed");
            }
        }
    }
}

/// Strict `MAJOR.MINOR.PATCH` check; no pre-release or build metadata.
fn valid_version(version: &str) -> bool {
    let mut parts = version.split('.');
    let numeric = (0..3).all(|_| {
        parts
            .next()
            .is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    });
    numeric && parts.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_validation() {
        assert!(valid_version("1.0.0"));
        assert!(valid_version("0.12.345"));
        assert!(!valid_version("1.0"));
        assert!(!valid_version("1.0.0.0"));
        assert!(!valid_version("1.0.x"));
        assert!(!valid_version("v1.0.0"));
        assert!(!valid_version(""));
        assert!(!valid_version("1..0"));
    }

    struct Named(&'static str, &'static str);
    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn version(&self) -> &str {
            self.1
        }
    }

    // Registration paths that need a manager are covered in manager tests;
    // the pure validations are testable in isolation.
    #[test]
    fn list_is_in_registration_order() {
        let registry = PluginRegistry::default();
        registry.plugins.lock().push(Arc::new(Named("one", "1.0.0")));
        registry.plugins.lock().push(Arc::new(Named("two", "2.0.0")));
        let names: Vec<_> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["one", "two"]);
    }

    #[test]
    fn dispatch_contains_hook_errors() {
        struct Exploding;
        impl Plugin for Exploding {
            fn name(&self) -> &str {
                "exploding"
            }
            fn version(&self) -> &str {
                "1.0.0"
            }
            fn on_critical_request_failed(&self) -> std::result::Result<(), BoxError> {
                Err("boom".into())
            }
        }
        let registry = PluginRegistry::default();
        registry.plugins.lock().push(Arc::new(Exploding));
        registry.plugins.lock().push(Arc::new(Named("after", "1.0.0")));
        let mut reached = Vec::new();
        registry.dispatch("on_critical_request_failed", |p| {
            reached.push(p.name().to_owned());
            p.on_critical_request_failed()
        });
        // The failing hook is logged, later plugins still run.
        assert_eq!(reached, ["exploding", "after"]);
    }
}
