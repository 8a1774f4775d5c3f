//! Token-refresh plugin: turns authorization failures into a single global
//! refresh flow and resumes every affected request with the new token.

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::header::{HeaderName, AUTHORIZATION};
use parking_lot::RwLock;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tower::BoxError;
use warden_core::{Failure, RequestDescriptor};

use super::{Plugin, PluginContext, RecoveryDecision};
use crate::error::Error;

/// Application-supplied refresh routine: yields a fresh token string.
pub type RefreshHandler =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, BoxError>> + Send + Sync>;

/// Refresh flow knobs.
#[derive(Clone, Debug)]
pub struct TokenRefreshOptions {
    /// Response statuses that trigger a refresh.
    pub refresh_statuses: Vec<u16>,
    /// How many refresh attempts before giving up.
    pub max_attempts: u32,
    /// Per-attempt timeout.
    pub attempt_timeout: Duration,
    /// Header the token is injected into.
    pub header: HeaderName,
    /// Credential scheme prefixed to the token.
    pub scheme: String,
}

impl Default for TokenRefreshOptions {
    fn default() -> Self {
        Self {
            refresh_statuses: vec![401],
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            header: AUTHORIZATION,
            scheme: "Bearer".into(),
        }
    }
}

/// The refresh plugin. Register via
/// [`RetryManager::use_plugin`](crate::RetryManager::use_plugin).
pub struct TokenRefreshPlugin {
    options: TokenRefreshOptions,
    handler: Option<RefreshHandler>,
    token: RwLock<Option<String>>,
    // Generation bumps on every successful refresh. A failing request that
    // waited out someone else's refresh sees the bump and skips its own.
    generation: AtomicU64,
    flow: tokio::sync::Mutex<()>,
}

impl TokenRefreshPlugin {
    /// Build the plugin with a refresh handler.
    pub fn new(options: TokenRefreshOptions, handler: RefreshHandler) -> Self {
        Self {
            options,
            handler: Some(handler),
            token: RwLock::new(None),
            generation: AtomicU64::new(0),
            flow: tokio::sync::Mutex::new(()),
        }
    }

    /// Build the plugin without a handler; any triggered refresh fails with
    /// [`Error::NoTokenRefreshHandler`].
    pub fn without_handler(options: TokenRefreshOptions) -> Self {
        Self {
            options,
            handler: None,
            token: RwLock::new(None),
            generation: AtomicU64::new(0),
            flow: tokio::sync::Mutex::new(()),
        }
    }

    /// Seed the current token (e.g. from an existing session).
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// The token currently injected into requests.
    pub fn current_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn header_value(&self, token: &str) -> Option<http::HeaderValue> {
        format!("{} {}", self.options.scheme, token).parse().ok()
    }

    fn triggers_on(&self, failure: &Failure) -> bool {
        failure
            .status
            .is_some_and(|s| self.options.refresh_statuses.contains(&s.as_u16()))
    }

    /// Run (or wait out) the single-flight refresh and return a live token.
    async fn refresh(&self, ctx: &PluginContext<'_>) -> Result<String, Error> {
        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.flow.lock().await;
        if self.generation.load(Ordering::SeqCst) != observed {
            // Someone else refreshed while we queued on the flow; reuse it.
            if let Some(token) = self.current_token() {
                return Ok(token);
            }
        }
        let Some(handler) = &self.handler else {
            ctx.emit_token_refresh_failed();
            return Err(Error::NoTokenRefreshHandler);
        };
        ctx.emit_before_token_refresh();
        for attempt in 1..=self.options.max_attempts {
            match tokio::time::timeout(self.options.attempt_timeout, handler()).await {
                Ok(Ok(token)) => {
                    *self.token.write() = Some(token.clone());
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    ctx.emit_token_refreshed(&token);
                    return Ok(token);
                }
                Ok(Err(error)) => {
                    tracing::warn!(attempt, %error, "token refresh attempt failed");
                }
                Err(_) => {
                    tracing::warn!(attempt, timeout = ?self.options.attempt_timeout, "token refresh attempt timed out");
                }
            }
        }
        ctx.emit_token_refresh_failed();
        Err(Error::TokenRefreshTimeout(self.options.attempt_timeout))
    }
}

#[async_trait]
impl Plugin for TokenRefreshPlugin {
    fn name(&self) -> &str {
        "token-refresh"
    }

    fn version(&self) -> &str {
        "1.2.0"
    }

    async fn before_dispatch(
        &self,
        _ctx: &PluginContext<'_>,
        descriptor: &mut RequestDescriptor,
    ) -> Result<Option<http::Response<bytes::Bytes>>, Failure> {
        // Inject the current token where the caller did not set one.
        if !descriptor.headers.contains_key(&self.options.header) {
            if let Some(token) = self.current_token() {
                if let Some(value) = self.header_value(&token) {
                    descriptor.headers.insert(self.options.header.clone(), value);
                }
            }
        }
        Ok(None)
    }

    async fn recover(
        &self,
        ctx: &PluginContext<'_>,
        descriptor: &mut RequestDescriptor,
        failure: &Failure,
    ) -> RecoveryDecision {
        if !self.triggers_on(failure) {
            return RecoveryDecision::Continue;
        }
        if descriptor.in_token_refresh_retry {
            // Already resumed with a fresh token once; do not loop.
            return RecoveryDecision::Continue;
        }
        match self.refresh(ctx).await {
            Ok(token) => match self.header_value(&token) {
                Some(value) => {
                    descriptor.headers.insert(self.options.header.clone(), value);
                    descriptor.in_token_refresh_retry = true;
                    RecoveryDecision::RetryNow
                }
                None => RecoveryDecision::Continue,
            },
            Err(error) => RecoveryDecision::Fail(error),
        }
    }
}
