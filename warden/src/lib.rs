//! Resilient HTTP request governance.
//!
//! `warden` sits between application code and an HTTP transport and turns
//! unreliable remote endpoints into a stable programming surface: requests
//! are prioritized through a concurrency-bounded admission queue, failures
//! are classified and retried under a pluggable strategy with backoff,
//! every request carries a cancellation token, terminal failures land in a
//! bounded store for later replay, and cross-cutting concerns (response
//! caching, token refresh, circuit breaking) attach as plugins.
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use http::{Request, Response, Uri};
//! use warden::{Priority, RequestDescriptor, RetryManager, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any tower::Service<Request<Bytes>, Response = Response<Bytes>>
//!     // can serve as the transport.
//!     let transport = Transport::new(tower::service_fn(|_req: Request<Bytes>| async {
//!         Ok::<_, std::convert::Infallible>(Response::new(Bytes::from_static(b"ok")))
//!     }));
//!
//!     let manager = RetryManager::builder()
//!         .retries(3)
//!         .max_concurrent_requests(4)
//!         .build(transport)?;
//!
//!     let request = RequestDescriptor::get(Uri::from_static("https://api.example.com/items"))
//!         .priority(Priority::HIGH)
//!         .header("idempotency-key", "e5fa0d");
//!     match manager.execute(request).await? {
//!         Some(response) => println!("status: {}", response.status()),
//!         None => println!("request gave up quietly"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! For more details, see:
//!
//! - [`RetryManager`] for the orchestrator and its builder
//! - [`plugins`] for the plugin contract and the shipped plugins
//! - [`RequestQueue`](warden_client::RequestQueue) for admission semantics

pub use warden_client::{
    Error, Event, EventPayload, ListenerId, MetricsSnapshot, Plugin, PluginDescriptor,
    RequestLogger, Result, RetryManager, RetryManagerBuilder, TimerStats, Transport,
    REQUEST_CANCELED,
};
pub use warden_core::{
    BackoffKind, DefaultStrategy, Failure, FailureKind, InMemoryStore, Priority,
    RequestDescriptor, RequestId, RequestStore, RetryMode, RetryStrategy, SanitizeOptions,
    StatusRule,
};

/// Pure core types (descriptors, strategy, backoff, store, sanitizer).
pub use warden_core as core;

/// The engine: transport handle, queue, manager, events, metrics.
pub use warden_client as client;

/// The plugin contract and the shipped plugins.
pub mod plugins {
    pub use warden_client::plugins::{
        cache::{CacheOptions, CachePlugin, CacheStats},
        circuit_breaker::{
            BreakerState, BreakerStats, CircuitBreakerOptions, CircuitBreakerPlugin,
            FailureCounting,
        },
        token_refresh::{RefreshHandler, TokenRefreshOptions, TokenRefreshPlugin},
        Plugin, PluginContext, PluginDescriptor, RecoveryDecision,
    };
}
