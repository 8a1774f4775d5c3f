//! Request-governance engine for HTTP clients.
//!
//! `warden-client` turns an unreliable transport into a governed surface:
//! submissions flow through a priority admission queue bounded by a
//! concurrency cap, failures are classified and retried under a pluggable
//! strategy, every request carries a cancellation token, and cross-cutting
//! concerns (caching, token refresh, circuit breaking) attach as plugins
//! without touching the core.
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use http::{Request, Response, Uri};
//! use warden_client::{RetryManager, Transport};
//! use warden_core::{Priority, RequestDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any tower::Service<Request<Bytes>, Response = Response<Bytes>> works
//!     // as a transport; hook up a real connector stack here.
//!     let transport = Transport::new(tower::service_fn(|_req: Request<Bytes>| async {
//!         Ok::<_, std::convert::Infallible>(Response::new(Bytes::from_static(b"ok")))
//!     }));
//!
//!     let manager = RetryManager::builder()
//!         .retries(3)
//!         .max_concurrent_requests(4)
//!         .build(transport)?;
//!
//!     let request = RequestDescriptor::get(Uri::from_static("https://api.example.com/health"))
//!         .priority(Priority::HIGH);
//!     let response = manager.execute(request).await?;
//!     println!("status: {:?}", response.map(|r| r.status()));
//!     Ok(())
//! }
//! ```

mod error;
pub use error::{Error, Result, REQUEST_CANCELED};

pub mod events;
pub use events::{Event, EventPayload, ListenerId, Listeners};

pub mod log;
pub use log::RequestLogger;

pub mod manager;
pub use manager::{RetryManager, RetryManagerBuilder};

pub mod metrics;
pub use metrics::{Metrics, MetricsSnapshot, TimerStats};

pub mod plugins;
pub use plugins::{Plugin, PluginDescriptor, RecoveryDecision};

pub mod queue;
pub use queue::{Admission, QueueOptions, RequestQueue};

mod transport;
pub use transport::Transport;
