//! The transport handle the engine dispatches through.
//!
//! The engine treats HTTP as a function `send(request) -> response | error`
//! behind a [`tower::Service`] seam; anything satisfying the bound plugs in
//! (a real connector, a mock, another middleware stack).

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::{Request, Response};
use tower::{buffer::Buffer, util::BoxService, BoxError, Service, ServiceExt};

use crate::error::{Error, Result};

type TransportFuture = Pin<Box<dyn Future<Output = Result<Response<Bytes>, BoxError>> + Send>>;

/// Clone-cheap handle around a buffered, boxed transport service.
///
/// Requests and responses carry fully-buffered [`Bytes`] bodies so that
/// failed attempts can be replayed without body-stream gymnastics.
#[derive(Clone)]
pub struct Transport {
    // - `Buffer` for cheap clone
    // - `BoxService` for dynamic response future type
    inner: Buffer<Request<Bytes>, TransportFuture>,
}

impl Transport {
    /// Wrap a custom `Service` stack.
    ///
    /// Must run inside a tokio runtime (the buffer worker is spawned here).
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use bytes::Bytes;
    /// use http::{Request, Response};
    /// use warden_client::Transport;
    ///
    /// let service = tower::service_fn(|_req: Request<Bytes>| async {
    ///     Ok::<_, std::convert::Infallible>(Response::new(Bytes::from_static(b"ok")))
    /// });
    /// let transport = Transport::new(service);
    /// ```
    pub fn new<S>(service: S) -> Self
    where
        S: Service<Request<Bytes>, Response = Response<Bytes>> + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
    {
        Self {
            inner: Buffer::new(BoxService::new(service.map_err(Into::into)), 1024),
        }
    }

    /// Perform one request and return the raw response.
    ///
    /// Non-success statuses are *not* errors here; classification is the
    /// caller's concern. Cancellation is propagated by dropping the returned
    /// future.
    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let mut svc = self.inner.clone();
        let res = svc
            .ready()
            .await
            .map_err(Error::Service)?
            .call(request)
            .await
            .map_err(|err| {
                // Engine error decorating the request
                err.downcast::<Error>()
                    .map(|e| *e)
                    // Error from the transport or another middleware
                    .unwrap_or_else(Error::Service)
            })?;
        Ok(res)
    }
}
