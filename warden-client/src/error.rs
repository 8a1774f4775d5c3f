//! Error handling in [`warden-client`][crate].
use std::time::Duration;
use thiserror::Error;
use warden_core::{Failure, RequestDescriptor, RequestId};

/// Stable machine-readable code attached to cancellation rejections.
pub const REQUEST_CANCELED: &str = "REQUEST_CANCELED";

/// Possible errors from the request-governance engine.
#[derive(Error, Debug)]
pub enum Error {
    /// The waiting list is at capacity.
    ///
    /// Surfaces synchronously from submission; the rejected request is never
    /// queued and never retried. The descriptor is returned to the caller.
    #[error("queue full: rejected {} {}", descriptor.method, descriptor.uri)]
    QueueFull {
        /// The descriptor that was rejected.
        descriptor: Box<RequestDescriptor>,
    },

    /// The request was cancelled before it could complete.
    ///
    /// Carries the stable [`REQUEST_CANCELED`] code so callers can match on
    /// it without parsing the message.
    #[error("REQUEST_CANCELED: Request aborted: {id}")]
    Cancelled {
        /// Id of the cancelled request.
        id: RequestId,
    },

    /// Terminal failure after the strategy declined (or exhausted) retries.
    ///
    /// The classified transport failure is preserved, augmented with the
    /// request id and the attempt that produced it, so the same id appears
    /// in error metadata across every attempt of one submission.
    #[error("request {id} failed on attempt {attempt}: {failure}")]
    Failed {
        /// Id of the failing request.
        id: RequestId,
        /// Attempt number that produced the terminal failure.
        attempt: u32,
        /// The classified failure.
        failure: Failure,
    },

    /// Transport or middleware plumbing error.
    #[error("ServiceError: {0}")]
    Service(#[source] tower::BoxError),

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A plugin name was empty or already registered.
    #[error("plugin rejected: {0}")]
    PluginRejected(String),

    /// A plugin version did not match `MAJOR.MINOR.PATCH`.
    #[error("plugin {name} has malformed version {version:?}")]
    PluginVersion {
        /// Offending plugin name.
        name: String,
        /// The version string as supplied.
        version: String,
    },

    /// A plugin's `initialize` failed; registration was rolled back.
    #[error("plugin {name} failed to initialize: {source}")]
    PluginInit {
        /// Offending plugin name.
        name: String,
        /// The error returned by the plugin.
        #[source]
        source: tower::BoxError,
    },

    /// The token-refresh flow hit its per-attempt timeout on every attempt.
    #[error("token refresh timed out after {0:?}")]
    TokenRefreshTimeout(Duration),

    /// Token refresh was required but no handler is configured.
    #[error("no token refresh handler configured")]
    NoTokenRefreshHandler,
}

impl Error {
    /// Whether this is a cancellation rejection.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// Convenience alias for `Result<T, warden_client::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
