//! Failure classification for dispatch outcomes.
//!
//! Classification happens once per failed attempt and the result feeds both
//! the metrics tallies and the retry strategy.

use crate::request::RequestDescriptor;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use std::fmt;

/// Coarse failure buckets surfaced in metrics and consumed by strategies.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No response was received (connect, timeout, broken transport).
    Network,
    /// A 5xx response.
    Server,
    /// A non-success response below 500.
    Client,
    /// The request's cancellation token fired.
    Cancelled,
}

impl FailureKind {
    /// Stable metric key for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Server => "server5xx",
            FailureKind::Client => "client4xx",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified failed attempt, with enough request context for a
/// [`RetryStrategy`](crate::RetryStrategy) to reach a verdict.
#[derive(Clone, Debug)]
pub struct Failure {
    /// Classified bucket.
    pub kind: FailureKind,
    /// Response status, when a response was received at all.
    pub status: Option<StatusCode>,
    /// Method of the failing request, when known.
    pub method: Option<Method>,
    /// Headers of the failing request (idempotency gates read these).
    pub headers: HeaderMap,
    /// Human-readable summary for logs and error messages.
    pub message: String,
}

impl Failure {
    /// Classify a non-success response status.
    pub fn from_status(status: StatusCode, descriptor: &RequestDescriptor) -> Self {
        let kind = if status.is_server_error() {
            FailureKind::Server
        } else {
            FailureKind::Client
        };
        Self {
            kind,
            status: Some(status),
            method: Some(descriptor.method.clone()),
            headers: descriptor.headers.clone(),
            message: format!("{} from {}", status, descriptor.uri),
        }
    }

    /// A transport-level failure with no response.
    pub fn network(message: impl Into<String>, descriptor: &RequestDescriptor) -> Self {
        Self {
            kind: FailureKind::Network,
            status: None,
            method: Some(descriptor.method.clone()),
            headers: descriptor.headers.clone(),
            message: message.into(),
        }
    }

    /// The descriptor's cancellation token fired.
    pub fn cancelled(descriptor: &RequestDescriptor) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            status: None,
            method: Some(descriptor.method.clone()),
            headers: descriptor.headers.clone(),
            message: format!("Request aborted: {}", descriptor.id),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor::get(Uri::from_static("https://example.com/pods"))
    }

    #[test]
    fn status_classification() {
        let d = descriptor();
        assert_eq!(
            Failure::from_status(StatusCode::INTERNAL_SERVER_ERROR, &d).kind,
            FailureKind::Server
        );
        assert_eq!(Failure::from_status(StatusCode::NOT_FOUND, &d).kind, FailureKind::Client);
        assert_eq!(
            Failure::from_status(StatusCode::PERMANENT_REDIRECT, &d).kind,
            FailureKind::Client
        );
    }

    #[test]
    fn network_failures_have_no_status() {
        let f = Failure::network("connection reset", &descriptor());
        assert_eq!(f.kind, FailureKind::Network);
        assert_eq!(f.status, None);
        assert_eq!(f.method, Some(Method::GET));
    }

    #[test]
    fn cancellation_message_names_the_request() {
        let mut d = descriptor();
        d.id = crate::RequestId::new("req-3");
        let f = Failure::cancelled(&d);
        assert_eq!(f.kind, FailureKind::Cancelled);
        assert!(f.message.contains("req-3"));
        assert!(f.message.contains("Request aborted"));
    }

    #[test]
    fn metric_keys_are_stable() {
        assert_eq!(FailureKind::Server.as_str(), "server5xx");
        assert_eq!(FailureKind::Client.as_str(), "client4xx");
    }
}
