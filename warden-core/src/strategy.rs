//! Retry strategy: the pluggable predicate + delay selector.

use crate::{
    backoff::{self, BackoffKind},
    failure::{Failure, FailureKind},
};
use http::{header::HeaderName, Method, StatusCode};
use std::time::Duration;

/// A retryable status code, either a single value or an inclusive range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusRule {
    /// Exactly this status.
    Single(u16),
    /// Any status in `start..=end`.
    Range(u16, u16),
}

impl StatusRule {
    fn matches(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        match *self {
            StatusRule::Single(s) => code == s,
            StatusRule::Range(start, end) => (start..=end).contains(&code),
        }
    }
}

/// Decides whether a failed attempt is retried, and after how long.
///
/// Strategies are pure: no calls here may block or perform I/O. Plugins may
/// supply a replacement implementation at manager construction.
pub trait RetryStrategy: Send + Sync {
    /// Whether this failure is retryable at all, ignoring attempt budgets.
    fn is_retryable(&self, failure: &Failure) -> bool;

    /// Whether to retry: inside the attempt budget and retryable.
    fn should_retry(&self, failure: &Failure, attempt: u32, max: u32) -> bool {
        attempt <= max && self.is_retryable(failure)
    }

    /// Delay before dispatching `attempt`.
    fn delay(&self, attempt: u32, _max: u32, kind: BackoffKind) -> Duration {
        backoff::delay(kind, attempt)
    }
}

/// The built-in strategy.
///
/// A failure is retryable when the request method is in the retryable list
/// (or the request carries a non-empty idempotency header) and either no
/// response was received or the status matches the retryable set.
#[derive(Clone, Debug)]
pub struct DefaultStrategy {
    /// Retryable response statuses.
    pub retry_statuses: Vec<StatusRule>,
    /// Methods retried without further qualification.
    pub retry_methods: Vec<Method>,
    /// Backoff kind used by [`RetryStrategy::delay`] callers by default.
    pub backoff: BackoffKind,
    /// Headers whose presence marks a request as idempotent.
    pub idempotency_headers: Vec<HeaderName>,
}

impl Default for DefaultStrategy {
    fn default() -> Self {
        Self {
            retry_statuses: vec![
                StatusRule::Single(408),
                StatusRule::Single(429),
                StatusRule::Range(500, 599),
            ],
            retry_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS],
            backoff: BackoffKind::Exponential,
            idempotency_headers: vec![
                HeaderName::from_static("idempotency-key"),
                HeaderName::from_static("x-idempotency-key"),
            ],
        }
    }
}

impl DefaultStrategy {
    fn method_qualifies(&self, failure: &Failure) -> bool {
        let Some(method) = &failure.method else {
            return false;
        };
        if self.retry_methods.contains(method) {
            return true;
        }
        // Unsafe methods still qualify when the caller marked the request
        // idempotent via a non-empty idempotency header.
        self.idempotency_headers.iter().any(|name| {
            failure
                .headers
                .get(name)
                .is_some_and(|v| !v.as_bytes().is_empty())
        })
    }
}

impl RetryStrategy for DefaultStrategy {
    fn is_retryable(&self, failure: &Failure) -> bool {
        if failure.kind == FailureKind::Cancelled || !self.method_qualifies(failure) {
            return false;
        }
        match failure.status {
            // No response at all: retryable for qualifying methods.
            None => true,
            Some(status) => self.retry_statuses.iter().any(|r| r.matches(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestDescriptor;
    use http::Uri;

    fn failure(method: Method, status: Option<u16>) -> Failure {
        let mut d = RequestDescriptor::new(method, Uri::from_static("https://example.com/x"));
        d.id = crate::RequestId::new("req-1");
        match status {
            Some(s) => Failure::from_status(StatusCode::from_u16(s).unwrap(), &d),
            None => Failure::network("connect error", &d),
        }
    }

    #[test]
    fn retryable_method_and_status() {
        let s = DefaultStrategy::default();
        assert!(s.is_retryable(&failure(Method::GET, Some(500))));
        assert!(s.is_retryable(&failure(Method::GET, Some(429))));
        assert!(s.is_retryable(&failure(Method::HEAD, Some(503))));
        assert!(!s.is_retryable(&failure(Method::GET, Some(404))));
    }

    #[test]
    fn network_errors_retry_for_qualifying_methods_only() {
        let s = DefaultStrategy::default();
        assert!(s.is_retryable(&failure(Method::GET, None)));
        assert!(!s.is_retryable(&failure(Method::POST, None)));
    }

    #[test]
    fn idempotency_header_qualifies_unsafe_methods() {
        let s = DefaultStrategy::default();
        let mut d = RequestDescriptor::new(Method::POST, Uri::from_static("https://example.com/x"));
        d.headers
            .insert("idempotency-key", "abc-123".parse().unwrap());
        let f = Failure::from_status(StatusCode::SERVICE_UNAVAILABLE, &d);
        assert!(s.is_retryable(&f));

        // Empty values do not count.
        d.headers.insert("idempotency-key", "".parse().unwrap());
        let f = Failure::from_status(StatusCode::SERVICE_UNAVAILABLE, &d);
        assert!(!s.is_retryable(&f));
    }

    #[test]
    fn missing_method_is_never_retryable() {
        let s = DefaultStrategy::default();
        let mut f = failure(Method::GET, Some(500));
        f.method = None;
        assert!(!s.is_retryable(&f));
    }

    #[test]
    fn cancellation_is_never_retryable() {
        let s = DefaultStrategy::default();
        let d = RequestDescriptor::get(Uri::from_static("https://example.com/x"));
        assert!(!s.is_retryable(&Failure::cancelled(&d)));
    }

    #[test]
    fn should_retry_respects_the_budget() {
        let s = DefaultStrategy::default();
        let f = failure(Method::GET, Some(500));
        assert!(s.should_retry(&f, 1, 3));
        assert!(s.should_retry(&f, 3, 3));
        assert!(!s.should_retry(&f, 4, 3));
    }

    #[test]
    fn delay_delegates_to_backoff() {
        let s = DefaultStrategy::default();
        assert_eq!(
            s.delay(2, 5, BackoffKind::Linear),
            Duration::from_millis(2000)
        );
        assert_eq!(s.delay(0, 5, BackoffKind::Static), Duration::ZERO);
    }

    #[test]
    fn status_rules_match_inclusively() {
        assert!(StatusRule::Range(500, 599).matches(StatusCode::from_u16(599).unwrap()));
        assert!(StatusRule::Range(500, 599).matches(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!StatusRule::Range(500, 599).matches(StatusCode::BAD_REQUEST));
        assert!(StatusRule::Single(408).matches(StatusCode::REQUEST_TIMEOUT));
    }
}
