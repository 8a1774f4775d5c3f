//! Request descriptors and the governance fields the engine schedules by.

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

/// Stable identifier for one logical request through its whole retry journey.
///
/// Assigned by the manager at submission unless the caller supplied one.
/// Unique among all currently-tracked requests.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap a caller-supplied id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether an id has been assigned yet (empty ids act as "assign for me").
    pub fn is_assigned(&self) -> bool {
        !self.0.is_empty()
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Scheduling priority. Smaller values are more urgent.
///
/// Any `i32` is valid; the four well-known points cover most uses.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Priority(pub i32);

impl Priority {
    /// Jumps every queue; can block non-critical traffic (see the queue docs).
    pub const CRITICAL: Priority = Priority(0);
    /// Above-normal urgency.
    pub const HIGH: Priority = Priority(1);
    /// The default.
    pub const MEDIUM: Priority = Priority(2);
    /// Background traffic.
    pub const LOW: Priority = Priority(3);

    /// Whether this priority is "critical" under the given blocking threshold.
    pub fn is_critical(self, threshold: Priority) -> bool {
        self <= threshold
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether the engine retries failures itself or stores them for later.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetryMode {
    /// Retryable failures are delayed and resubmitted internally.
    #[default]
    Automatic,
    /// Failures go straight to the failed-request store; the application
    /// replays them explicitly via `retry_failed_requests`.
    Manual,
}

/// The in-memory record representing one logical request.
///
/// Descriptors are created at submission, mutated only by the manager (the
/// attempt counter and retry flags) and by `before_retry` hooks (headers,
/// priority), and destroyed at terminal completion or store eviction.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    /// Stable request id; see [`RequestId`].
    pub id: RequestId,
    /// Submission timestamp, unix millis. Stamped by the manager when zero.
    pub submitted_at_ms: u64,
    /// HTTP method.
    pub method: Method,
    /// Target URI.
    pub uri: Uri,
    /// Request headers. `before_retry` hooks may mutate these in place.
    pub headers: HeaderMap,
    /// Request body, buffered so attempts can be replayed.
    pub body: Bytes,
    /// Query parameters appended to the URI at dispatch.
    pub params: Vec<(String, String)>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Per-request override of the engine's retry mode.
    pub mode: Option<RetryMode>,
    /// Per-request override of the manager's default max retries.
    pub max_retries: Option<u32>,
    /// Attempts dispatched so far. Monotonically non-decreasing.
    pub attempt: u32,
    /// Set once the first retry of this descriptor begins.
    pub in_retry: bool,
    /// Set when a token-refresh recovery resubmitted this request, so a
    /// second authorization failure is not refreshed again.
    pub in_token_refresh_retry: bool,
}

impl RequestDescriptor {
    /// Create a descriptor with default governance fields.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            id: RequestId::default(),
            submitted_at_ms: 0,
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: Vec::new(),
            priority: Priority::default(),
            mode: None,
            max_retries: None,
            attempt: 0,
            in_retry: false,
            in_token_refresh_retry: false,
        }
    }

    /// Shorthand for a GET descriptor.
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Override the request id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = RequestId::new(id);
        self
    }

    /// Set the scheduling priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry mode for this request only.
    #[must_use]
    pub fn mode(mut self, mode: RetryMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Override the manager's default max retries for this request.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// Set the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Insert a header, replacing any previous value.
    ///
    /// # Panics
    /// Panics if the name or value is invalid; use `headers` directly for
    /// fallible insertion.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name: http::header::HeaderName = name.parse().expect("valid header name");
        let value: http::header::HeaderValue = value.parse().expect("valid header value");
        self.headers.insert(name, value);
        self
    }

    /// Effective max retries given the manager default.
    pub fn effective_max_retries(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    /// Effective retry mode given the manager default.
    pub fn effective_mode(&self, default: RetryMode) -> RetryMode {
        self.mode.unwrap_or(default)
    }

    /// Stamp submission metadata. Keeps caller-supplied values when present.
    pub fn stamp(&mut self, id: RequestId) {
        if !self.id.is_assigned() {
            self.id = id;
        }
        if self.submitted_at_ms == 0 {
            self.submitted_at_ms = unix_millis();
        }
    }
}

/// Milliseconds since the unix epoch; the submission-timestamp clock.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
