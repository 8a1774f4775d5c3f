//! Debug reporting for the request lifecycle.
//!
//! Everything goes through `tracing`; this type only decides whether
//! debug-level reporting is on and what survives sanitization.

use warden_core::{Failure, RequestDescriptor, SanitizeOptions};

/// Lifecycle logger exposed via the manager.
#[derive(Clone, Debug, Default)]
pub struct RequestLogger {
    debug: bool,
    sanitize: Option<SanitizeOptions>,
}

impl RequestLogger {
    /// Build a logger. `sanitize` of `None` logs request material verbatim.
    pub fn new(debug: bool, sanitize: Option<SanitizeOptions>) -> Self {
        Self { debug, sanitize }
    }

    /// Whether debug-level lifecycle reporting is enabled.
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// The sanitizer in effect, if any.
    pub fn sanitize_options(&self) -> Option<&SanitizeOptions> {
        self.sanitize.as_ref()
    }

    pub(crate) fn lifecycle(&self, descriptor: &RequestDescriptor, note: &str) {
        if !self.debug {
            return;
        }
        match &self.sanitize {
            Some(options) => {
                tracing::debug!(
                    id = %descriptor.id,
                    method = %descriptor.method,
                    uri = %descriptor.uri,
                    attempt = descriptor.attempt,
                    headers = ?options.sanitize_headers(&descriptor.headers),
                    params = ?options.sanitize_params(&descriptor.params),
                    "{note}"
                );
            }
            None => {
                tracing::debug!(
                    id = %descriptor.id,
                    method = %descriptor.method,
                    uri = %descriptor.uri,
                    attempt = descriptor.attempt,
                    headers = ?descriptor.headers,
                    "{note}"
                );
            }
        }
    }

    pub(crate) fn failure(&self, descriptor: &RequestDescriptor, failure: &Failure) {
        tracing::warn!(
            id = %descriptor.id,
            kind = %failure.kind,
            status = ?failure.status,
            attempt = descriptor.attempt,
            "request failed: {}",
            failure.message
        );
    }
}
