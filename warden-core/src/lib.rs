//! Core types for the [`warden`](https://crates.io/crates/warden) request-governance layer.
//!
//! This crate contains the pure, I/O-free half of warden: request
//! descriptors and their governance fields, backoff calculators, the
//! retry strategy contract, failure classification, the failed-request
//! store, and log sanitization helpers.
//!
//! Applications normally depend on the `warden` facade crate instead.

pub mod backoff;
pub use backoff::BackoffKind;

pub mod failure;
pub use failure::{Failure, FailureKind};

pub mod request;
pub use request::{Priority, RequestDescriptor, RequestId, RetryMode};

pub mod sanitize;
pub use sanitize::SanitizeOptions;

pub mod store;
pub use store::{InMemoryStore, RequestStore};

pub mod strategy;
pub use strategy::{DefaultStrategy, RetryStrategy, StatusRule};
