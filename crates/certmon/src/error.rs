//! Error types for certificate monitoring.
//!
//! None of these are fatal to the renewal loop. They are logged and mapped to
//! state transitions; only construction-time errors reach the caller.

use std::time::Duration;
use thiserror::Error;

/// Result type for certificate monitor operations.
pub type CertMonitorResult<T> = Result<T, CertMonitorError>;

/// Top-level certificate monitor errors
#[derive(Debug, Error)]
pub enum CertMonitorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Issue(#[from] IssueError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("renewal loop terminated abnormally: {0}")]
    Terminated(String),
}

/// Errors building a certificate value from PEM or DER material.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("no leaf certificate found")]
    MissingLeaf,

    #[error("no private key found")]
    MissingKey,

    #[error("invalid X.509 certificate: {0}")]
    X509(String),

    #[error("invalid validity window: not_before {not_before} is after not_after {not_after}")]
    InvalidValidity { not_before: i64, not_after: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the caching layer a watcher subscribes to.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("cache fetch failed: {0}")]
    Fetch(String),

    #[error("watch closed")]
    Closed,

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Errors from a fallback issuance attempt.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("issuance backend error: {0}")]
    Backend(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("issuance request unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid issuance response: {0}")]
    InvalidResponse(String),

    #[error("issuance timed out after {0:?}")]
    Timeout(Duration),

    #[error("issuance cancelled")]
    Cancelled,

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Errors installing a certificate into the TLS configuration.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("invalid trust chain: {0}")]
    InvalidChain(String),

    #[error("refusing to publish expired certificate (not_after {not_after})")]
    Expired { not_after: String },

    #[error("TLS configuration rejected identity: {0}")]
    Rejected(String),
}
