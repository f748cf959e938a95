//! Unified crate-level error types.
//!
//! This module provides a single [`RelayError`] type used across the crate and a
//! convenient [`RelayResult`] alias.
//!
//! Propagation policy
//! ------------------
//! - Request-path errors are converted to an HTTP status plus a short diagnostic
//!   body at the handler boundary; `RelayError` never crosses the HTTP surface.
//! - Background population errors terminate only that populate attempt and are
//!   logged, never surfaced to any request.
//!
//! Note: transport-level variants intentionally remain string-based to avoid
//! pulling concrete HTTP client error types into the public API.

use std::io;

/// Result type used by this crate.
pub type RelayResult<T> = Result<T, RelayError>;

/// Unified error type for the `audio-relay` crate.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Missing or malformed request input (query parameter, filename).
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// A `Range` header failed validation.
    #[error("invalid range: {0}")]
    InvalidRange(&'static str),

    /// I/O error.
    ///
    /// Uses the concrete `std::io::Error` to preserve error kinds and sources.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport-level failure reaching the upstream source.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Upstream replied with a non-success status.
    #[error("HTTP error: {status} for {url}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },
}

impl RelayError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        RelayError::Message(msg.into())
    }
}
