//! Unified error types for the subscription manager core.

use thiserror::Error;

use crate::transport::TransportError;

/// Top-level error type surfaced to callers and, in most cases, routed
/// through the `onError` handler instead of propagated.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Rate limiter could not grant a connect permit.
    #[error("rate limiter error: {0}")]
    RateLimiter(#[from] LimiterError),

    /// Socket-level transport or protocol error.
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// Caller invoked an operation before satisfying its precondition
    /// (e.g. `connect_user_socket` before `set_user_handlers`).
    #[error("misuse: {0}")]
    Misuse(String),
}

/// Errors produced while scheduling a connect attempt through the limiter.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The limiter's internal quota state could not grant a permit.
    #[error("rate limiter could not grant a permit: {0}")]
    QuotaExceeded(String),
}

/// Errors produced by a group or user socket.
#[derive(Error, Debug)]
pub enum SocketError {
    /// Transport failed to open.
    #[error("connect failed: {0}")]
    ConnectFailed(#[from] TransportError),

    /// The transport reported an error after a successful open. A clean
    /// close is not an error — it is surfaced via `onWSClose` instead,
    /// carrying its own code and reason.
    #[error("transport error: {0}")]
    TransportFailed(String),

    /// An inbound text frame failed to parse as JSON. Carries the raw
    /// payload alongside the parse failure.
    #[error("failed to parse inbound frame ({source}): {raw}")]
    ParseError {
        /// The frame text that failed to parse.
        raw: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Failed to send a frame (subscription or ping) on an open transport.
    #[error("failed to send frame: {0}")]
    SendFailed(String),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
