//! Error types for svcmesh.
//!
//! `ServiceError` covers both the transport taxonomy (connection, protocol and
//! per-call failures) and the contract violations a caller can run into.
//! Expected per-call outcomes such as a timeout or a lost peer are reported in
//! [`ServiceResponse`](crate::types::ServiceResponse) rather than as `Err`;
//! [`ServiceResponse::into_result`](crate::types::ServiceResponse::into_result)
//! turns them into the matching variant here.

use thiserror::Error;

/// Main error type for svcmesh.
#[derive(Debug, Error)]
pub enum ServiceError {
    // Connection establishment
    #[error("Failed to resolve {address}: {message}")]
    ResolutionFailed { address: String, message: String },

    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed { address: String, message: String },

    #[error(
        "No common protocol version: local supports [{local_min}, {local_max}], remote {remote}"
    )]
    ProtocolVersionMismatch {
        local_min: u8,
        local_max: u8,
        /// Human readable description of what the peer offered.
        remote: String,
    },

    // Protocol violations
    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("Disconnected: {message}")]
    Disconnected { message: String },

    // Per call
    #[error("Call to {method} timed out")]
    Timeout { method: String },

    #[error("Request rejected: {message}")]
    InvalidRequest { message: String },

    #[error("No handler registered for method {method}")]
    HandlerMissing { method: String },

    #[error("Handler for {method} failed: {message}")]
    HandlerFailed { method: String, message: String },

    // IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Contract violations
    #[error("{what} has already been shut down")]
    Closed { what: String },

    #[error("Blocking call issued from an event loop thread; use the async API instead")]
    BlockingOnEventLoop,

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

/// Result type alias for svcmesh operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Config {
            message: format!("Invalid configuration JSON: {}", err),
        }
    }
}

impl ServiceError {
    /// Shorthand for a malformed message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        ServiceError::MalformedMessage {
            message: message.into(),
        }
    }

    /// Shorthand for a disconnected error.
    pub fn disconnected(message: impl Into<String>) -> Self {
        ServiceError::Disconnected {
            message: message.into(),
        }
    }
}

/// Error returned by a method handler.
///
/// Converted into a `HandlerFailed` Response on the wire; the connection stays
/// open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
