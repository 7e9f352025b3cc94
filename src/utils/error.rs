//! Error types shared across the bridge.
//!
//! Connection-level failures are also broadcast as `ConnectionEvent`s; the
//! variants here are what a caller sees returned from a request.

use std::time::Duration;

use thiserror::Error;

use crate::events::ConnectionState;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Connection properties were refused before any network attempt.
    #[error("invalid connection configuration: {0}")]
    Configuration(String),

    /// The broker refused or dropped the connect attempt.
    #[error("connect failed ({state}), response code {response_code}: {}", info.as_deref().unwrap_or("no details"))]
    TransportConnect {
        state: ConnectionState,
        response_code: i32,
        info: Option<String>,
    },

    #[error("connection already opened or opening")]
    AlreadyInProgress,

    #[error("not connected to the broker")]
    NotConnected,

    #[error("operation not allowed while connection is {0}")]
    InvalidState(ConnectionState),

    #[error("topic must not be empty")]
    InvalidTopic,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Failures reported synchronously by the transport boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport rejected the request (return code {return_code}): {info}")]
    Rejected { return_code: i32, info: String },

    #[error("transport session is closed")]
    SessionClosed,

    #[error("transport initialization failed: {0}")]
    Initialization(String),
}
