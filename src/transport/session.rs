//! Transport boundary
//!
//! The broker client SDK is opaque to the bridge. Everything the core needs
//! from it is captured by two traits: `BrokerTransport` (an initialized SDK
//! that can open sessions) and `BrokerSession` (one session, owned by the
//! connection manager). Asynchronous outcomes come back through the
//! `SessionHandler` the session was created with, usually on a thread the
//! transport owns.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::config::{ApiSettings, SessionProperties};
use crate::utils::TransportError;

/// Caller-assigned id matching a subscribe/unsubscribe request to its
/// confirmation. Fresh for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Transport-assigned token identifying one topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchHandle {
    pub id: String,
    pub topic: String,
}

impl DispatchHandle {
    pub fn new(topic: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
        }
    }
}

/// A message exactly as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub destination: String,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
        }
    }
}

/// Diagnostics attached to every session event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub response_code: i32,
    pub info: Option<String>,
}

impl SessionInfo {
    pub fn new(response_code: i32, info: impl Into<String>) -> Self {
        Self {
            response_code,
            info: Some(info.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    UpNotice(SessionInfo),
    ConnectFailed(SessionInfo),
    Down(SessionInfo),
    Reconnecting(SessionInfo),
    Reconnected(SessionInfo),
    /// Unrecoverable session failure.
    Fatal(SessionInfo),
    SubscriptionOk {
        token: CorrelationToken,
        info: SessionInfo,
    },
    SubscriptionError {
        token: CorrelationToken,
        info: SessionInfo,
    },
}

/// Receives callbacks from a session. Implementations must return quickly;
/// they run on the transport's delivery thread.
pub trait SessionHandler: Send + Sync {
    fn on_session_event(&self, event: SessionEvent);
    fn on_message(&self, message: RawMessage);
}

pub trait BrokerSession: Send + Sync {
    /// Start connecting. An `Err` means the attempt never left the client
    /// (bad properties); otherwise the outcome arrives as a session event.
    fn connect(&self) -> Result<(), TransportError>;

    fn disconnect(&self) -> Result<(), TransportError>;

    fn create_dispatch_target(&self, topic: &str) -> Result<DispatchHandle, TransportError>;

    /// Request a confirmed subscription; confirmed by a `SubscriptionOk` or
    /// `SubscriptionError` carrying `token`.
    fn subscribe(&self, target: &DispatchHandle, token: CorrelationToken)
    -> Result<(), TransportError>;

    /// Request a confirmed unsubscribe; confirmed like `subscribe`.
    fn unsubscribe(
        &self,
        target: &DispatchHandle,
        token: CorrelationToken,
    ) -> Result<(), TransportError>;

    /// Release the session and its context.
    fn dispose(self: Box<Self>);
}

pub trait BrokerTransport: Send + Sync + 'static {
    /// One-time SDK initialization, run by the composition root before any
    /// connection manager exists. Holding a transport value means this
    /// step has happened.
    fn initialize(api: &ApiSettings) -> Result<Self, TransportError>
    where
        Self: Sized;

    /// Create a non-blocking session with topic dispatch enabled.
    fn create_session(
        &self,
        properties: &SessionProperties,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Box<dyn BrokerSession>, TransportError>;
}
