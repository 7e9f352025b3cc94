//! The `transport` module is the boundary to the broker client SDK.
//!
//! It defines the traits the connection core drives (`BrokerTransport`,
//! `BrokerSession`), the callbacks a session delivers (`SessionHandler`,
//! `SessionEvent`, `RawMessage`), SDK log forwarding, and an in-process
//! loopback broker implementing the boundary.

pub mod loopback;
pub mod sdk_log;
pub mod session;

pub use loopback::{
    ConnectBehavior, LoopbackBroker, LoopbackStats, LoopbackTransport, SubscribeBehavior,
    topic_matches,
};
pub use sdk_log::{SdkLogLevel, forward_sdk_log};
pub use session::{
    BrokerSession, BrokerTransport, CorrelationToken, DispatchHandle, RawMessage, SessionEvent,
    SessionHandler, SessionInfo,
};
