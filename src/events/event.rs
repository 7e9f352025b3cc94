//! Connection lifecycle states and the event produced for each transition.

use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Created,
    Opening,
    Opened,
    Reconnecting,
    Reconnected,
    Closing,
    Closed,
    /// Terminal until the process restarts.
    Faulted,
}

impl ConnectionState {
    /// Whether the lifecycle graph allows moving from `self` to `next`.
    ///
    /// Any live state may fault. Teardown requested by the application goes
    /// through `Closing`; a transport "down" may close an open session
    /// directly.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self == Faulted {
            return false;
        }
        if next == Faulted {
            return true;
        }
        matches!(
            (self, next),
            (Created, Opening)
                | (Closed, Opening)
                | (Opening, Opened)
                | (Opening, Closed)
                | (Opening, Closing)
                | (Opened, Closing)
                | (Opened, Closed)
                | (Opened, Reconnecting)
                | (Reconnecting, Reconnected)
                | (Reconnecting, Closed)
                | (Reconnecting, Closing)
                | (Reconnected, Opened)
                | (Reconnected, Closing)
                | (Closing, Closed)
        )
    }

    /// States in which a connect attempt is outstanding or a session is live.
    pub fn is_connect_in_progress(self) -> bool {
        matches!(
            self,
            ConnectionState::Opening
                | ConnectionState::Opened
                | ConnectionState::Reconnecting
                | ConnectionState::Reconnected
        )
    }

    /// States that resolve a pending connect attempt.
    pub fn resolves_connect(self) -> bool {
        matches!(
            self,
            ConnectionState::Opened | ConnectionState::Closed | ConnectionState::Faulted
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One lifecycle transition, as delivered to every observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub info: Option<String>,
    pub response_code: i32,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn new(state: ConnectionState, info: Option<String>, response_code: i32) -> Self {
        Self {
            state,
            info,
            response_code,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection Event: {} ResponseCode: {} Info: {}",
            self.state,
            self.response_code,
            self.info.as_deref().unwrap_or("")
        )
    }
}
