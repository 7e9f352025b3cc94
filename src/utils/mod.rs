//! The `utils` module provides the pieces shared by every other module:
//! the crate error types and logging setup.

pub mod error;
pub mod logging;

pub use error::{BridgeError, Result, TransportError};

#[cfg(test)]
mod tests {
    use super::error::{BridgeError, TransportError};
    use super::logging;
    use crate::events::ConnectionState;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn transport_connect_error_mentions_state_and_code() {
        let err = BridgeError::TransportConnect {
            state: ConnectionState::Closed,
            response_code: 503,
            info: Some("service unavailable".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("Closed"));
        assert!(text.contains("503"));
        assert!(text.contains("service unavailable"));
    }

    #[test]
    fn transport_error_converts_into_bridge_error() {
        let err: BridgeError = TransportError::SessionClosed.into();
        assert!(matches!(
            err,
            BridgeError::Transport(TransportError::SessionClosed)
        ));
    }
}
