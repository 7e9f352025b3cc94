use std::time::Duration;

use serde::Deserialize;

use crate::message::BodyFormat;
use crate::utils::{BridgeError, Result};

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Settings {
    pub session: SessionProperties,
    pub api: ApiSettings,
    pub timeouts: TimeoutSettings,
    pub poller: PollerSettings,
    pub logging: LoggingSettings,
    pub message: MessageSettings,
}

/// Connection properties handed to the transport when a session is created.
///
/// Retry counts follow the usual client SDK convention: `-1` retries forever.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionProperties {
    pub host: String,
    pub username: String,
    pub password: String,
    pub vpn: String,
    pub client_name: String,
    pub reconnect_retries: i32,
    pub connect_retries: i32,
    pub connect_retries_per_host: i32,
    pub reconnect_retries_wait_ms: u64,
    pub reapply_subscriptions: bool,
}

impl SessionProperties {
    /// Reject properties no transport could act on.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::Configuration("host must not be empty".into()));
        }
        if self.client_name.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "client_name must not be empty".into(),
            ));
        }
        for (name, value) in [
            ("reconnect_retries", self.reconnect_retries),
            ("connect_retries", self.connect_retries),
            ("connect_retries_per_host", self.connect_retries_per_host),
        ] {
            if value < -1 {
                return Err(BridgeError::Configuration(format!(
                    "{name} must be -1 or greater, got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for SessionProperties {
    fn default() -> Self {
        Self {
            host: "tcp://127.0.0.1:55555".to_string(),
            username: "default".to_string(),
            password: String::new(),
            vpn: "default".to_string(),
            client_name: "rtd-bridge".to_string(),
            reconnect_retries: 3,
            connect_retries: 1,
            connect_retries_per_host: 5,
            reconnect_retries_wait_ms: 3000,
            reapply_subscriptions: true,
        }
    }
}

/// Settings for the broker client SDK itself.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub log_level: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            log_level: "notice".to_string(),
        }
    }
}

/// Upper bounds on the suspending requests.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub connect_ms: u64,
    pub request_ms: u64,
}

impl TimeoutSettings {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            request_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval_ms: u64,
}

impl PollerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct MessageSettings {
    pub format: BodyFormat,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub session: Option<PartialSessionProperties>,
    pub api: Option<PartialApiSettings>,
    pub timeouts: Option<PartialTimeoutSettings>,
    pub poller: Option<PartialPollerSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub message: Option<PartialMessageSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSessionProperties {
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub vpn: Option<String>,
    pub client_name: Option<String>,
    pub reconnect_retries: Option<i32>,
    pub connect_retries: Option<i32>,
    pub connect_retries_per_host: Option<i32>,
    pub reconnect_retries_wait_ms: Option<u64>,
    pub reapply_subscriptions: Option<bool>,
}

impl PartialSessionProperties {
    pub fn merge(self, default: SessionProperties) -> SessionProperties {
        SessionProperties {
            host: self.host.unwrap_or(default.host),
            username: self.username.unwrap_or(default.username),
            password: self.password.unwrap_or(default.password),
            vpn: self.vpn.unwrap_or(default.vpn),
            client_name: self.client_name.unwrap_or(default.client_name),
            reconnect_retries: self.reconnect_retries.unwrap_or(default.reconnect_retries),
            connect_retries: self.connect_retries.unwrap_or(default.connect_retries),
            connect_retries_per_host: self
                .connect_retries_per_host
                .unwrap_or(default.connect_retries_per_host),
            reconnect_retries_wait_ms: self
                .reconnect_retries_wait_ms
                .unwrap_or(default.reconnect_retries_wait_ms),
            reapply_subscriptions: self
                .reapply_subscriptions
                .unwrap_or(default.reapply_subscriptions),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialApiSettings {
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTimeoutSettings {
    pub connect_ms: Option<u64>,
    pub request_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPollerSettings {
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialMessageSettings {
    pub format: Option<BodyFormat>,
}
