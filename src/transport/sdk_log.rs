//! Routes broker SDK log output into `tracing`.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SdkLogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    #[default]
    Notice,
    Info,
    Debug,
}

impl FromStr for SdkLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "emergency" => Ok(Self::Emergency),
            "alert" => Ok(Self::Alert),
            "critical" => Ok(Self::Critical),
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "notice" => Ok(Self::Notice),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown SDK log level '{other}'")),
        }
    }
}

impl fmt::Display for SdkLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl SdkLogLevel {
    /// Parse a configured level, falling back to `Notice`.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_else(|e: String| {
            error!("{e} - defaulting SDK log level to Notice");
            Self::Notice
        })
    }
}

/// Emit one SDK log line through `tracing`.
///
/// Emergency and Alert have no counterpart and are dropped.
pub fn forward_sdk_log(level: SdkLogLevel, message: &str) {
    match level {
        SdkLogLevel::Critical | SdkLogLevel::Error => error!(target: "broker_sdk", "{message}"),
        SdkLogLevel::Warning => warn!(target: "broker_sdk", "{message}"),
        SdkLogLevel::Notice => info!(target: "broker_sdk", "{message}"),
        SdkLogLevel::Info => trace!(target: "broker_sdk", "{message}"),
        SdkLogLevel::Debug => debug!(target: "broker_sdk", "{message}"),
        SdkLogLevel::Emergency | SdkLogLevel::Alert => {}
    }
}
