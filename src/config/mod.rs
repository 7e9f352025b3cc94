mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    ApiSettings, LoggingSettings, MessageSettings, PollerSettings, SessionProperties, Settings,
    TimeoutSettings,
};

/// Loads the configuration from `config/default` and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Loads the configuration from the given file (any extension the `config`
/// crate understands, optional) and `RTD__SECTION__KEY` environment
/// variables, merged over the defaults.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("RTD")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        session: partial
            .session
            .map(|s| s.merge(default.session.clone()))
            .unwrap_or(default.session),
        api: ApiSettings {
            log_level: partial
                .api
                .and_then(|a| a.log_level)
                .unwrap_or(default.api.log_level),
        },
        timeouts: TimeoutSettings {
            connect_ms: partial
                .timeouts
                .as_ref()
                .and_then(|t| t.connect_ms)
                .unwrap_or(default.timeouts.connect_ms),
            request_ms: partial
                .timeouts
                .as_ref()
                .and_then(|t| t.request_ms)
                .unwrap_or(default.timeouts.request_ms),
        },
        poller: PollerSettings {
            interval_ms: partial
                .poller
                .and_then(|p| p.interval_ms)
                .unwrap_or(default.poller.interval_ms),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
        message: MessageSettings {
            format: partial
                .message
                .and_then(|m| m.format)
                .unwrap_or(default.message.format),
        },
    })
}
