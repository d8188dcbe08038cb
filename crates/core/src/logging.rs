use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LoggingConfig};

/// Build the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|error| ConfigError::InvalidValue {
        field: "logging.level".to_string(),
        message: error.to_string(),
    })
}

/// Install the global subscriber. Calling it twice is harmless: the second
/// install is refused and logged at debug level.
pub fn init(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = env_filter(config)?;
    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if let Err(error) = result {
        tracing::debug!(%error, "tracing subscriber already installed");
    }
    Ok(())
}
