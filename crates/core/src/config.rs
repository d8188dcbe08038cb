//! TOML configuration: accounts, logging, the event bus and per-protocol
//! settings. Two environment variables override file values:
//! `PURPLE_LOG_LEVEL` and `PURPLE_CAPS_CACHE`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::account::Setting;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config syntax error at {line}:{column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("config is missing {}", fields.join(", "))]
    MissingRequiredFields { fields: Vec<String> },

    #[error("{field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("cannot access config file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    pub logging: LoggingConfig,
    pub event_bus: EventBusConfig,
    pub xmpp: XmppConfig,
    pub gg: GgConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub protocol: String,
    pub password: Option<String>,
    #[serde(default = "yes")]
    pub remember_password: bool,
    #[serde(default)]
    pub settings: BTreeMap<String, Setting>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::event::BroadcastEventBus::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XmppConfig {
    /// Where the entity-capabilities cache is persisted.
    pub caps_cache_path: Option<PathBuf>,
    pub keepalive_interval_secs: u64,
    pub default_resource: String,
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self {
            caps_cache_path: None,
            keepalive_interval_secs: 120,
            default_resource: "purple".into(),
        }
    }
}

impl XmppConfig {
    pub fn resolved_caps_cache_path(&self) -> PathBuf {
        match &self.caps_cache_path {
            Some(path) => path.clone(),
            None => data_dir().join("xmpp-caps.xml"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GgConfig {
    pub api_base: String,
    pub avatar_base: String,
    pub keepalive_interval_secs: u64,
}

impl Default for GgConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.gadu-gadu.pl".into(),
            avatar_base: "http://avatars.gg.pl".into(),
            keepalive_interval_secs: 60,
        }
    }
}

/// Values taken from the environment, applied on top of the file.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub log_level: Option<String>,
    pub caps_cache_path: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            log_level: std::env::var("PURPLE_LOG_LEVEL").ok(),
            caps_cache_path: std::env::var_os("PURPLE_CAPS_CACHE").map(PathBuf::from),
        }
    }

    fn apply(self, config: &mut Config) {
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(path) = self.caps_cache_path {
            config.xmpp.caps_cache_path = Some(path);
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const STARTER_CONFIG: &str = r#"# Accounts look like:
#
# [[accounts]]
# username = "juliet@capulet.lit"
# protocol = "xmpp"
#
# [[accounts]]
# username = "123456"
# protocol = "gg"

[logging]
level = "info"

[xmpp]
default_resource = "purple"
"#;

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("im", "purple", "purple")
}

/// Platform location of `config.toml`.
pub fn config_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Platform data directory for caches and persisted state.
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 1-based line and column of a byte offset.
fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.len() - before.rfind('\n').map_or(0, |nl| nl + 1) + 1;
    (line, column)
}

impl Config {
    /// Read the platform config file, writing a starter file if there is none.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_file(&config_path(), EnvOverrides::from_env())
    }

    pub fn from_file(path: &Path, overrides: EnvOverrides) -> Result<Self, ConfigError> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(path, STARTER_CONFIG)?;
                tracing::info!(path = %path.display(), "wrote starter config");
                STARTER_CONFIG.to_string()
            }
            Err(error) => return Err(error.into()),
        };
        Self::from_toml(&source, overrides)
    }

    pub fn from_toml(source: &str, overrides: EnvOverrides) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(source).map_err(|error| {
            let (line, column) = error
                .span()
                .map_or((0, 0), |span| position(source, span.start));
            ConfigError::InvalidToml {
                line,
                column,
                message: error.message().to_string(),
            }
        })?;
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields: Vec<String> = self
            .accounts
            .iter()
            .enumerate()
            .flat_map(|(i, account)| {
                [
                    account.username.is_empty().then(|| format!("accounts[{i}].username")),
                    account.protocol.is_empty().then(|| format!("accounts[{i}].protocol")),
                ]
            })
            .flatten()
            .collect();
        if !fields.is_empty() {
            return Err(ConfigError::MissingRequiredFields { fields });
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self
            .accounts
            .iter()
            .find(|a| !seen.insert((a.protocol.as_str(), a.username.as_str())))
        {
            return Err(invalid("accounts", format!("{} is listed twice", dup.username)));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid(
                "logging.level",
                format!("expected one of {}", LOG_LEVELS.join("/")),
            ));
        }
        if self.event_bus.channel_capacity == 0 {
            return Err(invalid("event_bus.channel_capacity", "must be positive"));
        }
        if self.xmpp.keepalive_interval_secs == 0 {
            return Err(invalid("xmpp.keepalive_interval_secs", "must be positive"));
        }
        if self.gg.keepalive_interval_secs == 0 {
            return Err(invalid("gg.keepalive_interval_secs", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}
