use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::dispatch::handlers::HandlerKind;
use crate::dispatch::DEFAULT_SLOW_HANDLER_WARN_MS;
use crate::heartbeat;
use crate::logging::LogLevel;
use crate::orchestrator::delivery::TargetConfig;
use crate::orchestrator::triggers::{is_network_app, Trigger, NETWORK_APP_IDS};
use crate::registry::DEFAULT_SHUTDOWN_TIMEOUT_MS;
use crate::server;
use crate::session::DEFAULT_READ_BUFFER_BYTES;
use crate::wire::decoder::DEFAULT_PREVIEW_BYTES;
use crate::wire::frame::DEFAULT_MAX_FRAME_BYTES;

pub const CONFIG_ENV_VAR: &str = "HOTCUE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
const CONFIG_ARG_KEY: &str = "config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub dispatch: DispatchConfig,
    pub shutdown: ShutdownConfig,
    pub heartbeat: HeartbeatConfig,
    pub triggers: Vec<Trigger>,
    /// Delivery target per network application id.
    pub targets: BTreeMap<String, TargetConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
    /// Also append log lines to this file; empty disables it.
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
            file_path: String::new(),
        }
    }
}

impl LoggingConfig {
    pub fn log_level(&self) -> Option<LogLevel> {
        LogLevel::from_config_value(&self.level)
    }

    pub fn file_path(&self) -> Option<&Path> {
        let trimmed = self.file_path.trim();
        (!trimmed.is_empty()).then(|| Path::new(trimmed))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: server::DEFAULT_HOST.to_owned(),
            port: server::DEFAULT_PORT,
            tls_enabled: server::DEFAULT_TLS_ENABLED,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub max_frame_bytes: usize,
    pub read_buffer_bytes: usize,
    pub read_poll_interval_ms: u64,
    pub decode_preview_bytes: usize,
    /// Payload field carrying a producer counter to watch; empty disables it.
    pub producer_sequence_field: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
            read_poll_interval_ms: server::DEFAULT_READ_POLL_INTERVAL_MS,
            decode_preview_bytes: DEFAULT_PREVIEW_BYTES,
            producer_sequence_field: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub handlers: Vec<String>,
    pub slow_handler_warn_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handlers: vec!["log".to_owned(), "triggers".to_owned()],
            slow_handler_warn_ms: DEFAULT_SLOW_HANDLER_WARN_MS,
        }
    }
}

impl DispatchConfig {
    pub fn handler_kinds(&self) -> Result<Vec<HandlerKind>, ConfigError> {
        let mut seen = BTreeSet::new();
        self.handlers
            .iter()
            .map(|name| {
                let kind =
                    HandlerKind::from_config_value(name).ok_or_else(|| ConfigError::Invalid {
                        key: "dispatch.handlers".to_owned(),
                        message: format!(
                            "unknown handler '{name}', expected one of: {}",
                            HandlerKind::ALLOWED_VALUES
                        ),
                    })?;
                if !seen.insert(name.trim().to_ascii_lowercase()) {
                    return Err(ConfigError::Invalid {
                        key: "dispatch.handlers".to_owned(),
                        message: format!("handler '{name}' is listed more than once"),
                    });
                }
                Ok(kind)
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: heartbeat::DEFAULT_INTERVAL_MS,
        }
    }
}

/// Where the effective configuration was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Argument(PathBuf),
    Environment(PathBuf),
    WorkingDirectory(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Argument(path) | Self::Environment(path) | Self::WorkingDirectory(path) => {
                Some(path)
            }
            Self::Defaults => None,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(path) => write!(f, "{} (--{CONFIG_ARG_KEY})", path.display()),
            Self::Environment(path) => write!(f, "{} (${CONFIG_ENV_VAR})", path.display()),
            Self::WorkingDirectory(path) => write!(f, "{}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub source: ConfigSource,
}

impl AppConfig {
    /// Resolves the config file from `--config`, `$HOTCUE_CONFIG` or
    /// `./config.toml`, then applies the remaining `--section.key value` pairs.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<LoadedConfig, ConfigError> {
        let (explicit, overrides) = take_config_argument(parse_cli_overrides(args)?);
        let source = discover_source(
            explicit,
            env::var_os(CONFIG_ENV_VAR),
            Path::new(DEFAULT_CONFIG_FILE),
        );

        let root = match source.path() {
            Some(path) => read_toml(path)?,
            None => Value::Table(toml::map::Map::new()),
        };
        let config = Self::from_toml_value(root, overrides)?;

        Ok(LoadedConfig { config, source })
    }

    #[cfg(test)]
    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let root = read_toml(path.as_ref())?;
        Self::from_toml_value(root, parse_cli_overrides(args)?)
    }

    fn from_toml_value(root: Value, overrides: Vec<(String, String)>) -> Result<Self, ConfigError> {
        let parsed: AppConfig = root.try_into().map_err(ConfigError::Deserialize)?;

        // Overrides are typed after the effective value, so defaults must be
        // materialized before they are applied.
        let mut merged = Value::try_from(&parsed).map_err(ConfigError::Serialize)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut merged, &key_path, &raw_value)?;
        }

        let config: AppConfig = merged.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logging.log_level().is_none() {
            return Err(invalid(
                "logging.level",
                format!(
                    "unknown level '{}', expected one of: error, warn, info, debug, verbose",
                    self.logging.level
                ),
            ));
        }
        if self.server.tls_enabled {
            return Err(invalid(
                "server.tls_enabled",
                "TLS transport is not implemented".to_owned(),
            ));
        }

        require_positive("ingest.max_frame_bytes", self.ingest.max_frame_bytes as u64)?;
        require_positive("ingest.read_buffer_bytes", self.ingest.read_buffer_bytes as u64)?;
        require_positive("ingest.read_poll_interval_ms", self.ingest.read_poll_interval_ms)?;
        require_positive("ingest.decode_preview_bytes", self.ingest.decode_preview_bytes as u64)?;
        require_positive("shutdown.timeout_ms", self.shutdown.timeout_ms)?;

        self.dispatch.handler_kinds()?;

        if self.heartbeat.enabled {
            heartbeat::validate_interval(self.heartbeat.interval_ms)
                .map_err(|error| invalid("heartbeat.interval_ms", error.to_string()))?;
        }

        for (app_id, target) in &self.targets {
            let key = format!("targets.{app_id}");
            if !is_network_app(app_id) {
                return Err(invalid(
                    &key,
                    format!(
                        "'{app_id}' is not a network application, expected one of: {}",
                        NETWORK_APP_IDS.join(", ")
                    ),
                ));
            }
            target.validate().map_err(|message| invalid(&key, message))?;
        }

        for (trigger_index, trigger) in self.triggers.iter().enumerate() {
            for (action_index, action) in trigger.actions.iter().enumerate() {
                let prefix = format!("triggers[{trigger_index}].actions[{action_index}]");
                if action.app_id.trim().is_empty() {
                    return Err(invalid(&format!("{prefix}.app_id"), "must not be empty".to_owned()));
                }
                if action.action_type.trim().is_empty() {
                    return Err(invalid(
                        &format!("{prefix}.action_type"),
                        "must not be empty".to_owned(),
                    ));
                }
                if action.is_network() && !self.targets.contains_key(&action.app_id) {
                    return Err(invalid(
                        &format!("{prefix}.app_id"),
                        format!(
                            "network application '{}' has no [targets.{}] section",
                            action.app_id, action.app_id
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    Serialize(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    Invalid {
        key: String,
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::Serialize(source) => write!(f, "failed to materialize config defaults: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::Invalid { key, message } => write!(f, "invalid config value at '{key}': {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(key: &str, message: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_owned(),
        message,
    }
}

fn require_positive(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(key, "must be greater than zero".to_owned()));
    }
    Ok(())
}

fn read_toml(path: &Path) -> Result<Value, ConfigError> {
    let toml_content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    })?;

    toml_content
        .parse()
        .map_err(|source| ConfigError::TomlParse {
            path: path.to_string_lossy().to_string(),
            source,
        })
}

fn discover_source(
    explicit: Option<PathBuf>,
    from_env: Option<OsString>,
    working_directory_file: &Path,
) -> ConfigSource {
    if let Some(path) = explicit {
        return ConfigSource::Argument(path);
    }
    if let Some(path) = from_env.filter(|value| !value.is_empty()) {
        return ConfigSource::Environment(PathBuf::from(path));
    }
    if working_directory_file.is_file() {
        return ConfigSource::WorkingDirectory(working_directory_file.to_path_buf());
    }
    ConfigSource::Defaults
}

fn take_config_argument(
    overrides: Vec<(String, String)>,
) -> (Option<PathBuf>, Vec<(String, String)>) {
    let mut explicit = None;
    let mut remaining = Vec::with_capacity(overrides.len());
    for (key, value) in overrides {
        if key == CONFIG_ARG_KEY {
            explicit = Some(PathBuf::from(value));
        } else {
            remaining.push((key, value));
        }
    }
    (explicit, remaining)
}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(|| ConfigError::InvalidPath {
        key: key_path.to_owned(),
    })?;
    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let mismatch = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| mismatch("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| mismatch("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| mismatch("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
