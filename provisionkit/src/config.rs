//! INI configuration file.
//!
//! Settings are read from `~/.config/provisionkit/config.ini` (or the
//! platform equivalent) unless a path is given explicitly. A missing file
//! yields the built-in defaults; a value that does not parse is an error.
//!
//! ```ini
//! [install]
//! concurrency = 4
//! sentinel = @@INSTALL_ROOT@@
//! verify_installed = true
//!
//! [network]
//! timeout_secs = 300
//! max_attempts = 3
//! initial_backoff_ms = 500
//! max_backoff_secs = 30
//! user_agent = provisionkit/0.1
//!
//! [logging]
//! level = info
//! directory = /var/log/provisionkit
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::fetch::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT,
};
use crate::orchestrator::{RunOptions, DEFAULT_CONCURRENCY};
use crate::relocate::DEFAULT_SENTINEL;

/// Configuration file name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Errors from loading or saving the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),
}

/// `[install]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSettings {
    pub concurrency: usize,
    pub sentinel: String,
    pub verify_installed: bool,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            sentinel: DEFAULT_SENTINEL.to_string(),
            verify_installed: true,
        }
    }
}

/// `[network]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub user_agent: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_DELAY_MS,
            max_backoff_secs: DEFAULT_MAX_DELAY_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    /// Directory for the log file; stderr only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub install: InstallSettings,
    pub network: NetworkSettings,
    pub logging: LoggingSettings,
}

impl ConfigFile {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load from `path`; a missing file gives the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Parse from INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in ConfigKey::all() {
            if let Some(value) = ini.get_from(Some(key.section()), key.key_name()) {
                key.set(&mut config, value)?;
            }
        }
        Ok(config)
    }

    /// Write to the default location, creating the directory if needed.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |e: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            let value = key.get(self);
            if !value.is_empty() {
                ini.with_section(Some(key.section()))
                    .set(key.key_name(), value);
            }
        }
        ini.write_to_file(path).map_err(write_err)
    }

    /// Run options with these settings applied on top of the defaults.
    pub fn to_run_options(&self) -> RunOptions {
        let network = &self.network;
        let retry = if network.max_attempts <= 1 {
            RetryPolicy::None
        } else {
            RetryPolicy::ExponentialBackoff {
                initial_delay: Duration::from_millis(network.initial_backoff_ms),
                max_delay: Duration::from_secs(network.max_backoff_secs),
                multiplier: DEFAULT_BACKOFF_MULTIPLIER,
                max_attempts: network.max_attempts,
            }
        };

        RunOptions::default()
            .with_concurrency(self.install.concurrency)
            .with_sentinel(self.install.sentinel.clone())
            .with_verify_installed(self.install.verify_installed)
            .with_timeout(Duration::from_secs(network.timeout_secs))
            .with_user_agent(network.user_agent.clone())
            .with_retry(retry)
    }
}

/// Default configuration file path.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("provisionkit")
        .join(CONFIG_FILE_NAME)
}

/// Every recognised `section.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    InstallConcurrency,
    InstallSentinel,
    InstallVerifyInstalled,
    NetworkTimeoutSecs,
    NetworkMaxAttempts,
    NetworkInitialBackoffMs,
    NetworkMaxBackoffSecs,
    NetworkUserAgent,
    LoggingLevel,
    LoggingDirectory,
}

impl ConfigKey {
    pub fn all() -> &'static [ConfigKey] {
        use ConfigKey::*;
        &[
            InstallConcurrency,
            InstallSentinel,
            InstallVerifyInstalled,
            NetworkTimeoutSecs,
            NetworkMaxAttempts,
            NetworkInitialBackoffMs,
            NetworkMaxBackoffSecs,
            NetworkUserAgent,
            LoggingLevel,
            LoggingDirectory,
        ]
    }

    pub fn section(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            InstallConcurrency | InstallSentinel | InstallVerifyInstalled => "install",
            NetworkTimeoutSecs | NetworkMaxAttempts | NetworkInitialBackoffMs
            | NetworkMaxBackoffSecs | NetworkUserAgent => "network",
            LoggingLevel | LoggingDirectory => "logging",
        }
    }

    pub fn key_name(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            InstallConcurrency => "concurrency",
            InstallSentinel => "sentinel",
            InstallVerifyInstalled => "verify_installed",
            NetworkTimeoutSecs => "timeout_secs",
            NetworkMaxAttempts => "max_attempts",
            NetworkInitialBackoffMs => "initial_backoff_ms",
            NetworkMaxBackoffSecs => "max_backoff_secs",
            NetworkUserAgent => "user_agent",
            LoggingLevel => "level",
            LoggingDirectory => "directory",
        }
    }

    /// Full `section.key` name.
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    /// Current value as a string; empty when unset.
    pub fn get(&self, config: &ConfigFile) -> String {
        use ConfigKey::*;
        match self {
            InstallConcurrency => config.install.concurrency.to_string(),
            InstallSentinel => config.install.sentinel.clone(),
            InstallVerifyInstalled => config.install.verify_installed.to_string(),
            NetworkTimeoutSecs => config.network.timeout_secs.to_string(),
            NetworkMaxAttempts => config.network.max_attempts.to_string(),
            NetworkInitialBackoffMs => config.network.initial_backoff_ms.to_string(),
            NetworkMaxBackoffSecs => config.network.max_backoff_secs.to_string(),
            NetworkUserAgent => config.network.user_agent.clone(),
            LoggingLevel => config.logging.level.clone(),
            LoggingDirectory => config
                .logging
                .directory
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
        }
    }

    /// Parse and store `value`.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        use ConfigKey::*;
        let value = value.trim();
        match self {
            InstallConcurrency => {
                config.install.concurrency = self.parse_positive(value)? as usize;
            }
            InstallSentinel => {
                if value.is_empty() {
                    return Err(self.invalid(value, "sentinel must not be empty"));
                }
                config.install.sentinel = value.to_string();
            }
            InstallVerifyInstalled => config.install.verify_installed = self.parse_bool(value)?,
            NetworkTimeoutSecs => config.network.timeout_secs = self.parse_positive(value)?,
            NetworkMaxAttempts => config.network.max_attempts = self.parse_positive(value)? as u32,
            NetworkInitialBackoffMs => config.network.initial_backoff_ms = self.parse_number(value)?,
            NetworkMaxBackoffSecs => config.network.max_backoff_secs = self.parse_number(value)?,
            NetworkUserAgent => config.network.user_agent = value.to_string(),
            LoggingLevel => {
                const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
                let level = value.to_lowercase();
                if !LEVELS.contains(&level.as_str()) {
                    return Err(self.invalid(value, "expected trace, debug, info, warn or error"));
                }
                config.logging.level = level;
            }
            LoggingDirectory => {
                config.logging.directory = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
        }
        Ok(())
    }

    fn parse_number(&self, value: &str) -> Result<u64, ConfigError> {
        value
            .parse::<u64>()
            .map_err(|e| self.invalid(value, &e.to_string()))
    }

    fn parse_positive(&self, value: &str) -> Result<u64, ConfigError> {
        match self.parse_number(value)? {
            0 => Err(self.invalid(value, "must be at least 1")),
            n if n > u32::MAX as u64 => Err(self.invalid(value, "too large")),
            n => Ok(n),
        }
    }

    fn parse_bool(&self, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(self.invalid(value, "expected true or false")),
        }
    }

    fn invalid(&self, value: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.name(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ConfigFile::load_from(&temp.path().join("config.ini")).unwrap();
        assert_eq!(config, ConfigFile::default());
        assert_eq!(config.install.concurrency, 4);
        assert_eq!(config.network.max_attempts, 3);
    }

    #[test]
    fn test_parse_sections() {
        let config = ConfigFile::parse(
            "[install]\nconcurrency = 8\nverify_installed = no\n\
             [network]\ntimeout_secs = 60\nmax_attempts = 5\nuser_agent = tester/1\n\
             [logging]\nlevel = DEBUG\ndirectory = /tmp/logs\n",
        )
        .unwrap();

        assert_eq!(config.install.concurrency, 8);
        assert!(!config.install.verify_installed);
        assert_eq!(config.network.timeout_secs, 60);
        assert_eq!(config.network.user_agent, "tester/1");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.directory, Some(PathBuf::from("/tmp/logs")));
        // untouched keys keep their defaults
        assert_eq!(config.install.sentinel, DEFAULT_SENTINEL);
    }

    #[test]
    fn test_invalid_value_is_error() {
        let err = ConfigFile::parse("[install]\nconcurrency = many\n").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "install.concurrency"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(ConfigFile::parse("[network]\nmax_attempts = 0\n").is_err());
        assert!(ConfigFile::parse("[logging]\nlevel = loud\n").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.install.concurrency = 2;
        config.logging.directory = Some(temp.path().join("logs"));
        config.save_to(&path).unwrap();

        assert_eq!(ConfigFile::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_key_lookup() {
        let key: ConfigKey = "network.user_agent".parse().unwrap();
        assert_eq!(key, ConfigKey::NetworkUserAgent);
        assert!("network.bogus".parse::<ConfigKey>().is_err());
    }

    #[test]
    fn test_to_run_options() {
        let mut config = ConfigFile::default();
        config.install.concurrency = 6;
        config.network.max_attempts = 5;
        config.network.timeout_secs = 10;

        let options = config.to_run_options();
        assert_eq!(options.concurrency, 6);
        assert_eq!(options.retry.max_attempts(), 5);
        assert_eq!(options.timeout, Duration::from_secs(10));

        config.network.max_attempts = 1;
        assert_eq!(config.to_run_options().retry.max_attempts(), 1);
    }
}
