//! CLI error type.

use std::fmt;
use std::process::ExitCode;

use provisionkit::config::ConfigError;
use provisionkit::logging::LoggingError;
use provisionkit::ProvisionError;

/// Exit code for errors that stop a command before it produces a result.
pub const EXIT_FATAL: u8 = 3;

#[derive(Debug)]
pub enum CliError {
    /// Bad flag combination or configuration value.
    Config(String),
    ConfigFile(ConfigError),
    Logging(LoggingError),
    Provision(ProvisionError),
    SignalHandler(String),
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(EXIT_FATAL)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::ConfigFile(e) => write!(f, "{}", e),
            CliError::Logging(e) => write!(f, "Logging setup failed: {}", e),
            CliError::Provision(e) => write!(f, "{}", e),
            CliError::SignalHandler(msg) => write!(f, "Failed to set signal handler: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::ConfigFile(e) => Some(e),
            CliError::Logging(e) => Some(e),
            CliError::Provision(e) => Some(e),
            CliError::Config(_) | CliError::SignalHandler(_) => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::ConfigFile(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Logging(e)
    }
}

impl From<ProvisionError> for CliError {
    fn from(e: ProvisionError) -> Self {
        CliError::Provision(e)
    }
}
