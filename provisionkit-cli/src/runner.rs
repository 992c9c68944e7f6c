//! Shared setup for commands that run the pipeline.

use std::sync::Arc;

use provisionkit::config::ConfigFile;
use provisionkit::logging::{self, LogConfig, LoggingGuard};
use provisionkit::Provisioner;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commands::common::GlobalArgs;
use crate::error::CliError;
use crate::progress::TerminalProgress;

/// Loaded configuration plus the logging guard for the process lifetime.
pub struct CliRunner {
    config: ConfigFile,
    globals: GlobalArgs,
    _logging: LoggingGuard,
}

impl CliRunner {
    /// Load the config file and install logging.
    pub fn new(globals: GlobalArgs) -> Result<Self, CliError> {
        let config = globals.load_config()?;
        let log_config = LogConfig::new(globals.log_level(&config.logging.level))
            .with_directory(
                globals
                    .log_dir
                    .clone()
                    .or_else(|| config.logging.directory.clone()),
            )
            .with_ansi(console::colors_enabled_stderr());
        let guard = logging::init(&log_config)?;

        Ok(Self {
            config,
            globals,
            _logging: guard,
        })
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            command,
            version = env!("CARGO_PKG_VERSION"),
            config = %self.globals.config_path().display(),
            "provisionkit starting"
        );
    }

    /// Provisioner with terminal progress and Ctrl+C wired to cancellation.
    pub fn provisioner(&self) -> Result<(Provisioner, Arc<TerminalProgress>), CliError> {
        let options = self.globals.run_options(&self.config)?;
        let progress = Arc::new(TerminalProgress::new(console::user_attended_stderr()));
        let provisioner = Provisioner::new(options)?.with_observer(progress.clone());
        install_interrupt_handler(provisioner.cancellation_token())?;
        Ok((provisioner, progress))
    }
}

fn install_interrupt_handler(token: CancellationToken) -> Result<(), CliError> {
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, stopping after the current step...");
        token.cancel();
    })
    .map_err(|e| CliError::SignalHandler(e.to_string()))
}
