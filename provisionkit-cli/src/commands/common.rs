//! Flags shared by every subcommand and their merge with the config file.

use std::path::PathBuf;

use clap::Args;
use provisionkit::config::{config_file_path, ConfigFile};
use provisionkit::RunOptions;

use crate::error::CliError;

/// Global flags; each one overrides the matching config file setting.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Configuration file (default: ~/.config/provisionkit/config.ini)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to provisionkit.log in this directory
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Descriptors processed in parallel
    #[arg(long, global = true, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Fetch passes per descriptor before giving up
    #[arg(long, global = true, value_name = "N")]
    pub retries: Option<u32>,

    /// Leave this descriptor untouched (repeatable)
    #[arg(long, global = true, value_name = "KEY")]
    pub skip: Vec<String>,
}

impl GlobalArgs {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(config_file_path)
    }

    /// Load the config file; a missing default file gives the defaults,
    /// a missing explicit `--config` file is an error.
    pub fn load_config(&self) -> Result<ConfigFile, CliError> {
        if let Some(path) = &self.config {
            if !path.exists() {
                return Err(CliError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(ConfigFile::load_from(&self.config_path())?)
    }

    /// Filter directive: `-v` flags win over the configured level.
    pub fn log_level(&self, configured: &str) -> String {
        match self.verbose {
            0 => configured.to_string(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }

    /// Config file settings with the flags applied on top.
    pub fn run_options(&self, config: &ConfigFile) -> Result<RunOptions, CliError> {
        let mut options = config.to_run_options();

        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                return Err(CliError::Config("--concurrency must be at least 1".to_string()));
            }
            options = options.with_concurrency(concurrency);
        }
        if let Some(retries) = self.retries {
            if retries == 0 {
                return Err(CliError::Config("--retries must be at least 1".to_string()));
            }
            let retry = options.retry.clone().with_max_attempts(retries);
            options = options.with_retry(retry);
        }
        if !self.skip.is_empty() {
            options = options.with_skip(self.skip.iter().cloned());
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_config() {
        let config = ConfigFile::parse("[install]\nconcurrency = 8\n[network]\nmax_attempts = 5\n")
            .unwrap();
        let globals = GlobalArgs {
            concurrency: Some(2),
            skip: vec!["docs".to_string()],
            ..Default::default()
        };

        let options = globals.run_options(&config).unwrap();
        assert_eq!(options.concurrency, 2);
        assert_eq!(options.retry.max_attempts(), 5);
        assert!(options.skip.contains("docs"));
    }

    #[test]
    fn test_retries_keep_backoff_curve() {
        let globals = GlobalArgs {
            retries: Some(7),
            ..Default::default()
        };
        let options = globals.run_options(&ConfigFile::default()).unwrap();
        assert_eq!(options.retry.max_attempts(), 7);
    }

    #[test]
    fn test_zero_values_rejected() {
        let globals = GlobalArgs {
            concurrency: Some(0),
            ..Default::default()
        };
        assert!(globals.run_options(&ConfigFile::default()).is_err());

        let globals = GlobalArgs {
            retries: Some(0),
            ..Default::default()
        };
        assert!(globals.run_options(&ConfigFile::default()).is_err());
    }

    #[test]
    fn test_verbosity_levels() {
        let mut globals = GlobalArgs::default();
        assert_eq!(globals.log_level("warn"), "warn");
        globals.verbose = 1;
        assert_eq!(globals.log_level("warn"), "debug");
        globals.verbose = 3;
        assert_eq!(globals.log_level("warn"), "trace");
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let temp = TempDir::new().unwrap();
        let missing = GlobalArgs {
            config: Some(temp.path().join("nope.ini")),
            ..Default::default()
        };
        assert!(missing.load_config().is_err());

        let path = temp.path().join("config.ini");
        fs::write(&path, "[install]\nconcurrency = 6\n").unwrap();
        let present = GlobalArgs {
            config: Some(path),
            ..Default::default()
        };
        assert_eq!(present.load_config().unwrap().install.concurrency, 6);
    }
}
