//! `config` subcommands: get, set, list and path.

use std::path::Path;

use clap::Subcommand;
use provisionkit::config::{ConfigFile, ConfigKey};

use crate::error::CliError;

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print one setting
    Get {
        /// Setting as section.key (e.g. network.max_attempts)
        key: String,
    },

    /// Change one setting and save the file
    Set {
        /// Setting as section.key (e.g. install.concurrency)
        key: String,

        value: String,
    },

    /// Print every setting
    List,

    /// Print the configuration file path
    Path,
}

/// Run a config subcommand against the file at `path`.
pub fn run(command: ConfigCommands, path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Get { key } => {
            let key = parse_key(&key)?;
            println!("{}", display_value(&key.get(&ConfigFile::load_from(path)?)));
        }
        ConfigCommands::Set { key, value } => {
            let key = parse_key(&key)?;
            let mut config = ConfigFile::load_from(path)?;
            key.set(&mut config, &value)?;
            config.save_to(path)?;
            println!("Set {} = {}", key.name(), value);
        }
        ConfigCommands::List => print!("{}", render_list(&ConfigFile::load_from(path)?)),
        ConfigCommands::Path => println!("{}", path.display()),
    }
    Ok(())
}

fn parse_key(key: &str) -> Result<ConfigKey, CliError> {
    key.parse().map_err(|_| {
        CliError::Config(format!(
            "unknown key '{}'; `provisionkit config list` shows the available keys",
            key
        ))
    })
}

fn display_value(value: &str) -> &str {
    if value.is_empty() {
        "(not set)"
    } else {
        value
    }
}

fn render_list(config: &ConfigFile) -> String {
    let mut out = String::new();
    let mut section = "";
    for key in ConfigKey::all() {
        if key.section() != section {
            if !section.is_empty() {
                out.push('\n');
            }
            section = key.section();
            out.push_str(&format!("[{}]\n", section));
        }
        out.push_str(&format!(
            "  {} = {}\n",
            key.key_name(),
            display_value(&key.get(config))
        ));
    }
    out
}
