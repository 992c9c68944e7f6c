//! ProvisionKit CLI
//!
//! Installs, resumes, inspects and relocates artifact catalogs from the
//! command line.

mod commands;
mod error;
mod progress;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::common::GlobalArgs;
use commands::config::ConfigCommands;
use commands::install::InstallArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "provisionkit")]
#[command(version, about = "Resumable, relocatable artifact installer", long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install a catalog into an installation root
    Install {
        /// Installation root
        #[arg(long)]
        root: PathBuf,

        /// Catalog JSON file
        #[arg(long)]
        catalog: PathBuf,
    },

    /// Continue an interrupted or failed install
    Resume {
        #[arg(long)]
        root: PathBuf,
    },

    /// Show per-descriptor progress of an installation root
    Status {
        #[arg(long)]
        root: PathBuf,
    },

    /// Re-target an installation that was copied or moved
    Relocate {
        #[arg(long)]
        root: PathBuf,
    },

    /// View or change configuration settings
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let globals = cli.globals;
    match cli.command {
        Commands::Install { root, catalog } => commands::install::run(
            InstallArgs {
                root,
                catalog: Some(catalog),
            },
            globals,
        ),
        Commands::Resume { root } => {
            commands::install::run(InstallArgs { root, catalog: None }, globals)
        }
        Commands::Status { root } => {
            commands::status::run(&root, globals)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Relocate { root } => {
            commands::relocate::run(&root, globals)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(command) => {
            commands::config::run(command, &globals.config_path())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
