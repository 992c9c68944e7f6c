//! Subcommand implementations.

pub mod common;
pub mod config;
pub mod install;
pub mod output;
pub mod relocate;
pub mod status;
