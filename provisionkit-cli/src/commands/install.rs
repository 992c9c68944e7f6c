//! `install` and `resume` commands.

use std::path::PathBuf;
use std::process::ExitCode;

use console::style;
use provisionkit::{ExitStatus, RunResult};

use super::common::GlobalArgs;
use crate::error::CliError;
use crate::runner::CliRunner;

pub struct InstallArgs {
    pub root: PathBuf,
    /// `None` resumes from the catalog stored under the root.
    pub catalog: Option<PathBuf>,
}

/// Run an install or resume.
pub fn run(args: InstallArgs, globals: GlobalArgs) -> Result<ExitCode, CliError> {
    let runner = CliRunner::new(globals)?;
    let (provisioner, progress) = runner.provisioner()?;

    let result = match &args.catalog {
        Some(catalog) => {
            runner.log_startup("install");
            println!("Installing {} into {}", catalog.display(), args.root.display());
            provisioner.run_install(&args.root, catalog)
        }
        None => {
            runner.log_startup("resume");
            println!("Resuming install in {}", args.root.display());
            provisioner.resume_install(&args.root)
        }
    };
    progress.clear();
    let result = result?;

    print_summary(&result);
    Ok(exit_code(result.exit_status))
}

/// Process exit code for a finished run.
pub fn exit_code(status: ExitStatus) -> ExitCode {
    ExitCode::from(exit_value(status))
}

fn exit_value(status: ExitStatus) -> u8 {
    match status {
        ExitStatus::Complete => 0,
        ExitStatus::Aborted => 1,
        ExitStatus::Partial => 2,
        ExitStatus::Cancelled => 130,
    }
}

fn print_summary(result: &RunResult) {
    println!();
    let status = match result.exit_status {
        ExitStatus::Complete => style(result.exit_status.to_string()).green(),
        ExitStatus::Partial | ExitStatus::Cancelled => style(result.exit_status.to_string()).yellow(),
        ExitStatus::Aborted => style(result.exit_status.to_string()).red(),
    };
    println!("Run {}", status.bold());
    println!("  Completed: {}", result.completed_keys.len());
    if !result.skipped_keys.is_empty() {
        println!(
            "  Skipped:   {} ({})",
            result.skipped_keys.len(),
            result.skipped_keys.join(", ")
        );
    }
    if !result.failed_keys.is_empty() {
        println!("  Failed:    {}", result.failed_keys.len());
        for (key, failure) in &result.failures {
            println!("    {} [{}] {}", style(key).bold(), failure.kind, failure.message);
        }
    }
    if result.exit_status == ExitStatus::Cancelled {
        println!();
        println!("Run `provisionkit resume` with the same root to continue.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_value(ExitStatus::Complete), 0);
        assert_eq!(exit_value(ExitStatus::Aborted), 1);
        assert_eq!(exit_value(ExitStatus::Partial), 2);
        assert_eq!(exit_value(ExitStatus::Cancelled), 130);
    }
}
