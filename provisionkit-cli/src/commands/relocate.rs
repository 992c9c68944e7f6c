//! `relocate` command - re-target a copied or moved installation.

use std::path::Path;

use console::style;

use super::common::GlobalArgs;
use crate::error::CliError;
use crate::runner::CliRunner;

pub fn run(root: &Path, globals: GlobalArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(globals)?;
    runner.log_startup("relocate");
    let (provisioner, progress) = runner.provisioner()?;

    let summary = provisioner.relocate_install(root);
    progress.clear();
    let summary = summary?;

    match &summary.previous_root {
        Some(previous) if previous != &summary.install_root => println!(
            "Relocated {} -> {}",
            previous.display(),
            summary.install_root.display()
        ),
        _ => println!("Install root unchanged: {}", summary.install_root.display()),
    }
    println!(
        "  Descriptors re-targeted: {}",
        summary.relocated_keys.len()
    );
    println!("  Files rewritten:         {}", summary.rewritten_files);
    if !summary.pending_keys.is_empty() {
        println!(
            "  {} {} (run `provisionkit resume` to finish them)",
            style("Not yet relocated:").yellow(),
            summary.pending_keys.join(", ")
        );
    }
    Ok(())
}
