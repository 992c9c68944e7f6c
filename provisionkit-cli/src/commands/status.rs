//! `status` command - print the manifest of an installation root.

use std::path::Path;

use console::style;
use provisionkit::{InstallManifest, Phase, Provisioner};

use super::common::GlobalArgs;
use super::output::format_size;
use crate::error::CliError;
use crate::runner::CliRunner;

pub fn run(root: &Path, globals: GlobalArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(globals)?;
    runner.log_startup("status");

    let manifest = Provisioner::status(root)?;
    print!("{}", render(&manifest));
    Ok(())
}

fn render(manifest: &InstallManifest) -> String {
    let mut out = String::new();
    out.push_str(&format!("Install root: {}\n", manifest.install_root.display()));
    out.push_str(&format!("Status:       {}\n", manifest.status));
    out.push_str(&format!(
        "Updated:      {}\n",
        manifest.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    let counts = manifest
        .phase_counts()
        .iter()
        .map(|(phase, n)| format!("{} {}", n, phase))
        .collect::<Vec<_>>()
        .join(", ");
    out.push_str(&format!("Descriptors:  {} ({})\n\n", manifest.records.len(), counts));

    let width = manifest.records.keys().map(String::len).max().unwrap_or(0);
    for (key, record) in &manifest.records {
        let phase = match record.phase {
            Phase::Done => style(record.phase.to_string()).green(),
            Phase::Failed => style(record.phase.to_string()).red(),
            _ => style(record.phase.to_string()).yellow(),
        };
        out.push_str(&format!("  {:<width$}  {:<10}", key, phase, width = width));
        if record.resume_offset > 0 {
            out.push_str(&format!(" {} staged", format_size(record.resume_offset)));
        }
        if record.attempts > 0 {
            out.push_str(&format!(" attempts={}", record.attempts));
        }
        out.push('\n');
        if let Some(error) = &record.last_error {
            out.push_str(&format!("  {:<width$}  {}\n", "", error, width = width));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisionkit::{ContentDigest, DigestAlgorithm, StageRecord};

    #[test]
    fn test_render_lists_records() {
        console::set_colors_enabled(false);
        let digest = ContentDigest::of_bytes(DigestAlgorithm::Sha256, b"x");
        let mut manifest = InstallManifest::new("/opt/app");
        let mut failed = StageRecord::new("runtime", digest.clone());
        failed.phase = Phase::Failed;
        failed.last_error = Some("HTTP 404".to_string());
        failed.attempts = 2;
        manifest.records.insert("runtime".to_string(), failed);
        manifest
            .records
            .insert("docs".to_string(), StageRecord::new("docs", digest));

        let text = render(&manifest);
        assert!(text.contains("Install root: /opt/app"));
        assert!(text.contains("Descriptors:  2"));
        assert!(text.contains("runtime"));
        assert!(text.contains("attempts=2"));
        assert!(text.contains("HTTP 404"));
    }
}
