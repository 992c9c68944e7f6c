//! Outcome of a run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::FailureKind;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every descriptor is DONE.
    Complete,
    /// At least one descriptor FAILED.
    Aborted,
    /// The cancellation token fired before the run finished.
    Cancelled,
    /// Nothing failed, but skipped descriptors are not DONE yet.
    Partial,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Aborted => write!(f, "aborted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

/// Failure recorded against one descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of `run_install` or `resume_install`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub completed_keys: Vec<String>,
    pub failed_keys: Vec<String>,
    pub skipped_keys: Vec<String>,
    pub failures: BTreeMap<String, DescriptorFailure>,
    pub exit_status: ExitStatus,
}

impl RunResult {
    pub fn is_complete(&self) -> bool {
        self.exit_status.is_success()
    }
}

/// Result of `relocate_install`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationSummary {
    pub install_root: PathBuf,
    /// Root the installation was last relocated against, when it moved.
    pub previous_root: Option<PathBuf>,
    /// Descriptors whose files were re-targeted.
    pub relocated_keys: Vec<String>,
    pub rewritten_files: usize,
    /// Descriptors not yet DONE, left for the next resume.
    pub pending_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Complete.to_string(), "complete");
        assert_eq!(ExitStatus::Partial.to_string(), "partial");
        assert!(ExitStatus::Complete.is_success());
        assert!(!ExitStatus::Cancelled.is_success());
    }
}
