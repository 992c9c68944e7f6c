//! Error types for the provisioning pipeline.
//!
//! Errors fall into two groups. Descriptor-level errors (network, integrity,
//! unpack, relocation, retry exhaustion) are recorded against a single
//! descriptor's stage record and never stop sibling descriptors. Run-level
//! errors (unreadable catalog, incompatible manifest, unwritable root) are
//! returned from the command that hit them.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::manifest::Phase;

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Whether a network failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkErrorKind {
    /// Timeouts, 5xx, 408/429, connection resets, truncated bodies.
    Transient,
    /// Anything a retry cannot fix: 4xx, unsupported scheme, missing file.
    Permanent,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// A failure talking to one source URL (or to every mirror in a pass).
#[derive(Debug, Clone, Error)]
#[error("{kind} network error for {url}: {reason}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub url: String,
    pub reason: String,
}

impl NetworkError {
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: NetworkErrorKind::Transient,
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: NetworkErrorKind::Permanent,
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == NetworkErrorKind::Transient
    }
}

/// Errors raised while placing an artifact into its destination.
#[derive(Debug, Error)]
pub enum UnpackError {
    /// The archive could not be read or is not a supported format.
    #[error("bad archive {path}: {reason}")]
    BadArchive { path: PathBuf, reason: String },

    /// An entry or link target would land outside the destination.
    #[error("entry {entry:?} escapes destination {root}")]
    PathTraversal { entry: String, root: PathBuf },

    /// Filesystem failure while extracting or copying.
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The run was cancelled between entries.
    #[error("unpack cancelled")]
    Cancelled,
}

impl UnpackError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while rewriting sentinel references.
#[derive(Debug, Error)]
pub enum RelocationError {
    /// A relocation rule names a file that was not installed.
    #[error("relocation target {path} does not exist")]
    MissingFile { path: PathBuf },

    /// A relocation rule points outside the descriptor's destination.
    #[error("relocation rule {rule:?} escapes destination {destination}")]
    UnsafeRule { rule: String, destination: PathBuf },

    /// Filesystem failure while rewriting a file.
    #[error("failed to rewrite {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Category of a descriptor failure, persisted alongside the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Network,
    Integrity,
    BadArchive,
    PathTraversal,
    Relocation,
    FetchExhausted,
    Io,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Integrity => "integrity",
            Self::BadArchive => "bad-archive",
            Self::PathTraversal => "path-traversal",
            Self::Relocation => "relocation",
            Self::FetchExhausted => "fetch-exhausted",
            Self::Io => "io",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Fetched content does not match the descriptor's digest or size.
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Unpack(#[from] UnpackError),

    #[error(transparent)]
    Relocation(#[from] RelocationError),

    /// The manifest on disk was written by an unknown schema version.
    #[error("incompatible manifest {path}: schema version {found}, supported {supported}")]
    IncompatibleManifest {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    /// The retry budget ran out before a verified copy was obtained.
    #[error("fetch exhausted after {attempts} attempts: {last_error}")]
    FetchExhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The manifest exists but could not be parsed.
    #[error("corrupt manifest {path}: {reason}")]
    CorruptManifest { path: PathBuf, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `resume` was asked for a root that has no manifest or catalog copy.
    #[error("nothing to resume at {0}")]
    NothingToResume(PathBuf),

    #[error("invalid phase transition for {key}: {from} -> {to}")]
    InvalidTransition { key: String, from: Phase, to: Phase },

    #[error("unknown descriptor {0}")]
    UnknownDescriptor(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProvisionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the orchestrator should spend another attempt on this error.
    ///
    /// A corrupted mirror is indistinguishable from a flaky one, so integrity
    /// failures retry under the same budget as transient network failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_transient(),
            Self::Integrity { .. } => true,
            _ => false,
        }
    }

    /// Category recorded in the stage record.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Network(_) => FailureKind::Network,
            Self::Integrity { .. } => FailureKind::Integrity,
            Self::Unpack(UnpackError::BadArchive { .. }) => FailureKind::BadArchive,
            Self::Unpack(UnpackError::PathTraversal { .. }) => FailureKind::PathTraversal,
            Self::Unpack(_) => FailureKind::Io,
            Self::Relocation(_) => FailureKind::Relocation,
            Self::FetchExhausted { .. } => FailureKind::FetchExhausted,
            Self::Io { .. } => FailureKind::Io,
            _ => FailureKind::Other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Unpack(UnpackError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_display() {
        let err = NetworkError::transient("https://a/x.zip", "HTTP 503");
        assert_eq!(
            err.to_string(),
            "transient network error for https://a/x.zip: HTTP 503"
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProvisionError::from(NetworkError::transient("u", "r")).is_retryable());
        assert!(!ProvisionError::from(NetworkError::permanent("u", "r")).is_retryable());
        assert!(ProvisionError::Integrity {
            path: PathBuf::from("/a"),
            expected: "x".into(),
            actual: "y".into(),
        }
        .is_retryable());

        let traversal = ProvisionError::from(UnpackError::PathTraversal {
            entry: "../x".into(),
            root: PathBuf::from("/r"),
        });
        assert!(!traversal.is_retryable());
        assert_eq!(traversal.failure_kind(), FailureKind::PathTraversal);
    }

    #[test]
    fn test_cancelled_detection() {
        assert!(ProvisionError::Cancelled.is_cancelled());
        assert!(ProvisionError::Unpack(UnpackError::Cancelled).is_cancelled());
        assert!(!ProvisionError::NothingToResume(PathBuf::from("/r")).is_cancelled());
    }
}
