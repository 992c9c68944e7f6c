//! Streaming digest verification.
//!
//! Files are hashed in 64KB chunks so artifacts of any size verify in
//! constant memory. Directories (staged `directory-copy` artifacts and
//! installed destinations) hash as a tree: every entry contributes its
//! relative path and kind, plus file contents or symlink target, in sorted
//! path order.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::catalog::{ContentDigest, DigestAlgorithm};
use crate::error::{ProvisionError, ProvisionResult};

/// Buffer size for reading files while hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Algorithm used for installed-tree fingerprints.
pub const FINGERPRINT_ALGORITHM: DigestAlgorithm = DigestAlgorithm::Sha256;

/// Result of comparing content against an expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match,
    SizeMismatch { expected: u64, actual: u64 },
    DigestMismatch { actual: String },
}

impl Verification {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    /// Human-readable description of what was found instead.
    pub fn actual(&self) -> String {
        match self {
            Self::Match => "match".to_string(),
            Self::SizeMismatch { actual, .. } => format!("{} bytes", actual),
            Self::DigestMismatch { actual } => actual.clone(),
        }
    }
}

/// Computes and compares digests, observing a cancellation token per chunk.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    cancel: CancellationToken,
}

impl Verifier {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Compare a file or directory against `expected`.
    ///
    /// When `expected_size` is known and `path` is a file, the size is
    /// compared first and hashing is skipped on mismatch.
    pub fn check(
        &self,
        path: &Path,
        expected: &ContentDigest,
        expected_size: Option<u64>,
    ) -> ProvisionResult<Verification> {
        let meta = fs::symlink_metadata(path).map_err(|e| ProvisionError::io(path, e))?;
        if meta.is_file() {
            if let Some(size) = expected_size {
                if meta.len() != size {
                    return Ok(Verification::SizeMismatch {
                        expected: size,
                        actual: meta.len(),
                    });
                }
            }
        }

        let actual = self.digest(path, expected.algorithm())?;
        if expected.matches_hex(&actual) {
            Ok(Verification::Match)
        } else {
            Ok(Verification::DigestMismatch { actual })
        }
    }

    /// Returns whether `path` matches `expected`.
    pub fn verify(&self, path: &Path, expected: &ContentDigest) -> ProvisionResult<bool> {
        Ok(self.check(path, expected, None)?.is_match())
    }

    /// Hex digest of a file, or tree digest of a directory.
    pub fn digest(&self, path: &Path, algorithm: DigestAlgorithm) -> ProvisionResult<String> {
        let meta = fs::symlink_metadata(path).map_err(|e| ProvisionError::io(path, e))?;
        if meta.is_dir() {
            self.tree_digest(path, algorithm)
        } else {
            self.file_digest(path, algorithm)
        }
    }

    /// Fingerprint of installed content, recorded when a descriptor is done.
    pub fn fingerprint(&self, path: &Path) -> ProvisionResult<String> {
        self.digest(path, FINGERPRINT_ALGORITHM)
    }

    pub fn file_digest(&self, path: &Path, algorithm: DigestAlgorithm) -> ProvisionResult<String> {
        let mut file = File::open(path).map_err(|e| ProvisionError::io(path, e))?;
        let mut hasher = algorithm.hasher();
        let mut buffer = vec![0u8; BUFFER_SIZE];

        loop {
            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let bytes_read = file
                .read(&mut buffer)
                .map_err(|e| ProvisionError::io(path, e))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize_hex())
    }

    /// Digest over a directory tree.
    ///
    /// Symlinks are hashed by target and never followed.
    pub fn tree_digest(&self, root: &Path, algorithm: DigestAlgorithm) -> ProvisionResult<String> {
        let mut hasher = algorithm.hasher();

        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                ProvisionError::io(path, e.into())
            })?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let file_type = entry.file_type();

            if file_type.is_symlink() {
                let target =
                    fs::read_link(entry.path()).map_err(|e| ProvisionError::io(entry.path(), e))?;
                hasher.update(b"L\0");
                hasher.update(relative.as_bytes());
                hasher.update(b"\0");
                hasher.update(target.to_string_lossy().as_bytes());
            } else if file_type.is_dir() {
                hasher.update(b"D\0");
                hasher.update(relative.as_bytes());
            } else {
                let content = self.file_digest(entry.path(), algorithm)?;
                hasher.update(b"F\0");
                hasher.update(relative.as_bytes());
                hasher.update(b"\0");
                hasher.update(content.as_bytes());
            }
            hasher.update(b"\n");
        }

        Ok(hasher.finalize_hex())
    }
}
