//! On-disk layout of an installation root.
//!
//! ```text
//! <root>/
//! ├── .install-manifest        persisted stage records
//! ├── .install-catalog.json    catalog copy used by resume
//! ├── .staging/
//! │   ├── <key>.part           download in progress
//! │   └── <key>.artifact       verified artifact awaiting unpack
//! └── <dest_path>/...          installed content, one subtree per descriptor
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::ArtifactDescriptor;
use crate::error::{ProvisionError, ProvisionResult, UnpackError};

/// Manifest file name inside the installation root.
pub const MANIFEST_FILE_NAME: &str = ".install-manifest";

/// Catalog copy file name inside the installation root.
pub const CATALOG_COPY_FILE_NAME: &str = ".install-catalog.json";

/// Staging directory name inside the installation root.
pub const STAGING_DIR_NAME: &str = ".staging";

/// Top-level names a descriptor destination may not claim.
pub(crate) const RESERVED_NAMES: &[&str] = &[
    MANIFEST_FILE_NAME,
    CATALOG_COPY_FILE_NAME,
    STAGING_DIR_NAME,
    ".install-manifest.tmp",
    ".install-catalog.json.tmp",
];

/// Paths derived from one installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    /// Create the root if needed and resolve it to an absolute path.
    pub fn prepare(root: &Path) -> ProvisionResult<Self> {
        fs::create_dir_all(root).map_err(|e| ProvisionError::io(root, e))?;
        Self::open(root)
    }

    /// Resolve an existing root.
    pub fn open(root: &Path) -> ProvisionResult<Self> {
        let root = root.canonicalize().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProvisionError::NothingToResume(root.to_path_buf()),
            _ => ProvisionError::io(root, e),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_COPY_FILE_NAME)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    /// Partial download for a descriptor.
    pub fn part_path(&self, key: &str) -> PathBuf {
        self.staging_dir().join(format!("{}.part", key))
    }

    /// Verified artifact for a descriptor.
    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.staging_dir().join(format!("{}.artifact", key))
    }

    /// Installed location of a descriptor.
    pub fn destination(&self, descriptor: &ArtifactDescriptor) -> ProvisionResult<PathBuf> {
        let relative = descriptor.relative_destination().map_err(|_| {
            ProvisionError::from(UnpackError::PathTraversal {
                entry: descriptor.dest_path.clone(),
                root: self.root.clone(),
            })
        })?;
        Ok(self.root.join(relative))
    }

    pub fn ensure_staging(&self) -> ProvisionResult<()> {
        let dir = self.staging_dir();
        fs::create_dir_all(&dir).map_err(|e| ProvisionError::io(dir, e))
    }

    /// Remove the staging directory and everything left in it.
    pub fn remove_staging(&self) -> ProvisionResult<()> {
        let dir = self.staging_dir();
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProvisionError::io(dir, e)),
        }
    }
}

/// Remove a file or directory tree; a missing path is not an error.
pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Size of a file on disk, 0 when missing.
pub(crate) fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("nested").join("install");

        let layout = InstallLayout::prepare(&root).unwrap();
        assert!(root.is_dir());
        assert!(layout.root().is_absolute());
        assert_eq!(
            layout.manifest_path().file_name().unwrap(),
            MANIFEST_FILE_NAME
        );
    }

    #[test]
    fn test_open_missing_root() {
        let temp = TempDir::new().unwrap();
        let err = InstallLayout::open(&temp.path().join("absent")).unwrap_err();
        assert!(matches!(err, ProvisionError::NothingToResume(_)));
    }

    #[test]
    fn test_staging_paths() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::prepare(temp.path()).unwrap();

        assert_eq!(
            layout.part_path("python"),
            layout.root().join(".staging").join("python.part")
        );
        assert_eq!(
            layout.artifact_path("python"),
            layout.root().join(".staging").join("python.artifact")
        );
    }

    #[test]
    fn test_remove_path_handles_files_dirs_and_missing() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        let dir = temp.path().join("d");
        fs::write(&file, b"x").unwrap();
        fs::create_dir_all(dir.join("sub")).unwrap();

        remove_path(&file).unwrap();
        remove_path(&dir).unwrap();
        remove_path(&temp.path().join("missing")).unwrap();
        assert!(!file.exists());
        assert!(!dir.exists());
    }
}
