//! Placing verified artifacts into the installation tree.
//!
//! Every unpack is all-or-nothing. Content is built in a hidden sibling of
//! the destination (`.<name>.unpacking`) and renamed into place only when
//! the whole artifact has been written. A failed or cancelled unpack removes
//! the sibling and leaves any previous destination untouched.

mod archive;
mod copy;
pub mod guard;

pub use archive::detect_format;
pub(crate) use copy::copy_tree;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{ArchiveFormat, ArtifactDescriptor, UnpackKind};
use crate::error::UnpackError;
use crate::layout::remove_path;

use archive::Extraction;
use guard::normalize_entry;

/// Counts of what an unpack wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackReport {
    pub files: u64,
    pub bytes: u64,
    pub links: u64,
}

/// What to do with one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackPlan {
    pub kind: UnpackKind,
    /// Archive format; sniffed from the artifact when `None`.
    pub format: Option<ArchiveFormat>,
    /// Normalised archive prefix to extract.
    pub strip_prefix: Option<PathBuf>,
}

impl UnpackPlan {
    pub fn new(kind: UnpackKind) -> Self {
        Self {
            kind,
            format: None,
            strip_prefix: None,
        }
    }

    pub fn for_descriptor(descriptor: &ArtifactDescriptor) -> Result<Self, UnpackError> {
        let strip_prefix = match &descriptor.strip_prefix {
            Some(prefix) => {
                let normalized =
                    normalize_entry(prefix).map_err(|_| UnpackError::PathTraversal {
                        entry: prefix.clone(),
                        root: PathBuf::from(&descriptor.dest_path),
                    })?;
                (!normalized.as_os_str().is_empty()).then_some(normalized)
            }
            None => None,
        };
        Ok(Self {
            kind: descriptor.unpack_kind,
            format: descriptor.archive_format,
            strip_prefix,
        })
    }
}

/// Unpacks artifacts, observing a cancellation token between entries.
#[derive(Debug, Clone, Default)]
pub struct Unpacker {
    cancel: CancellationToken,
}

impl Unpacker {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Place `artifact` at `destination` according to `plan`.
    ///
    /// For `single-file` the artifact is moved, for the other kinds it is
    /// read and left in place for the caller to clean up.
    pub fn unpack(
        &self,
        artifact: &Path,
        destination: &Path,
        plan: &UnpackPlan,
    ) -> Result<UnpackReport, UnpackError> {
        if self.cancel.is_cancelled() {
            return Err(UnpackError::Cancelled);
        }
        let parent = destination.parent().ok_or_else(|| {
            UnpackError::io(
                destination,
                io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"),
            )
        })?;
        fs::create_dir_all(parent).map_err(|e| UnpackError::io(parent, e))?;

        let work = sibling_path(destination, "unpacking");
        remove_path(&work).map_err(|e| UnpackError::io(&work, e))?;

        let report = match self.unpack_into(artifact, &work, destination, plan) {
            Ok(report) => report,
            Err(e) => {
                if let Err(cleanup) = remove_path(&work) {
                    warn!(path = %work.display(), error = %cleanup, "Failed to remove unpack work dir");
                }
                return Err(e);
            }
        };

        commit_into_place(&work, destination)?;
        info!(
            destination = %destination.display(),
            files = report.files,
            bytes = report.bytes,
            "Unpacked artifact"
        );
        Ok(report)
    }

    fn unpack_into(
        &self,
        artifact: &Path,
        work: &Path,
        destination: &Path,
        plan: &UnpackPlan,
    ) -> Result<UnpackReport, UnpackError> {
        match plan.kind {
            UnpackKind::SingleFile => {
                let bytes = copy::move_file(artifact, work)?;
                Ok(UnpackReport {
                    files: 1,
                    bytes,
                    links: 0,
                })
            }
            UnpackKind::Archive => {
                let format = match plan.format {
                    Some(format) => format,
                    None => detect_format(artifact)?,
                };
                Extraction {
                    archive: artifact,
                    work,
                    destination,
                    strip_prefix: plan.strip_prefix.as_deref(),
                    cancel: &self.cancel,
                }
                .run(format)
            }
            UnpackKind::DirectoryCopy => copy_tree(artifact, work, &self.cancel),
        }
    }
}

/// Hidden sibling of `path`: `<parent>/.<name>.<suffix>`.
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, suffix))
}

/// Swap a finished work tree into the destination.
///
/// An existing destination is moved aside first and restored if the final
/// rename fails.
fn commit_into_place(work: &Path, destination: &Path) -> Result<(), UnpackError> {
    let backup = sibling_path(destination, "replaced");
    remove_path(&backup).map_err(|e| UnpackError::io(&backup, e))?;

    let had_previous = fs::symlink_metadata(destination).is_ok();
    if had_previous {
        debug!(destination = %destination.display(), "Replacing existing destination");
        fs::rename(destination, &backup).map_err(|e| UnpackError::io(destination, e))?;
    }

    if let Err(e) = fs::rename(work, destination) {
        if had_previous {
            let _ = fs::rename(&backup, destination);
        }
        let _ = remove_path(work);
        return Err(UnpackError::io(destination, e));
    }

    if had_previous {
        if let Err(e) = remove_path(&backup) {
            warn!(path = %backup.display(), error = %e, "Failed to remove replaced destination");
        }
    }
    Ok(())
}

/// Apply archive permission bits to an extracted file.
#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<(), UnpackError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| UnpackError::io(path, e))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<(), UnpackError> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn create_symlink(target: &Path, link: &Path) -> Result<(), UnpackError> {
    std::os::unix::fs::symlink(target, link).map_err(|e| UnpackError::io(link, e))
}

#[cfg(windows)]
pub(crate) fn create_symlink(target: &Path, link: &Path) -> Result<(), UnpackError> {
    std::os::windows::fs::symlink_file(target, link).map_err(|e| UnpackError::io(link, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_sibling_path() {
        assert_eq!(
            sibling_path(Path::new("/root/python"), "unpacking"),
            PathBuf::from("/root/.python.unpacking")
        );
    }

    #[test]
    fn test_single_file_moves_artifact() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("tool.artifact");
        fs::write(&artifact, b"binary").unwrap();
        let dest = temp.path().join("install").join("bin").join("tool");

        let report = Unpacker::default()
            .unpack(&artifact, &dest, &UnpackPlan::new(UnpackKind::SingleFile))
            .unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(fs::read(&dest).unwrap(), b"binary");
        assert!(!artifact.exists());
    }

    #[test]
    fn test_archive_replaces_previous_destination() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("a.artifact");
        build_zip(&artifact, &[("new.txt", b"new")]);
        let dest = temp.path().join("app");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.txt"), b"old").unwrap();

        Unpacker::default()
            .unpack(&artifact, &dest, &UnpackPlan::new(UnpackKind::Archive))
            .unwrap();

        assert!(dest.join("new.txt").exists());
        assert!(!dest.join("stale.txt").exists());
        assert!(!temp.path().join(".app.unpacking").exists());
        assert!(!temp.path().join(".app.replaced").exists());
    }

    #[test]
    fn test_failed_unpack_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("evil.artifact");
        build_zip(&artifact, &[("fine.txt", b"ok"), ("../../escape.txt", b"x")]);
        let dest = temp.path().join("root").join("app");

        let err = Unpacker::default()
            .unpack(&artifact, &dest, &UnpackPlan::new(UnpackKind::Archive))
            .unwrap_err();

        assert!(matches!(err, UnpackError::PathTraversal { .. }));
        assert!(!dest.exists());
        assert!(!temp.path().join("root").join(".app.unpacking").exists());
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_bad_archive() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("junk.artifact");
        fs::write(&artifact, b"definitely not an archive").unwrap();

        let err = Unpacker::default()
            .unpack(
                &artifact,
                &temp.path().join("dest"),
                &UnpackPlan::new(UnpackKind::Archive),
            )
            .unwrap_err();
        assert!(matches!(err, UnpackError::BadArchive { .. }));
    }

    #[test]
    fn test_directory_copy() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("models.artifact");
        fs::create_dir_all(staged.join("v1")).unwrap();
        fs::write(staged.join("v1").join("weights.bin"), b"0101").unwrap();
        let dest = temp.path().join("models");

        let report = Unpacker::default()
            .unpack(&staged, &dest, &UnpackPlan::new(UnpackKind::DirectoryCopy))
            .unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(fs::read(dest.join("v1").join("weights.bin")).unwrap(), b"0101");
        assert!(staged.exists());
    }

    #[test]
    fn test_plan_from_descriptor_normalises_prefix() {
        let digest = crate::catalog::ContentDigest::of_bytes(
            crate::catalog::DigestAlgorithm::Sha256,
            b"x",
        );
        let descriptor = ArtifactDescriptor::new(
            "py",
            vec!["https://a/py.tgz".into()],
            digest,
            "python",
            UnpackKind::Archive,
        )
        .with_strip_prefix("./python-3.11/")
        .with_archive_format(ArchiveFormat::TarGz);

        let plan = UnpackPlan::for_descriptor(&descriptor).unwrap();
        assert_eq!(plan.strip_prefix, Some(PathBuf::from("python-3.11")));
        assert_eq!(plan.format, Some(ArchiveFormat::TarGz));
    }
}
