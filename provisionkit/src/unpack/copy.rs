//! Directory-tree copies and single-file moves.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::guard::check_link_target_within;
use super::{create_symlink, UnpackReport};
use crate::error::UnpackError;

/// Copy a directory tree into `dest`.
///
/// Symlinks are recreated as links, never followed, and their targets must
/// stay inside the tree without stepping through another link of the tree.
/// Regular files keep their permission bits.
pub(crate) fn copy_tree(
    src: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<UnpackReport, UnpackError> {
    let meta = fs::symlink_metadata(src).map_err(|e| UnpackError::io(src, e))?;
    if !meta.is_dir() {
        return Err(UnpackError::io(
            src,
            io::Error::new(io::ErrorKind::InvalidInput, "source is not a directory"),
        ));
    }
    let links = tree_links(src)?;
    fs::create_dir_all(dest).map_err(|e| UnpackError::io(dest, e))?;

    let mut report = UnpackReport::default();
    for entry in WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        if cancel.is_cancelled() {
            return Err(UnpackError::Cancelled);
        }
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            UnpackError::io(path, e.into())
        })?;
        let relative = entry.path().strip_prefix(src).map_err(|_| {
            UnpackError::io(
                entry.path(),
                io::Error::new(io::ErrorKind::InvalidInput, "entry outside source tree"),
            )
        })?;
        let out = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&out).map_err(|e| UnpackError::io(&out, e))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path()).map_err(|e| UnpackError::io(entry.path(), e))?;
            let target_str = target.to_string_lossy();
            check_link_target_within(relative, &target_str, &links).map_err(|_| {
                UnpackError::PathTraversal {
                    entry: format!("{} -> {}", relative.display(), target_str),
                    root: dest.to_path_buf(),
                }
            })?;
            create_symlink(&target, &out)?;
            report.links += 1;
        } else {
            // fs::copy carries permission bits across
            report.bytes += fs::copy(entry.path(), &out).map_err(|e| UnpackError::io(&out, e))?;
            report.files += 1;
        }
    }

    Ok(report)
}

/// Relative paths of every symlink under `src`.
fn tree_links(src: &Path) -> Result<BTreeSet<PathBuf>, UnpackError> {
    let mut links = BTreeSet::new();
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            UnpackError::io(path, e.into())
        })?;
        if entry.file_type().is_symlink() {
            if let Ok(relative) = entry.path().strip_prefix(src) {
                links.insert(relative.to_path_buf());
            }
        }
    }
    Ok(links)
}

/// Move a file, falling back to copy-and-delete across filesystems.
pub(crate) fn move_file(src: &Path, dest: &Path) -> Result<u64, UnpackError> {
    let len = fs::metadata(src).map_err(|e| UnpackError::io(src, e))?.len();
    if fs::rename(src, dest).is_ok() {
        return Ok(len);
    }
    fs::copy(src, dest).map_err(|e| UnpackError::io(dest, e))?;
    fs::remove_file(src).map_err(|e| UnpackError::io(src, e))?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested/deeper")).unwrap();
        fs::write(src.join("top.txt"), b"top").unwrap();
        fs::write(src.join("nested/deeper/leaf.bin"), b"leaf").unwrap();
        fs::create_dir_all(src.join("empty")).unwrap();

        let dest = temp.path().join("dest");
        let report = copy_tree(&src, &dest, &CancellationToken::new()).unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.bytes, 7);
        assert_eq!(fs::read(dest.join("nested/deeper/leaf.bin")).unwrap(), b"leaf");
        assert!(dest.join("empty").is_dir());
    }

    #[test]
    fn test_copy_tree_requires_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, b"x").unwrap();
        let err = copy_tree(&file, &temp.path().join("out"), &CancellationToken::new());
        assert!(matches!(err, Err(UnpackError::Io { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_keeps_internal_links() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool-1.2"), b"tool").unwrap();
        std::os::unix::fs::symlink("tool-1.2", src.join("bin/tool")).unwrap();

        let dest = temp.path().join("dest");
        let report = copy_tree(&src, &dest, &CancellationToken::new()).unwrap();

        assert_eq!(report.links, 1);
        let link = fs::symlink_metadata(dest.join("bin/tool")).unwrap();
        assert!(link.file_type().is_symlink());
        assert_eq!(fs::read(dest.join("bin/tool")).unwrap(), b"tool");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_rejects_escaping_links() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        std::os::unix::fs::symlink("../../secret", src.join("leak")).unwrap();

        let err = copy_tree(&src, &temp.path().join("dest"), &CancellationToken::new());
        assert!(matches!(err, Err(UnpackError::PathTraversal { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_rejects_link_chain() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        std::os::unix::fs::symlink(".", src.join("y")).unwrap();
        std::os::unix::fs::symlink("y/..", src.join("x")).unwrap();

        let err = copy_tree(&src, &temp.path().join("dest"), &CancellationToken::new());
        assert!(matches!(err, Err(UnpackError::PathTraversal { .. })));
    }

    #[test]
    fn test_move_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a");
        let dest = temp.path().join("b");
        fs::write(&src, b"abc").unwrap();

        assert_eq!(move_file(&src, &dest).unwrap(), 3);
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
    }
}
