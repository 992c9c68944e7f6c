//! Rewriting embedded install paths.
//!
//! Packaged runtimes often embed their own location in launcher scripts and
//! path configuration files. Those files ship with a sentinel token in place
//! of the path; after unpacking, the relocator substitutes the real
//! installation root. When an installation is later moved, the root it was
//! relocated against becomes an extra marker so the same files can be
//! re-targeted.

mod transform;

pub use transform::{contains_marker, substitute};

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::RelocationError;
use crate::unpack::guard::check_entry;
use crate::unpack::sibling_path;

/// Default sentinel embedded in packaged files.
pub const DEFAULT_SENTINEL: &str = "@@INSTALL_ROOT@@";

/// Textual form of a root as written into relocated files.
pub fn root_marker(root: &Path) -> String {
    root.to_string_lossy().into_owned()
}

/// Files touched by one relocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationReport {
    pub rewritten: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
}

/// Applies relocation rules to installed content.
#[derive(Debug, Clone)]
pub struct Relocator {
    sentinel: String,
}

impl Default for Relocator {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINEL)
    }
}

impl Relocator {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
        }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Rewrite the files named by `rules` under `destination`.
    ///
    /// # Arguments
    ///
    /// * `destination` - Installed location of the descriptor
    /// * `rules` - Paths relative to `destination`; `"."` names a single-file destination
    /// * `install_root` - Root substituted for the markers
    /// * `previous_root` - Root the files were last relocated against, if any
    pub fn relocate(
        &self,
        destination: &Path,
        rules: &[String],
        install_root: &Path,
        previous_root: Option<&Path>,
    ) -> Result<RelocationReport, RelocationError> {
        let replacement = root_marker(install_root);
        let previous = previous_root.map(root_marker);
        let mut markers: Vec<&[u8]> = vec![self.sentinel.as_bytes()];
        if let Some(previous) = &previous {
            markers.push(previous.as_bytes());
        }

        let mut report = RelocationReport::default();
        for rule in rules {
            let path = check_entry(destination, rule).map_err(|_| RelocationError::UnsafeRule {
                rule: rule.clone(),
                destination: destination.to_path_buf(),
            })?;
            ensure_inside(destination, &path, rule)?;
            if self.relocate_file(&path, &markers, replacement.as_bytes())? {
                report.rewritten.push(path);
            } else {
                report.unchanged.push(path);
            }
        }

        info!(
            destination = %destination.display(),
            rewritten = report.rewritten.len(),
            unchanged = report.unchanged.len(),
            "Relocated files"
        );
        Ok(report)
    }

    /// Rewrite one file in place. Returns whether the content changed.
    fn relocate_file(
        &self,
        path: &Path,
        markers: &[&[u8]],
        replacement: &[u8],
    ) -> Result<bool, RelocationError> {
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RelocationError::MissingFile {
                path: path.to_path_buf(),
            },
            _ => RelocationError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        if !meta.is_file() {
            return Err(RelocationError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "relocation target is not a regular file",
                ),
            });
        }

        let content = fs::read(path).map_err(|e| RelocationError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let Some(rewritten) = substitute(&content, markers, replacement) else {
            debug!(path = %path.display(), "No markers found");
            return Ok(false);
        };

        write_atomic(path, &rewritten, meta.permissions())?;
        debug!(path = %path.display(), "Rewrote markers");
        Ok(true)
    }
}

/// Replace a file's content via a sibling temp file and rename.
fn write_atomic(
    path: &Path,
    content: &[u8],
    permissions: fs::Permissions,
) -> Result<(), RelocationError> {
    let temp = sibling_path(path, "relocating");
    let io_err = |e: std::io::Error| RelocationError::Io {
        path: path.to_path_buf(),
        source: e,
    };

    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);
        fs::set_permissions(&temp, permissions)?;
        fs::rename(&temp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(io_err(e));
    }
    Ok(())
}

/// Refuse a rule whose file resolves outside `destination` on disk.
///
/// A missing file passes here and is reported by the rewrite itself.
fn ensure_inside(destination: &Path, path: &Path, rule: &str) -> Result<(), RelocationError> {
    let (Ok(resolved), Ok(root)) = (path.canonicalize(), destination.canonicalize()) else {
        return Ok(());
    };
    if resolved.starts_with(&root) {
        Ok(())
    } else {
        Err(RelocationError::UnsafeRule {
            rule: rule.to_string(),
            destination: destination.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("python");
        for (name, content) in files {
            let path = dest.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        (temp, dest)
    }

    #[test]
    fn test_relocate_rewrites_sentinel() {
        let (temp, dest) = setup(&[
            ("bin/activate", "VIRTUAL_ENV=@@INSTALL_ROOT@@/python\n"),
            ("python311._pth", "@@INSTALL_ROOT@@/python/Lib\n.\n"),
        ]);
        let root = temp.path();

        let report = Relocator::default()
            .relocate(
                &dest,
                &["bin/activate".into(), "python311._pth".into()],
                root,
                None,
            )
            .unwrap();

        assert_eq!(report.rewritten.len(), 2);
        let activate = fs::read_to_string(dest.join("bin/activate")).unwrap();
        assert_eq!(activate, format!("VIRTUAL_ENV={}/python\n", root.display()));
    }

    #[test]
    fn test_relocate_twice_is_noop() {
        let (temp, dest) = setup(&[("cfg", "root=@@INSTALL_ROOT@@")]);
        let relocator = Relocator::default();
        let rules = vec!["cfg".to_string()];

        relocator.relocate(&dest, &rules, temp.path(), None).unwrap();
        let report = relocator.relocate(&dest, &rules, temp.path(), None).unwrap();
        assert!(report.rewritten.is_empty());
        assert_eq!(report.unchanged.len(), 1);
    }

    #[test]
    fn test_relocate_retargets_previous_root() {
        let (temp, dest) = setup(&[("cfg", "root=/old/install/python")]);
        let new_root = temp.path().join("new");

        Relocator::default()
            .relocate(
                &dest,
                &["cfg".into()],
                &new_root,
                Some(Path::new("/old/install")),
            )
            .unwrap();

        let content = fs::read_to_string(dest.join("cfg")).unwrap();
        assert_eq!(content, format!("root={}/python", new_root.display()));
    }

    #[test]
    fn test_missing_rule_target() {
        let (temp, dest) = setup(&[("present", "x")]);
        let err = Relocator::default()
            .relocate(&dest, &["absent".into()], temp.path(), None)
            .unwrap_err();
        assert!(matches!(err, RelocationError::MissingFile { .. }));
    }

    #[test]
    fn test_unsafe_rule_rejected() {
        let (temp, dest) = setup(&[("present", "x")]);
        let err = Relocator::default()
            .relocate(&dest, &["../../etc/hosts".into()], temp.path(), None)
            .unwrap_err();
        assert!(matches!(err, RelocationError::UnsafeRule { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_rule_through_outside_link_rejected() {
        let (temp, dest) = setup(&[("present", "x")]);
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("cfg"), "root=@@INSTALL_ROOT@@").unwrap();
        std::os::unix::fs::symlink(&outside, dest.join("etc")).unwrap();

        let err = Relocator::default()
            .relocate(&dest, &["etc/cfg".into()], temp.path(), None)
            .unwrap_err();
        assert!(matches!(err, RelocationError::UnsafeRule { .. }));
        assert_eq!(
            fs::read_to_string(outside.join("cfg")).unwrap(),
            "root=@@INSTALL_ROOT@@"
        );
    }

    #[test]
    fn test_single_file_rule() {
        let temp = TempDir::new().unwrap();
        let tool = temp.path().join("launcher.sh");
        fs::write(&tool, "exec @@INSTALL_ROOT@@/bin/app").unwrap();

        Relocator::default()
            .relocate(&tool, &[".".into()], Path::new("/srv/app"), None)
            .unwrap();
        assert_eq!(fs::read_to_string(&tool).unwrap(), "exec /srv/app/bin/app");
    }

    #[test]
    fn test_custom_sentinel() {
        let (temp, dest) = setup(&[("cfg", "home={{ROOT}}")]);
        Relocator::new("{{ROOT}}")
            .relocate(&dest, &["cfg".into()], Path::new("/x"), None)
            .unwrap();
        assert_eq!(fs::read_to_string(dest.join("cfg")).unwrap(), "home=/x");
        drop(temp);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, dest) = setup(&[("bin/run", "#!/bin/sh\ncd @@INSTALL_ROOT@@\n")]);
        let script = dest.join("bin/run");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();

        Relocator::default()
            .relocate(&dest, &["bin/run".into()], temp.path(), None)
            .unwrap();

        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
