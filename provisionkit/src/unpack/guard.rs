//! Path traversal guard.
//!
//! Every path taken from untrusted input (archive entry names, link targets,
//! catalog destinations, relocation rules) is resolved here before it touches
//! the filesystem. Resolution is purely lexical: the filesystem is never
//! consulted, so a verdict depends only on the inputs. Symlinks created by
//! the same extraction are passed in explicitly, since a lexical `..` after a
//! symlink component does not match what the filesystem resolves.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Why a path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Rooted path, UNC path or drive prefix.
    Absolute,
    /// `..` components climb above the root.
    EscapesRoot,
    /// NUL byte in a component.
    InvalidComponent,
    /// Steps through a symlink of the same tree before its last component.
    ThroughLink,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute => write!(f, "absolute path"),
            Self::EscapesRoot => write!(f, "path escapes root"),
            Self::InvalidComponent => write!(f, "invalid path component"),
            Self::ThroughLink => write!(f, "path passes through a symlink"),
        }
    }
}

/// Normalise an untrusted relative path.
///
/// Backslashes are treated as separators, `.` and empty components are
/// dropped and `..` pops the previous component. The result is relative and
/// free of `..`; it is empty when the input names the root itself.
pub fn normalize_entry(entry: &str) -> Result<PathBuf, Rejection> {
    let unified = entry.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(Rejection::Absolute);
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Rejection::EscapesRoot);
                }
            }
            other if other.contains('\0') => return Err(Rejection::InvalidComponent),
            other => parts.push(other),
        }
    }

    Ok(parts.iter().collect())
}

/// Resolve an untrusted entry against a destination root.
///
/// Returns the joined path when the entry stays inside `root`.
pub fn check_entry(root: &Path, entry: &str) -> Result<PathBuf, Rejection> {
    let relative = normalize_entry(entry)?;
    if relative.as_os_str().is_empty() {
        // joining an empty path would append a trailing separator
        return Ok(root.to_path_buf());
    }
    Ok(root.join(relative))
}

/// Resolve a link target relative to the link's own location.
///
/// `link` is the link's normalised path relative to the root (as returned by
/// [`normalize_entry`]); `target` is the raw target stored in the archive.
/// Absolute targets are refused outright. The result is the target's
/// location relative to the root.
pub fn check_link_target(link: &Path, target: &str) -> Result<PathBuf, Rejection> {
    check_link_target_within(link, target, &BTreeSet::new())
}

/// [`check_link_target`] for a tree that also holds the symlinks in `links`.
///
/// The target is walked component by component; reaching one of `links`
/// with components still to go is refused, because the filesystem would
/// follow that link before applying the rest.
pub fn check_link_target_within(
    link: &Path,
    target: &str,
    links: &BTreeSet<PathBuf>,
) -> Result<PathBuf, Rejection> {
    let unified = target.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Err(Rejection::Absolute);
    }

    let mut parts: Vec<String> = Vec::new();
    if let Some(parent) = link.parent() {
        for component in parent.components() {
            match component {
                Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
                _ => return Err(Rejection::InvalidComponent),
            }
        }
    }
    parts.extend(
        unified
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .map(str::to_string),
    );

    let mut resolved = PathBuf::new();
    for (i, part) in parts.iter().enumerate() {
        if part == ".." {
            if !resolved.pop() {
                return Err(Rejection::EscapesRoot);
            }
            continue;
        }
        if part.contains('\0') {
            return Err(Rejection::InvalidComponent);
        }
        resolved.push(part);
        if i + 1 < parts.len() && links.contains(&resolved) {
            return Err(Rejection::ThroughLink);
        }
    }
    Ok(resolved)
}

/// Whether a normalised path has one of `links` as a proper ancestor.
pub fn passes_through_link(path: &Path, links: &BTreeSet<PathBuf>) -> bool {
    path.ancestors()
        .skip(1)
        .any(|ancestor| !ancestor.as_os_str().is_empty() && links.contains(ancestor))
}

/// Returns true for `C:`-style prefixes.
fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
