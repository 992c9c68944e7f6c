//! Zip and tar extraction.
//!
//! Extraction runs in two passes over the archive. The first pass resolves
//! every entry name and link target through the traversal guard without
//! writing anything; a single unsafe entry rejects the whole archive. Link
//! targets are checked against every symlink in the archive, and no entry
//! may be placed beneath one. The second pass writes the planned entries into
//! the work directory and refuses to write through a symlink found on disk.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use zip::ZipArchive;

use super::guard::{check_link_target_within, normalize_entry, passes_through_link};
use super::{create_symlink, set_mode, UnpackReport};
use crate::catalog::ArchiveFormat;
use crate::error::UnpackError;

/// Bytes needed to recognise every supported format.
const SNIFF_LEN: usize = 262;

/// Offset of the `ustar` magic in a tar header.
const USTAR_MAGIC_OFFSET: usize = 257;

/// Metadata directories and files produced by macOS archivers.
const METADATA_DIR: &str = "__MACOSX";
const METADATA_FILE: &str = ".DS_Store";

/// Sniff the archive format from leading magic bytes.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat, UnpackError> {
    let file = File::open(path).map_err(|e| UnpackError::io(path, e))?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64)
        .read_to_end(&mut header)
        .map_err(|e| UnpackError::io(path, e))?;

    sniff_format(&header).ok_or_else(|| UnpackError::BadArchive {
        path: path.to_path_buf(),
        reason: "unrecognised archive format".to_string(),
    })
}

pub(crate) fn sniff_format(header: &[u8]) -> Option<ArchiveFormat> {
    if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        Some(ArchiveFormat::Zip)
    } else if header.starts_with(&[0x1f, 0x8b]) {
        Some(ArchiveFormat::TarGz)
    } else if header.len() >= USTAR_MAGIC_OFFSET + 5
        && &header[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5] == b"ustar"
    {
        Some(ArchiveFormat::Tar)
    } else {
        None
    }
}

#[derive(Debug)]
enum EntryKind {
    Directory,
    File,
    Symlink(String),
    HardLink(PathBuf),
}

#[derive(Debug)]
struct PlannedEntry {
    index: usize,
    relative: PathBuf,
    kind: EntryKind,
    mode: Option<u32>,
}

/// One extraction of an archive into a work directory.
pub(crate) struct Extraction<'a> {
    pub archive: &'a Path,
    pub work: &'a Path,
    /// Final destination, used in error messages.
    pub destination: &'a Path,
    pub strip_prefix: Option<&'a Path>,
    pub cancel: &'a CancellationToken,
}

impl Extraction<'_> {
    pub fn run(&self, format: ArchiveFormat) -> Result<UnpackReport, UnpackError> {
        fs::create_dir_all(self.work).map_err(|e| UnpackError::io(self.work, e))?;
        debug!(
            archive = %self.archive.display(),
            format = ?format,
            "Extracting archive"
        );
        match format {
            ArchiveFormat::Zip => self.extract_zip(),
            ArchiveFormat::Tar | ArchiveFormat::TarGz => self.extract_tar(format),
        }
    }

    fn extract_zip(&self) -> Result<UnpackReport, UnpackError> {
        let file = File::open(self.archive).map_err(|e| UnpackError::io(self.archive, e))?;
        let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| self.bad(e))?;

        let mut plan = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(|e| self.bad(e))?;
            let name = entry.name().to_string();
            let Some(relative) = self.map_entry(&name)? else {
                continue;
            };
            let mode = entry.unix_mode();
            let kind = if entry.is_dir() {
                EntryKind::Directory
            } else if mode.map_or(false, is_symlink_mode) {
                let mut target = String::new();
                entry
                    .read_to_string(&mut target)
                    .map_err(|e| self.bad(e))?;
                EntryKind::Symlink(target)
            } else {
                EntryKind::File
            };
            plan.push(PlannedEntry {
                index,
                relative,
                kind,
                mode,
            });
        }

        self.check_plan(&plan.iter().collect::<Vec<_>>())?;

        let mut report = UnpackReport::default();
        for planned in plan {
            self.check_cancelled()?;
            let out = self.output_path(&planned.relative)?;
            match &planned.kind {
                EntryKind::File => {
                    let mut entry = zip.by_index(planned.index).map_err(|e| self.bad(e))?;
                    report.bytes += write_entry(&mut entry, &out)?;
                    report.files += 1;
                }
                _ => self.write_non_file(&planned, &out, &mut report)?,
            }
            if let (EntryKind::File, Some(mode)) = (&planned.kind, planned.mode) {
                set_mode(&out, mode)?;
            }
        }
        Ok(report)
    }

    fn open_tar(&self, format: ArchiveFormat) -> Result<tar::Archive<Box<dyn Read>>, UnpackError> {
        let file = File::open(self.archive).map_err(|e| UnpackError::io(self.archive, e))?;
        let reader: Box<dyn Read> = match format {
            ArchiveFormat::TarGz => Box::new(GzDecoder::new(BufReader::new(file))),
            _ => Box::new(BufReader::new(file)),
        };
        Ok(tar::Archive::new(reader))
    }

    fn extract_tar(&self, format: ArchiveFormat) -> Result<UnpackReport, UnpackError> {
        // Pass one: plan every entry, in archive order.
        let mut archive = self.open_tar(format)?;
        let mut plan: Vec<Option<PlannedEntry>> = Vec::new();
        for (index, entry) in archive.entries().map_err(|e| self.bad(e))?.enumerate() {
            let entry = entry.map_err(|e| self.bad(e))?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let Some(relative) = self.map_entry(&name)? else {
                plan.push(None);
                continue;
            };
            let header = entry.header();
            let entry_type = header.entry_type();
            let link_name = entry
                .link_name_bytes()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

            let kind = if entry_type.is_dir() {
                Some(EntryKind::Directory)
            } else if entry_type.is_symlink() {
                Some(EntryKind::Symlink(link_name.unwrap_or_default()))
            } else if entry_type.is_hard_link() {
                let target = link_name.unwrap_or_default();
                let resolved = self.map_entry(&target)?.ok_or_else(|| UnpackError::BadArchive {
                    path: self.archive.to_path_buf(),
                    reason: format!("hard link {:?} points outside the extracted tree", name),
                })?;
                Some(EntryKind::HardLink(resolved))
            } else if entry_type.is_file() || entry_type.is_contiguous() {
                Some(EntryKind::File)
            } else {
                trace!(entry = %name, entry_type = ?entry_type, "Skipping tar entry");
                None
            };
            plan.push(kind.map(|kind| PlannedEntry {
                index,
                relative,
                kind,
                mode: header.mode().ok(),
            }));
        }

        self.check_plan(&plan.iter().flatten().collect::<Vec<_>>())?;

        // Pass two: write.
        let mut archive = self.open_tar(format)?;
        let mut report = UnpackReport::default();
        let mut planned_iter = plan.into_iter();
        for entry in archive.entries().map_err(|e| self.bad(e))? {
            let mut entry = entry.map_err(|e| self.bad(e))?;
            let Some(Some(planned)) = planned_iter.next() else {
                continue;
            };
            self.check_cancelled()?;
            let out = self.output_path(&planned.relative)?;
            match &planned.kind {
                EntryKind::File => {
                    report.bytes += write_entry(&mut entry, &out)?;
                    report.files += 1;
                    if let Some(mode) = planned.mode {
                        set_mode(&out, mode)?;
                    }
                }
                _ => self.write_non_file(&planned, &out, &mut report)?,
            }
        }
        Ok(report)
    }

    fn write_non_file(
        &self,
        planned: &PlannedEntry,
        out: &Path,
        report: &mut UnpackReport,
    ) -> Result<(), UnpackError> {
        match &planned.kind {
            EntryKind::Directory => {
                fs::create_dir_all(out).map_err(|e| UnpackError::io(out, e))?;
            }
            EntryKind::Symlink(target) => {
                ensure_parent(out)?;
                replace_existing(out)?;
                create_symlink(Path::new(target), out)?;
                report.links += 1;
            }
            EntryKind::HardLink(target) => {
                ensure_parent(out)?;
                replace_existing(out)?;
                let source = self.output_path(target)?;
                fs::hard_link(&source, out).map_err(|e| UnpackError::io(out, e))?;
                report.links += 1;
            }
            EntryKind::File => {}
        }
        Ok(())
    }

    /// Resolve an archive entry name to its location under the work root.
    ///
    /// Returns `None` for entries that are skipped: macOS metadata, entries
    /// outside `strip_prefix`, and the prefix directory itself.
    fn map_entry(&self, name: &str) -> Result<Option<PathBuf>, UnpackError> {
        let normalized = normalize_entry(name).map_err(|_| self.traversal(name))?;
        if is_metadata(&normalized) {
            return Ok(None);
        }
        let relative = match self.strip_prefix {
            Some(prefix) => match normalized.strip_prefix(prefix) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => return Ok(None),
            },
            None => normalized,
        };
        if relative.as_os_str().is_empty() {
            return Ok(None);
        }
        Ok(Some(relative))
    }

    /// Check every planned entry against the symlinks the plan creates.
    fn check_plan(&self, plan: &[&PlannedEntry]) -> Result<(), UnpackError> {
        let links: BTreeSet<PathBuf> = plan
            .iter()
            .filter(|planned| matches!(planned.kind, EntryKind::Symlink(_)))
            .map(|planned| planned.relative.clone())
            .collect();

        for planned in plan {
            let link = &planned.relative;
            if passes_through_link(link, &links) {
                return Err(self.traversal(&link.to_string_lossy()));
            }
            match &planned.kind {
                EntryKind::Symlink(target) => {
                    check_link_target_within(link, target, &links).map_err(|_| {
                        self.traversal(&format!("{} -> {}", link.display(), target))
                    })?;
                }
                // a hard link to a symlink would reinterpret its target from
                // the new location
                EntryKind::HardLink(target)
                    if links.contains(target) || passes_through_link(target, &links) =>
                {
                    return Err(self.traversal(&format!(
                        "{} => {}",
                        link.display(),
                        target.display()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Location of `relative` under the work root.
    ///
    /// Fails when a directory on the way is a symlink on disk.
    fn output_path(&self, relative: &Path) -> Result<PathBuf, UnpackError> {
        let mut current = self.work.to_path_buf();
        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                current.push(component);
                let is_link = fs::symlink_metadata(&current)
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if is_link {
                    return Err(self.traversal(&relative.to_string_lossy()));
                }
            }
        }
        Ok(self.work.join(relative))
    }

    fn check_cancelled(&self) -> Result<(), UnpackError> {
        if self.cancel.is_cancelled() {
            Err(UnpackError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn traversal(&self, entry: &str) -> UnpackError {
        UnpackError::PathTraversal {
            entry: entry.to_string(),
            root: self.destination.to_path_buf(),
        }
    }

    fn bad(&self, reason: impl std::fmt::Display) -> UnpackError {
        UnpackError::BadArchive {
            path: self.archive.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o120000
}

fn is_metadata(path: &Path) -> bool {
    path.components()
        .any(|c| c == Component::Normal(OsStr::new(METADATA_DIR)))
        || path.file_name().map_or(false, |name| name == METADATA_FILE)
}

fn ensure_parent(path: &Path) -> Result<(), UnpackError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| UnpackError::io(parent, e))?;
    }
    Ok(())
}

fn replace_existing(path: &Path) -> Result<(), UnpackError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path).map_err(|e| UnpackError::io(path, e)),
        _ => Ok(()),
    }
}

fn write_entry(reader: &mut impl Read, out: &Path) -> Result<u64, UnpackError> {
    ensure_parent(out)?;
    replace_existing(out)?;
    let mut file = File::create(out).map_err(|e| UnpackError::io(out, e))?;
    io::copy(reader, &mut file).map_err(|e| UnpackError::io(out, e))
}
