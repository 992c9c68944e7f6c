//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use reqwest::Url;
use tempfile::TempDir;
use walkdir::WalkDir;

use provisionkit::catalog::{ArtifactDescriptor, Catalog, ContentDigest, DigestAlgorithm, UnpackKind};
use provisionkit::error::NetworkError;
use provisionkit::fetch::{FileTransport, RemoteBody, Transport};
use provisionkit::verify::Verifier;
use provisionkit::{PhaseEvent, ProgressObserver};

pub const SENTINEL: &str = "@@INSTALL_ROOT@@";

/// Temp directory holding artifact sources and installation roots.
pub struct Fixture {
    pub temp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sources")).unwrap();
        Self { temp }
    }

    pub fn sources(&self) -> PathBuf {
        self.temp.path().join("sources")
    }

    /// Path for an installation root; not created.
    pub fn root(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    pub fn write_source(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.sources().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    pub fn catalog_file(&self, catalog: &Catalog) -> PathBuf {
        let path = self.temp.path().join("catalog.json");
        fs::write(&path, catalog.to_json().unwrap()).unwrap();
        path
    }
}

pub fn file_url(path: &Path) -> String {
    Url::from_file_path(path).unwrap().to_string()
}

pub fn sha256(content: &[u8]) -> ContentDigest {
    ContentDigest::of_bytes(DigestAlgorithm::Sha256, content)
}

/// Single-file descriptor whose content is relocated.
pub fn single_file(key: &str, source: &Path, content: &[u8], dest: &str) -> ArtifactDescriptor {
    ArtifactDescriptor::new(
        key,
        vec![file_url(source)],
        sha256(content),
        dest,
        UnpackKind::SingleFile,
    )
    .with_size(content.len() as u64)
}

pub fn archive(key: &str, source: &Path, dest: &str, rules: &[&str]) -> ArtifactDescriptor {
    let content = fs::read(source).unwrap();
    ArtifactDescriptor::new(
        key,
        vec![file_url(source)],
        sha256(&content),
        dest,
        UnpackKind::Archive,
    )
    .with_size(content.len() as u64)
    .with_relocation_rules(rules.iter().map(|r| r.to_string()).collect())
}

pub fn directory(key: &str, source: &Path, dest: &str, rules: &[&str]) -> ArtifactDescriptor {
    let hex = Verifier::default()
        .digest(source, DigestAlgorithm::Sha256)
        .unwrap();
    let mut url = file_url(source);
    if !url.ends_with('/') {
        url.push('/');
    }
    ArtifactDescriptor::new(
        key,
        vec![url],
        ContentDigest::new(DigestAlgorithm::Sha256, &hex).unwrap(),
        dest,
        UnpackKind::DirectoryCopy,
    )
    .with_relocation_rules(rules.iter().map(|r| r.to_string()).collect())
}

pub fn build_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
    let file = File::create(path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

pub fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    for (name, content) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// Recursively copy a directory of regular files.
pub fn copy_dir(from: &Path, to: &Path) {
    for entry in WalkDir::new(from) {
        let entry = entry.unwrap();
        let relative = entry.path().strip_prefix(from).unwrap();
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).unwrap();
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Whether any file under `dir` contains `needle`.
pub fn tree_contains(dir: &Path, needle: &str) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            let content = fs::read(e.path()).unwrap();
            content
                .windows(needle.len())
                .any(|window| window == needle.as_bytes())
        })
}

/// Observer that keeps every event.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<PhaseEvent>>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn transitions_for(&self, key: &str) -> Vec<(provisionkit::Phase, provisionkit::Phase)> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.key == key)
            .map(|e| (e.from, e.to))
            .collect()
    }
}

impl ProgressObserver for Recorder {
    fn on_phase(&self, event: &PhaseEvent) {
        self.events.lock().push(event.clone());
    }
}

/// File transport that fails the first `failures` opens transiently.
pub struct FlakyTransport {
    failures: usize,
    opened: AtomicUsize,
}

impl FlakyTransport {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Transport for FlakyTransport {
    fn open(&self, url: &Url, offset: u64) -> Result<RemoteBody, NetworkError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(NetworkError::transient(url.as_str(), "HTTP 503 Service Unavailable"));
        }
        FileTransport.open(url, offset)
    }
}
