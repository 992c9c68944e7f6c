//! Artifact catalog.
//!
//! The catalog is the read-only input of a run: a map from descriptor key to
//! [`ArtifactDescriptor`]. It is loaded from JSON and validated once; after
//! that descriptors are never mutated.
//!
//! ```json
//! {
//!   "artifacts": {
//!     "python": {
//!       "urls": ["https://mirror-a/python.tar.gz", "https://mirror-b/python.tar.gz"],
//!       "digest": "sha256:...",
//!       "size": 26542080,
//!       "dest_path": "python",
//!       "unpack_kind": "archive",
//!       "strip_prefix": "python-3.11.9",
//!       "relocation_rules": ["bin/activate", "python311._pth"]
//!     }
//!   }
//! }
//! ```

mod digest;

pub use digest::{ContentDigest, DigestAlgorithm, StreamHasher};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::RESERVED_NAMES;
use crate::unpack::guard::{normalize_entry, Rejection};

/// URL schemes a descriptor may use.
pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "file"];

/// Errors raised while loading or validating a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid descriptor {key:?}: {reason}")]
    InvalidDescriptor { key: String, reason: String },

    #[error("destinations of {outer:?} and {inner:?} overlap")]
    OverlappingDestinations { outer: String, inner: String },
}

/// How a verified artifact becomes installed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnpackKind {
    /// The artifact is the installed file.
    SingleFile,
    /// The artifact is a zip, tar or tar.gz archive.
    Archive,
    /// The artifact is a directory tree copied as-is.
    DirectoryCopy,
}

/// Archive container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

/// One artifact to fetch and install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Catalog key; filled from the map key on load.
    #[serde(skip)]
    pub key: String,

    /// Candidate sources, tried in order.
    pub urls: Vec<String>,

    pub digest: ContentDigest,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Destination relative to the installation root.
    pub dest_path: String,

    pub unpack_kind: UnpackKind,

    /// Files (relative to `dest_path`) that embed the install-root sentinel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relocation_rules: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_format: Option<ArchiveFormat>,

    /// Archive subtree to extract; the prefix itself is dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<String>,
}

impl ArtifactDescriptor {
    /// Create a descriptor with no relocation rules or archive options.
    pub fn new(
        key: impl Into<String>,
        urls: Vec<String>,
        digest: ContentDigest,
        dest_path: impl Into<String>,
        unpack_kind: UnpackKind,
    ) -> Self {
        Self {
            key: key.into(),
            urls,
            digest,
            size: None,
            dest_path: dest_path.into(),
            unpack_kind,
            relocation_rules: Vec::new(),
            archive_format: None,
            strip_prefix: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_relocation_rules(mut self, rules: Vec<String>) -> Self {
        self.relocation_rules = rules;
        self
    }

    pub fn with_archive_format(mut self, format: ArchiveFormat) -> Self {
        self.archive_format = Some(format);
        self
    }

    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    /// Normalised destination relative to the installation root.
    pub fn relative_destination(&self) -> Result<PathBuf, Rejection> {
        normalize_entry(&self.dest_path)
    }

    fn invalid(&self, reason: impl Into<String>) -> CatalogError {
        CatalogError::InvalidDescriptor {
            key: self.key.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.key.is_empty()
            || !self
                .key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        {
            return Err(self.invalid("key must match [A-Za-z0-9._-]+"));
        }
        if self.key == "." || self.key == ".." {
            return Err(self.invalid("key may not be a relative path component"));
        }

        if self.urls.is_empty() {
            return Err(self.invalid("at least one source URL is required"));
        }
        for url in &self.urls {
            let parsed =
                Url::parse(url).map_err(|e| self.invalid(format!("bad URL {:?}: {}", url, e)))?;
            if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
                return Err(self.invalid(format!("unsupported URL scheme {:?}", parsed.scheme())));
            }
            if self.unpack_kind == UnpackKind::DirectoryCopy && parsed.scheme() != "file" {
                return Err(self.invalid("directory-copy sources must be file:// URLs"));
            }
        }

        let destination = self
            .relative_destination()
            .map_err(|r| self.invalid(format!("dest_path {:?}: {}", self.dest_path, r)))?;
        let first = destination
            .components()
            .next()
            .ok_or_else(|| self.invalid("dest_path may not be the installation root"))?;
        if RESERVED_NAMES
            .iter()
            .any(|name| first.as_os_str() == std::ffi::OsStr::new(name))
        {
            return Err(self.invalid(format!("dest_path {:?} is reserved", self.dest_path)));
        }

        for rule in &self.relocation_rules {
            let normalized = normalize_entry(rule)
                .map_err(|r| self.invalid(format!("relocation rule {:?}: {}", rule, r)))?;
            let names_destination = normalized.as_os_str().is_empty();
            match self.unpack_kind {
                UnpackKind::SingleFile if !names_destination => {
                    return Err(self.invalid("single-file relocation rules must be \".\""));
                }
                UnpackKind::Archive | UnpackKind::DirectoryCopy if names_destination => {
                    return Err(self.invalid(format!(
                        "relocation rule {:?} names the destination directory",
                        rule
                    )));
                }
                _ => {}
            }
        }

        if self.unpack_kind != UnpackKind::Archive
            && (self.archive_format.is_some() || self.strip_prefix.is_some())
        {
            return Err(self.invalid("archive_format and strip_prefix require unpack_kind archive"));
        }
        if let Some(prefix) = &self.strip_prefix {
            normalize_entry(prefix)
                .map_err(|r| self.invalid(format!("strip_prefix {:?}: {}", prefix, r)))?;
        }

        Ok(())
    }
}

/// Validated set of descriptors, keyed and ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    artifacts: BTreeMap<String, ArtifactDescriptor>,
}

impl Catalog {
    /// Load and validate a catalog file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = fs::read_to_string(path).map_err(|e| CatalogError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let mut catalog: Catalog = serde_json::from_str(json)?;
        for (key, descriptor) in catalog.artifacts.iter_mut() {
            descriptor.key = key.clone();
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// Build a catalog from descriptors; keys come from each descriptor.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ArtifactDescriptor>,
    ) -> Result<Self, CatalogError> {
        let mut artifacts = BTreeMap::new();
        for descriptor in descriptors {
            if artifacts.contains_key(&descriptor.key) {
                return Err(CatalogError::InvalidDescriptor {
                    key: descriptor.key,
                    reason: "duplicate key".to_string(),
                });
            }
            artifacts.insert(descriptor.key.clone(), descriptor);
        }
        let catalog = Self { artifacts };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn to_json(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn get(&self, key: &str) -> Option<&ArtifactDescriptor> {
        self.artifacts.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.artifacts.values()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut destinations: Vec<(PathBuf, &str)> = Vec::with_capacity(self.artifacts.len());
        for descriptor in self.artifacts.values() {
            descriptor.validate()?;
            // validate() has already rejected unsafe destinations
            if let Ok(destination) = descriptor.relative_destination() {
                destinations.push((destination, descriptor.key.as_str()));
            }
        }

        // Sorted paths put every ancestor directly before its descendants.
        destinations.sort();
        for pair in destinations.windows(2) {
            let (outer_path, outer) = &pair[0];
            let (inner_path, inner) = &pair[1];
            if inner_path.starts_with(outer_path) {
                return Err(CatalogError::OverlappingDestinations {
                    outer: outer.to_string(),
                    inner: inner.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> ContentDigest {
        ContentDigest::of_bytes(DigestAlgorithm::Sha256, b"payload")
    }

    fn descriptor(key: &str, dest: &str) -> ArtifactDescriptor {
        ArtifactDescriptor::new(
            key,
            vec![format!("https://example.com/{}.zip", key)],
            digest(),
            dest,
            UnpackKind::Archive,
        )
    }

    #[test]
    fn test_from_json() {
        let json = format!(
            r#"{{
                "artifacts": {{
                    "python": {{
                        "urls": ["https://a/python.tar.gz", "file:///mirror/python.tar.gz"],
                        "digest": "{}",
                        "size": 7,
                        "dest_path": "python",
                        "unpack_kind": "archive",
                        "archive_format": "tar-gz",
                        "strip_prefix": "python-3.11",
                        "relocation_rules": ["bin/activate"]
                    }},
                    "ffmpeg": {{
                        "urls": ["https://a/ffmpeg"],
                        "digest": "{}",
                        "dest_path": "tools/ffmpeg",
                        "unpack_kind": "single-file",
                        "relocation_rules": ["."]
                    }}
                }}
            }}"#,
            digest(),
            digest()
        );

        let catalog = Catalog::from_json(&json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.keys().collect::<Vec<_>>(), vec!["ffmpeg", "python"]);

        let python = catalog.get("python").unwrap();
        assert_eq!(python.key, "python");
        assert_eq!(python.size, Some(7));
        assert_eq!(python.archive_format, Some(ArchiveFormat::TarGz));
        assert_eq!(python.strip_prefix.as_deref(), Some("python-3.11"));

        let ffmpeg = catalog.get("ffmpeg").unwrap();
        assert_eq!(ffmpeg.unpack_kind, UnpackKind::SingleFile);
        assert_eq!(ffmpeg.size, None);
    }

    #[test]
    fn test_json_round_trip_keeps_keys() {
        let catalog = Catalog::from_descriptors(vec![descriptor("a", "a")]).unwrap();
        let reloaded = Catalog::from_json(&catalog.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, catalog);
    }

    #[test]
    fn test_rejects_bad_key() {
        let err = Catalog::from_descriptors(vec![descriptor("has space", "a")]).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_rejects_empty_urls_and_bad_scheme() {
        let mut d = descriptor("a", "a");
        d.urls.clear();
        assert!(Catalog::from_descriptors(vec![d]).is_err());

        let mut d = descriptor("a", "a");
        d.urls = vec!["ftp://host/a.zip".to_string()];
        assert!(Catalog::from_descriptors(vec![d]).is_err());
    }

    #[test]
    fn test_rejects_unsafe_destinations() {
        for dest in ["../outside", "/abs", "C:\\x", ".", ".staging/x", ".install-manifest"] {
            let result = Catalog::from_descriptors(vec![descriptor("a", dest)]);
            assert!(result.is_err(), "{} should be rejected", dest);
        }
    }

    #[test]
    fn test_rejects_nested_destinations() {
        let err =
            Catalog::from_descriptors(vec![descriptor("outer", "env"), descriptor("inner", "env/lib")])
                .unwrap_err();
        assert!(matches!(
            err,
            CatalogError::OverlappingDestinations { ref outer, ref inner }
                if outer == "outer" && inner == "inner"
        ));

        assert!(Catalog::from_descriptors(vec![
            descriptor("a", "env"),
            descriptor("b", "env2"),
            descriptor("c", "envx/lib"),
        ])
        .is_ok());
    }

    #[test]
    fn test_rejects_duplicate_destination() {
        assert!(
            Catalog::from_descriptors(vec![descriptor("a", "same"), descriptor("b", "./same")])
                .is_err()
        );
    }

    #[test]
    fn test_relocation_rule_shape() {
        let single = ArtifactDescriptor::new(
            "tool",
            vec!["https://a/tool".into()],
            digest(),
            "bin/tool",
            UnpackKind::SingleFile,
        );
        assert!(Catalog::from_descriptors(vec![single
            .clone()
            .with_relocation_rules(vec![".".into()])])
        .is_ok());
        assert!(Catalog::from_descriptors(vec![
            single.with_relocation_rules(vec!["other".into()])
        ])
        .is_err());

        let archive = descriptor("a", "a").with_relocation_rules(vec!["../escape".into()]);
        assert!(Catalog::from_descriptors(vec![archive]).is_err());
    }

    #[test]
    fn test_archive_options_require_archive_kind() {
        let mut d = descriptor("a", "a").with_strip_prefix("top");
        d.unpack_kind = UnpackKind::SingleFile;
        assert!(Catalog::from_descriptors(vec![d]).is_err());
    }

    #[test]
    fn test_directory_copy_requires_file_urls() {
        let mut d = descriptor("a", "a");
        d.unpack_kind = UnpackKind::DirectoryCopy;
        assert!(Catalog::from_descriptors(vec![d.clone()]).is_err());

        d.urls = vec!["file:///srv/models/a".into()];
        assert!(Catalog::from_descriptors(vec![d]).is_ok());
    }
}
