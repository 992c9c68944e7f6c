//! Persisted install manifest.
//!
//! One manifest lives at the top of every installation root and records,
//! per descriptor, how far the pipeline got. It is the only durable state a
//! run relies on: `resume`, `status` and `relocate` all start from it.
//!
//! Phases: PENDING → FETCHED → VERIFIED → UNPACKED → RELOCATED → DONE, with
//! FAILED reachable from every non-terminal phase.

mod store;

pub use store::ManifestStore;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{Catalog, ContentDigest};
use crate::error::{FailureKind, ProvisionError, ProvisionResult};

/// Schema version written to and accepted from `.install-manifest`.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle phase of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Pending,
    Fetched,
    Verified,
    Unpacked,
    Relocated,
    Done,
    Failed,
}

impl Phase {
    /// Check if moving from this phase to `target` is allowed.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        use Phase::*;
        match (self, target) {
            // forward, one step at a time
            (Pending, Fetched)
            | (Fetched, Verified)
            | (Verified, Unpacked)
            | (Unpacked, Relocated)
            | (Relocated, Done) => true,

            // integrity reset, re-derivation or repair
            (Fetched | Verified | Unpacked | Relocated | Done, Pending) => true,

            // explicit retry at the start of a run
            (Failed, Pending) => true,

            (Pending | Fetched | Verified | Unpacked | Relocated, Failed) => true,

            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetched => "fetched",
            Self::Verified => "verified",
            Self::Unpacked => "unpacked",
            Self::Relocated => "relocated",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Overall status of an installation root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    InProgress,
    Complete,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in-progress"),
            Self::Complete => write!(f, "complete"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Progress of one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub key: String,
    pub phase: Phase,

    /// Catalog digest this record was produced against.
    pub digest: ContentDigest,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    /// Bytes of the partial download committed so far.
    #[serde(default)]
    pub resume_offset: u64,

    /// Fetch passes consumed in the current budget.
    #[serde(default)]
    pub attempts: u32,

    /// Root the relocation rules were last applied against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocated_root: Option<PathBuf>,

    /// Tree digest of the installed content, captured at DONE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(key: impl Into<String>, digest: ContentDigest) -> Self {
        Self {
            key: key.into(),
            phase: Phase::Pending,
            digest,
            last_error: None,
            failure_kind: None,
            resume_offset: 0,
            attempts: 0,
            relocated_root: None,
            fingerprint: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `target`, refusing invalid transitions.
    pub fn transition(&mut self, target: Phase) -> ProvisionResult<Phase> {
        if !self.phase.can_transition_to(target) {
            return Err(ProvisionError::InvalidTransition {
                key: self.key.clone(),
                from: self.phase,
                to: target,
            });
        }
        let from = self.phase;
        self.phase = target;
        self.updated_at = Utc::now();
        if target == Phase::Pending {
            self.fingerprint = None;
        }
        if target != Phase::Failed {
            self.last_error = None;
            self.failure_kind = None;
        }
        Ok(from)
    }
}

/// What changed when a catalog was merged into a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub reset: Vec<String>,
    pub dropped: Vec<String>,
}

/// Persisted record of provisioning progress for one root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    pub schema_version: u32,
    pub install_root: PathBuf,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub records: BTreeMap<String, StageRecord>,
}

#[derive(Deserialize)]
struct SchemaProbe {
    schema_version: u32,
}

impl InstallManifest {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            install_root: install_root.into(),
            status: RunStatus::InProgress,
            created_at: now,
            updated_at: now,
            records: BTreeMap::new(),
        }
    }

    /// Align the records with `catalog`.
    ///
    /// New keys get a PENDING record, records whose digest no longer matches
    /// the catalog start over, and records for removed keys are dropped.
    pub fn merge(&mut self, catalog: &Catalog) -> MergeReport {
        let mut report = MergeReport::default();

        let stale: Vec<String> = self
            .records
            .keys()
            .filter(|key| !catalog.contains(key))
            .cloned()
            .collect();
        for key in stale {
            warn!(key = %key, "Dropping manifest record for descriptor no longer in catalog");
            self.records.remove(&key);
            report.dropped.push(key);
        }

        for descriptor in catalog.descriptors() {
            match self.records.get(&descriptor.key) {
                None => {
                    self.records.insert(
                        descriptor.key.clone(),
                        StageRecord::new(&descriptor.key, descriptor.digest.clone()),
                    );
                    report.added.push(descriptor.key.clone());
                }
                Some(record) if record.digest != descriptor.digest => {
                    warn!(
                        key = %descriptor.key,
                        old = %record.digest,
                        new = %descriptor.digest,
                        "Catalog digest changed, starting descriptor over"
                    );
                    self.records.insert(
                        descriptor.key.clone(),
                        StageRecord::new(&descriptor.key, descriptor.digest.clone()),
                    );
                    report.reset.push(descriptor.key.clone());
                }
                Some(_) => {}
            }
        }

        report
    }

    pub fn record(&self, key: &str) -> Option<&StageRecord> {
        self.records.get(key)
    }

    /// Number of records in each phase.
    pub fn phase_counts(&self) -> BTreeMap<Phase, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.values() {
            *counts.entry(record.phase).or_insert(0) += 1;
        }
        counts
    }

    /// Whether every record is DONE.
    pub fn all_done(&self) -> bool {
        self.records.values().all(|r| r.phase == Phase::Done)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a manifest, checking the schema version before anything else.
    pub fn from_json(path: &Path, json: &str) -> ProvisionResult<Self> {
        let corrupt = |e: serde_json::Error| ProvisionError::CorruptManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let probe: SchemaProbe = serde_json::from_str(json).map_err(corrupt)?;
        if probe.schema_version != SCHEMA_VERSION {
            return Err(ProvisionError::IncompatibleManifest {
                path: path.to_path_buf(),
                found: probe.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        serde_json::from_str(json).map_err(corrupt)
    }

    /// Load the manifest at `path`, or `None` if there is none yet.
    pub fn load(path: &Path) -> ProvisionResult<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(json) => Self::from_json(path, &json).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProvisionError::io(path, e)),
        }
    }

    /// Write atomically: temp file, fsync, rename.
    pub fn write_to_file(&self, path: &Path) -> ProvisionResult<()> {
        let json = self.to_json().map_err(|e| ProvisionError::CorruptManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_atomic(path, json.as_bytes())
    }
}

/// `path` with `.tmp` appended to its file name.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `bytes` via a `.tmp` sibling and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> ProvisionResult<()> {
    let temp_path = temp_sibling(path);
    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        ProvisionError::io(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ArtifactDescriptor, DigestAlgorithm, UnpackKind};
    use crate::layout::{CATALOG_COPY_FILE_NAME, MANIFEST_FILE_NAME, RESERVED_NAMES};
    use tempfile::TempDir;

    fn descriptor(key: &str, content: &[u8]) -> ArtifactDescriptor {
        ArtifactDescriptor::new(
            key,
            vec![format!("https://example.com/{}", key)],
            ContentDigest::of_bytes(DigestAlgorithm::Sha256, content),
            key,
            UnpackKind::SingleFile,
        )
    }

    fn catalog(descriptors: Vec<ArtifactDescriptor>) -> Catalog {
        Catalog::from_descriptors(descriptors).unwrap()
    }

    #[test]
    fn test_forward_transitions() {
        use Phase::*;
        let path = [Pending, Fetched, Verified, Unpacked, Relocated, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_phase_skipped() {
        use Phase::*;
        assert!(!Pending.can_transition_to(Verified));
        assert!(!Fetched.can_transition_to(Unpacked));
        assert!(!Verified.can_transition_to(Done));
        assert!(!Pending.can_transition_to(Done));
    }

    #[test]
    fn test_failure_and_reset_edges() {
        use Phase::*;
        for phase in [Pending, Fetched, Verified, Unpacked, Relocated] {
            assert!(phase.can_transition_to(Failed));
        }
        assert!(!Done.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Fetched));
        assert!(Done.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_record_transition_clears_error() {
        let mut record = StageRecord::new("a", ContentDigest::of_bytes(DigestAlgorithm::Sha256, b"a"));
        record.transition(Phase::Failed).unwrap();
        record.last_error = Some("boom".into());
        record.failure_kind = Some(FailureKind::Network);

        let from = record.transition(Phase::Pending).unwrap();
        assert_eq!(from, Phase::Failed);
        assert_eq!(record.last_error, None);
        assert_eq!(record.failure_kind, None);

        let err = record.transition(Phase::Done).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { .. }));
    }

    #[test]
    fn test_merge_adds_resets_and_drops() {
        let mut manifest = InstallManifest::new("/root");
        manifest.merge(&catalog(vec![descriptor("a", b"a"), descriptor("b", b"b")]));
        manifest.records.get_mut("a").unwrap().phase = Phase::Done;
        manifest.records.get_mut("b").unwrap().phase = Phase::Done;

        let report = manifest.merge(&catalog(vec![
            descriptor("a", b"a"),
            descriptor("b", b"b-v2"),
            descriptor("c", b"c"),
        ]));
        assert_eq!(report.added, vec!["c"]);
        assert_eq!(report.reset, vec!["b"]);
        assert!(report.dropped.is_empty());
        assert_eq!(manifest.record("a").unwrap().phase, Phase::Done);
        assert_eq!(manifest.record("b").unwrap().phase, Phase::Pending);

        let report = manifest.merge(&catalog(vec![descriptor("c", b"c")]));
        assert_eq!(report.dropped, vec!["a", "b"]);
        assert_eq!(manifest.records.len(), 1);
    }

    #[test]
    fn test_write_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".install-manifest");

        let mut manifest = InstallManifest::new(temp.path());
        manifest.merge(&catalog(vec![descriptor("a", b"a")]));
        manifest.write_to_file(&path).unwrap();

        assert!(!temp.path().join(".install-manifest.tmp").exists());
        let loaded = InstallManifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_temp_siblings_are_reserved() {
        for name in [MANIFEST_FILE_NAME, CATALOG_COPY_FILE_NAME] {
            let temp_path = temp_sibling(&Path::new("/root").join(name));
            let temp_name = temp_path.file_name().unwrap().to_string_lossy().into_owned();
            assert_eq!(temp_name, format!("{}.tmp", name));
            assert!(RESERVED_NAMES.contains(&temp_name.as_str()), "{}", temp_name);
        }
    }

    #[test]
    fn test_catalog_copy_written_via_reserved_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CATALOG_COPY_FILE_NAME);
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        assert!(!temp.path().join(".install-catalog.json.tmp").exists());
        assert!(!temp.path().join(".install-catalog.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(InstallManifest::load(&temp.path().join("nope"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unknown_schema_version_fails_fast() {
        let json = r#"{"schema_version": 7, "some_future_field": {"shape": "unknown"}}"#;
        let err = InstallManifest::from_json(Path::new("/r/.install-manifest"), json).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::IncompatibleManifest {
                found: 7,
                supported: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = InstallManifest::from_json(Path::new("/m"), "{not json").unwrap_err();
        assert!(matches!(err, ProvisionError::CorruptManifest { .. }));
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Relocated).unwrap(), "\"relocated\"");
        assert_eq!(
            serde_json::to_string(&RunStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
    }
}
