//! Single-writer access to the manifest.
//!
//! Workers never touch the manifest file directly. Every phase change goes
//! through [`ManifestStore::transition`], which validates the edge, updates
//! the in-memory copy and commits it to disk before returning, all under one
//! lock. A crash therefore loses at most the transition in flight.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::trace;

use super::{InstallManifest, Phase, RunStatus, StageRecord};
use crate::error::{ProvisionError, ProvisionResult};
use crate::orchestrator::PhaseEvent;

/// Mutex-guarded manifest plus the path it is committed to.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    manifest: Mutex<InstallManifest>,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>, manifest: InstallManifest) -> Self {
        Self {
            path: path.into(),
            manifest: Mutex::new(manifest),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current manifest.
    pub fn snapshot(&self) -> InstallManifest {
        self.manifest.lock().clone()
    }

    /// Copy of one record.
    pub fn record(&self, key: &str) -> Option<StageRecord> {
        self.manifest.lock().records.get(key).cloned()
    }

    /// Move `key` to phase `to`, apply `update`, and commit.
    ///
    /// Returns the committed record and the event describing the change.
    pub fn transition(
        &self,
        key: &str,
        to: Phase,
        update: impl FnOnce(&mut StageRecord),
    ) -> ProvisionResult<(StageRecord, PhaseEvent)> {
        let mut manifest = self.manifest.lock();
        let record = manifest
            .records
            .get_mut(key)
            .ok_or_else(|| ProvisionError::UnknownDescriptor(key.to_string()))?;

        let from = record.transition(to)?;
        update(record);
        let committed = record.clone();
        manifest.updated_at = Utc::now();
        manifest.write_to_file(&self.path)?;

        trace!(key = %key, from = %from, to = %to, "Committed phase transition");
        let event = PhaseEvent {
            key: key.to_string(),
            from,
            to,
            error: committed.last_error.clone(),
        };
        Ok((committed, event))
    }

    /// Apply a change that does not move the phase, and commit.
    pub fn update(
        &self,
        key: &str,
        update: impl FnOnce(&mut StageRecord),
    ) -> ProvisionResult<StageRecord> {
        let mut manifest = self.manifest.lock();
        let record = manifest
            .records
            .get_mut(key)
            .ok_or_else(|| ProvisionError::UnknownDescriptor(key.to_string()))?;
        update(record);
        record.updated_at = Utc::now();
        let committed = record.clone();
        manifest.updated_at = Utc::now();
        manifest.write_to_file(&self.path)?;
        Ok(committed)
    }

    pub fn set_status(&self, status: RunStatus) -> ProvisionResult<()> {
        let mut manifest = self.manifest.lock();
        manifest.status = status;
        manifest.updated_at = Utc::now();
        manifest.write_to_file(&self.path)
    }

    pub fn set_install_root(&self, root: &Path) -> ProvisionResult<()> {
        let mut manifest = self.manifest.lock();
        manifest.install_root = root.to_path_buf();
        manifest.updated_at = Utc::now();
        manifest.write_to_file(&self.path)
    }

    /// Commit the current state without changing it.
    pub fn persist(&self) -> ProvisionResult<()> {
        self.manifest.lock().write_to_file(&self.path)
    }
}
