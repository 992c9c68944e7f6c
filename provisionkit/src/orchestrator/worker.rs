//! Per-descriptor stage driver.
//!
//! A worker reads the descriptor's committed phase and executes the next
//! stage until it reaches DONE, FAILED or cancellation. Every stage ends in
//! a committed transition, so a resumed run always re-enters at the first
//! stage whose result is not on disk.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::ProgressObserver;
use super::options::RunOptions;
use super::result::DescriptorFailure;
use crate::catalog::ArtifactDescriptor;
use crate::error::{FailureKind, ProvisionError, ProvisionResult};
use crate::fetch::{discard, Fetcher, RetryState};
use crate::layout::{file_len, InstallLayout};
use crate::manifest::{ManifestStore, Phase, StageRecord};
use crate::relocate::Relocator;
use crate::unpack::{UnpackPlan, Unpacker};
use crate::verify::Verifier;

/// Granularity of cancellable backoff sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Where a descriptor ended up after a worker let go of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Done,
    Failed(DescriptorFailure),
    Cancelled,
}

pub(crate) struct Worker<'a> {
    pub layout: &'a InstallLayout,
    pub store: &'a ManifestStore,
    pub fetcher: &'a Fetcher,
    pub relocator: &'a Relocator,
    pub options: &'a RunOptions,
    pub observer: &'a dyn ProgressObserver,
    pub cancel: &'a CancellationToken,
}

impl Worker<'_> {
    /// Drive one descriptor as far as it will go.
    ///
    /// Descriptor failures are committed to the manifest and returned as
    /// [`Outcome::Failed`]. `Err` means the manifest itself could not be
    /// written, which stops the run.
    pub fn drive(&self, descriptor: &ArtifactDescriptor) -> ProvisionResult<Outcome> {
        let key = descriptor.key.as_str();
        if let Err(e) = self.check_installed(descriptor) {
            return self.fail(descriptor, e);
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled(key);
            }
            let record = self.record(key)?;
            let step = match record.phase {
                Phase::Pending => self.acquire(descriptor, &record),
                Phase::Fetched => self.verify_fetched(descriptor),
                Phase::Verified => self.unpack(descriptor),
                Phase::Unpacked => self.relocate(descriptor, &record),
                Phase::Relocated => self.finish(descriptor, &record),
                Phase::Done => return Ok(Outcome::Done),
                Phase::Failed => {
                    return Ok(Outcome::Failed(DescriptorFailure {
                        kind: record.failure_kind.unwrap_or(FailureKind::Other),
                        message: record.last_error.unwrap_or_default(),
                    }))
                }
            };
            if let Err(e) = step {
                return self.fail(descriptor, e);
            }
        }
    }

    /// Re-check a DONE record against the disk and the current root.
    ///
    /// A missing destination, or a fingerprint that no longer matches when
    /// `verify_installed` is set, sends the record back to PENDING. A record
    /// relocated against another root is re-targeted in place.
    fn check_installed(&self, descriptor: &ArtifactDescriptor) -> ProvisionResult<()> {
        let key = descriptor.key.as_str();
        let record = self.record(key)?;
        if record.phase != Phase::Done {
            return Ok(());
        }

        let destination = self.layout.destination(descriptor)?;
        if !present(&destination) {
            warn!(key = %key, destination = %destination.display(), "Installed content missing, starting over");
            self.commit(key, Phase::Pending, reset_progress)?;
            return Ok(());
        }

        if self.options.verify_installed {
            let actual = self.verifier().fingerprint(&destination)?;
            if record.fingerprint.as_deref() != Some(actual.as_str()) {
                warn!(key = %key, "Installed content changed, repairing");
                self.commit(key, Phase::Pending, reset_progress)?;
                return Ok(());
            }
        }

        self.retarget_installed(descriptor)?;
        Ok(())
    }

    /// Re-target a RELOCATED or DONE descriptor to the current root,
    /// refreshing the fingerprint of a DONE one.
    pub fn retarget_installed(&self, descriptor: &ArtifactDescriptor) -> ProvisionResult<Option<usize>> {
        let record = self.record(&descriptor.key)?;
        let rewritten = match self.retarget(descriptor, &record)? {
            Some(rewritten) => rewritten,
            None => return Ok(None),
        };
        if record.phase == Phase::Done {
            let destination = self.layout.destination(descriptor)?;
            let fingerprint = self.verifier().fingerprint(&destination)?;
            self.store
                .update(&descriptor.key, |r| r.fingerprint = Some(fingerprint))?;
        }
        Ok(Some(rewritten))
    }

    /// PENDING → FETCHED → VERIFIED, under the retry budget.
    fn acquire(&self, descriptor: &ArtifactDescriptor, record: &StageRecord) -> ProvisionResult<()> {
        let key = descriptor.key.as_str();
        let part = self.layout.part_path(key);
        discard(&self.layout.artifact_path(key))?;
        self.layout.ensure_staging()?;

        let mut retry = RetryState::resume(self.options.retry.clone(), record.attempts);
        loop {
            let observer = self.observer;
            let progress = |downloaded: u64, total: Option<u64>| {
                observer.on_bytes(key, downloaded, total);
            };

            let err = match self.fetcher.fetch(descriptor, &part, self.cancel, &progress) {
                Ok(outcome) => {
                    debug!(key = %key, bytes = outcome.bytes, url = %outcome.url, "Fetch pass succeeded");
                    self.commit(key, Phase::Fetched, |r| r.resume_offset = outcome.bytes)?;
                    match self.verify_part(descriptor) {
                        Ok(()) => return Ok(()),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            let delay = retry.record_failure();
            let attempts = retry.attempts();
            let offset = file_len(&part);
            self.store.update(key, |r| {
                r.attempts = attempts;
                r.resume_offset = offset;
            })?;

            match delay {
                Some(delay) => {
                    warn!(
                        key = %key,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Fetch failed, retrying"
                    );
                    if !sleep_cancellable(delay, self.cancel) {
                        return Err(ProvisionError::Cancelled);
                    }
                }
                None => {
                    return Err(ProvisionError::FetchExhausted {
                        attempts,
                        last_error: err.to_string(),
                    })
                }
            }
        }
    }

    /// Re-verify a FETCHED record left behind by an interrupted run.
    fn verify_fetched(&self, descriptor: &ArtifactDescriptor) -> ProvisionResult<()> {
        let key = descriptor.key.as_str();
        if !present(&self.layout.part_path(key)) {
            debug!(key = %key, "Fetched content missing, refetching");
            self.commit(key, Phase::Pending, reset_progress)?;
            return Ok(());
        }

        match self.verify_part(descriptor) {
            Err(ProvisionError::Integrity { .. }) => {
                // record is back at PENDING; charge the pass to the budget
                self.store.update(key, |r| r.attempts = r.attempts.saturating_add(1))?;
                Ok(())
            }
            other => other,
        }
    }

    /// FETCHED → VERIFIED, or back to PENDING with the part deleted.
    fn verify_part(&self, descriptor: &ArtifactDescriptor) -> ProvisionResult<()> {
        let key = descriptor.key.as_str();
        let part = self.layout.part_path(key);
        let check = self.verifier().check(&part, &descriptor.digest, descriptor.size)?;

        if !check.is_match() {
            warn!(key = %key, expected = %descriptor.digest, actual = %check.actual(), "Integrity check failed");
            discard(&part)?;
            self.commit(key, Phase::Pending, |r| r.resume_offset = 0)?;
            return Err(ProvisionError::Integrity {
                path: part,
                expected: descriptor.digest.to_string(),
                actual: check.actual(),
            });
        }

        let artifact = self.layout.artifact_path(key);
        discard(&artifact)?;
        fs::rename(&part, &artifact).map_err(|e| ProvisionError::io(&artifact, e))?;
        self.commit(key, Phase::Verified, |r| {
            r.resume_offset = 0;
            r.attempts = 0;
        })?;
        Ok(())
    }

    /// VERIFIED → UNPACKED.
    fn unpack(&self, descriptor: &ArtifactDescriptor) -> ProvisionResult<()> {
        let key = descriptor.key.as_str();
        let artifact = self.layout.artifact_path(key);
        if !present(&artifact) {
            debug!(key = %key, "Verified artifact missing, refetching");
            self.commit(key, Phase::Pending, reset_progress)?;
            return Ok(());
        }

        let destination = self.layout.destination(descriptor)?;
        let plan = UnpackPlan::for_descriptor(descriptor)?;
        Unpacker::new(self.cancel.clone()).unpack(&artifact, &destination, &plan)?;
        discard(&artifact)?;
        self.commit(key, Phase::Unpacked, |r| r.relocated_root = None)?;
        Ok(())
    }

    /// UNPACKED → RELOCATED.
    fn relocate(&self, descriptor: &ArtifactDescriptor, record: &StageRecord) -> ProvisionResult<()> {
        let key = descriptor.key.as_str();
        let destination = self.layout.destination(descriptor)?;
        if !present(&destination) {
            debug!(key = %key, "Unpacked content missing, refetching");
            self.commit(key, Phase::Pending, reset_progress)?;
            return Ok(());
        }

        let root = self.layout.root();
        if !descriptor.relocation_rules.is_empty() {
            self.relocator.relocate(
                &destination,
                &descriptor.relocation_rules,
                root,
                record.relocated_root.as_deref(),
            )?;
        }
        self.commit(key, Phase::Relocated, |r| {
            r.relocated_root = Some(root.to_path_buf())
        })?;
        Ok(())
    }

    /// RELOCATED → DONE, capturing the installed fingerprint.
    fn finish(&self, descriptor: &ArtifactDescriptor, record: &StageRecord) -> ProvisionResult<()> {
        let key = descriptor.key.as_str();
        let destination = self.layout.destination(descriptor)?;
        if !present(&destination) {
            debug!(key = %key, "Relocated content missing, refetching");
            self.commit(key, Phase::Pending, reset_progress)?;
            return Ok(());
        }

        self.retarget(descriptor, record)?;
        let fingerprint = self.verifier().fingerprint(&destination)?;
        self.commit(key, Phase::Done, |r| r.fingerprint = Some(fingerprint))?;
        info!(key = %key, destination = %destination.display(), "Descriptor installed");
        Ok(())
    }

    /// Re-apply relocation rules when the record was relocated against a
    /// different root. Returns the number of rewritten files, or `None`
    /// when nothing needed re-targeting.
    fn retarget(
        &self,
        descriptor: &ArtifactDescriptor,
        record: &StageRecord,
    ) -> ProvisionResult<Option<usize>> {
        let root = self.layout.root();
        let previous = match &record.relocated_root {
            Some(previous) if previous != root => previous.clone(),
            _ => return Ok(None),
        };

        let key = descriptor.key.as_str();
        info!(key = %key, from = %previous.display(), to = %root.display(), "Installation moved, re-targeting");
        let mut rewritten = 0;
        if !descriptor.relocation_rules.is_empty() {
            let destination = self.layout.destination(descriptor)?;
            let report = self.relocator.relocate(
                &destination,
                &descriptor.relocation_rules,
                root,
                Some(&previous),
            )?;
            rewritten = report.rewritten.len();
        }
        self.store
            .update(key, |r| r.relocated_root = Some(root.to_path_buf()))?;
        Ok(Some(rewritten))
    }

    fn fail(&self, descriptor: &ArtifactDescriptor, err: ProvisionError) -> ProvisionResult<Outcome> {
        let key = descriptor.key.as_str();
        if err.is_cancelled() {
            return self.cancelled(key);
        }

        let kind = err.failure_kind();
        let message = err.to_string();
        error!(key = %key, kind = ?kind, error = %message, "Descriptor failed");

        if self.record(key)?.phase == Phase::Done {
            self.commit(key, Phase::Pending, reset_progress)?;
        }
        let recorded = message.clone();
        self.commit(key, Phase::Failed, |r| {
            r.last_error = Some(recorded);
            r.failure_kind = Some(kind);
        })?;
        Ok(Outcome::Failed(DescriptorFailure { kind, message }))
    }

    fn cancelled(&self, key: &str) -> ProvisionResult<Outcome> {
        let record = self.record(key)?;
        if record.phase == Phase::Pending {
            let offset = file_len(&self.layout.part_path(key));
            self.store.update(key, |r| r.resume_offset = offset)?;
        }
        info!(key = %key, phase = %record.phase, "Stopped by cancellation");
        Ok(Outcome::Cancelled)
    }

    fn commit(
        &self,
        key: &str,
        to: Phase,
        update: impl FnOnce(&mut StageRecord),
    ) -> ProvisionResult<StageRecord> {
        let (record, event) = self.store.transition(key, to, update)?;
        debug!(key = %key, from = %event.from, to = %event.to, "Phase committed");
        self.observer.on_phase(&event);
        Ok(record)
    }

    fn record(&self, key: &str) -> ProvisionResult<StageRecord> {
        self.store
            .record(key)
            .ok_or_else(|| ProvisionError::UnknownDescriptor(key.to_string()))
    }

    fn verifier(&self) -> Verifier {
        Verifier::new(self.cancel.clone())
    }
}

fn reset_progress(record: &mut StageRecord) {
    record.resume_offset = 0;
    record.relocated_root = None;
}

/// Sleep for `duration` unless cancelled first. Returns false on cancel.
pub(crate) fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// Whether `path` holds something a later stage can use.
fn present(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
