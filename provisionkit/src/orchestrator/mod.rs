//! Install orchestration.
//!
//! The [`Provisioner`] merges a catalog into the root's manifest, then runs
//! a bounded pool of scoped worker threads over the descriptors. Each worker
//! drives one descriptor through its phases; descriptors never wait on each
//! other, and one failing does not stop the rest.

mod events;
mod options;
mod result;
mod worker;

pub use events::{NullObserver, PhaseEvent, ProgressObserver, SharedObserver};
pub use options::{RunOptions, DEFAULT_CONCURRENCY};
pub use result::{DescriptorFailure, ExitStatus, RelocationSummary, RunResult};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{ArtifactDescriptor, Catalog};
use crate::error::{FailureKind, ProvisionError, ProvisionResult};
use crate::fetch::{DefaultTransport, Fetcher, HttpTransport, Transport};
use crate::layout::InstallLayout;
use crate::manifest::{write_atomic, InstallManifest, ManifestStore, Phase, RunStatus};
use crate::relocate::Relocator;
use worker::{Outcome, Worker};

/// Entry point for install, resume, relocate and status.
pub struct Provisioner {
    options: RunOptions,
    fetcher: Fetcher,
    relocator: Relocator,
    observer: SharedObserver,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("options", &self.options)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Create a provisioner that fetches over HTTP(S) and `file://`.
    pub fn new(options: RunOptions) -> ProvisionResult<Self> {
        let http = HttpTransport::with_settings(options.timeout, &options.user_agent)?;
        Ok(Self::with_transport(
            options,
            Arc::new(DefaultTransport::new(http)),
        ))
    }

    /// Create a provisioner over a custom transport.
    pub fn with_transport(options: RunOptions, transport: Arc<dyn Transport>) -> Self {
        let relocator = Relocator::new(options.sentinel.clone());
        Self {
            options,
            fetcher: Fetcher::new(transport),
            relocator,
            observer: Arc::new(NullObserver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the current run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Install the catalog at `catalog_path` into `root`.
    ///
    /// The catalog is copied into the root so the run can later be resumed
    /// from the root alone. An existing manifest is reused: DONE descriptors
    /// are left alone and unfinished ones continue where they stopped.
    pub fn run_install(&self, root: &Path, catalog_path: &Path) -> ProvisionResult<RunResult> {
        let catalog = Catalog::load(catalog_path)?;
        self.install_catalog(root, &catalog)
    }

    /// Same as [`run_install`](Self::run_install) with an in-memory catalog.
    pub fn install_catalog(&self, root: &Path, catalog: &Catalog) -> ProvisionResult<RunResult> {
        let layout = InstallLayout::prepare(root)?;
        let json = catalog.to_json()?;
        write_atomic(&layout.catalog_path(), json.as_bytes())?;

        let manifest = InstallManifest::load(&layout.manifest_path())?
            .unwrap_or_else(|| InstallManifest::new(layout.root()));
        info!(root = %layout.root().display(), descriptors = catalog.len(), "Starting install");
        self.execute(&layout, catalog, manifest)
    }

    /// Continue an interrupted install using the catalog copy in `root`.
    pub fn resume_install(&self, root: &Path) -> ProvisionResult<RunResult> {
        let layout = InstallLayout::open(root)?;
        let catalog = self.stored_catalog(&layout)?;
        let manifest = InstallManifest::load(&layout.manifest_path())?
            .unwrap_or_else(|| InstallManifest::new(layout.root()));
        info!(root = %layout.root().display(), descriptors = catalog.len(), "Resuming install");
        self.execute(&layout, &catalog, manifest)
    }

    /// Re-target an installation that was copied or moved to `root`.
    ///
    /// Files already relocated against the old root are rewritten to the new
    /// one. Descriptors that are not yet RELOCATED are reported as pending;
    /// the next resume relocates them against the new root.
    pub fn relocate_install(&self, root: &Path) -> ProvisionResult<RelocationSummary> {
        let layout = InstallLayout::open(root)?;
        let catalog = self.stored_catalog(&layout)?;
        let manifest = InstallManifest::load(&layout.manifest_path())?
            .ok_or_else(|| ProvisionError::NothingToResume(layout.root().to_path_buf()))?;

        let previous_root =
            Some(manifest.install_root.clone()).filter(|previous| previous != layout.root());
        let store = ManifestStore::new(layout.manifest_path(), manifest);
        let worker = self.worker(&layout, &store, &self.cancel);

        let mut summary = RelocationSummary {
            install_root: layout.root().to_path_buf(),
            previous_root,
            ..Default::default()
        };
        for descriptor in catalog.descriptors() {
            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let phase = store.record(&descriptor.key).map(|r| r.phase);
            match phase {
                Some(Phase::Relocated | Phase::Done) => {
                    if let Some(rewritten) = worker.retarget_installed(descriptor)? {
                        summary.relocated_keys.push(descriptor.key.clone());
                        summary.rewritten_files += rewritten;
                    }
                }
                _ => summary.pending_keys.push(descriptor.key.clone()),
            }
        }

        store.set_install_root(layout.root())?;
        info!(
            root = %layout.root().display(),
            relocated = summary.relocated_keys.len(),
            files = summary.rewritten_files,
            pending = summary.pending_keys.len(),
            "Relocation finished"
        );
        Ok(summary)
    }

    /// Manifest of the installation at `root`.
    pub fn status(root: &Path) -> ProvisionResult<InstallManifest> {
        let layout = InstallLayout::open(root)?;
        InstallManifest::load(&layout.manifest_path())?
            .ok_or_else(|| ProvisionError::NothingToResume(layout.root().to_path_buf()))
    }

    fn stored_catalog(&self, layout: &InstallLayout) -> ProvisionResult<Catalog> {
        let path = layout.catalog_path();
        if !path.is_file() {
            return Err(ProvisionError::NothingToResume(layout.root().to_path_buf()));
        }
        Ok(Catalog::load(&path)?)
    }

    fn worker<'a>(
        &'a self,
        layout: &'a InstallLayout,
        store: &'a ManifestStore,
        cancel: &'a CancellationToken,
    ) -> Worker<'a> {
        Worker {
            layout,
            store,
            fetcher: &self.fetcher,
            relocator: &self.relocator,
            options: &self.options,
            observer: self.observer.as_ref(),
            cancel,
        }
    }

    fn execute(
        &self,
        layout: &InstallLayout,
        catalog: &Catalog,
        mut manifest: InstallManifest,
    ) -> ProvisionResult<RunResult> {
        let merge = manifest.merge(catalog);
        if !merge.added.is_empty() || !merge.reset.is_empty() || !merge.dropped.is_empty() {
            info!(
                added = merge.added.len(),
                reset = merge.reset.len(),
                dropped = merge.dropped.len(),
                "Merged catalog into manifest"
            );
        }
        if manifest.install_root != layout.root() {
            info!(
                from = %manifest.install_root.display(),
                to = %layout.root().display(),
                "Installation root changed"
            );
            manifest.install_root = layout.root().to_path_buf();
        }
        manifest.status = RunStatus::InProgress;

        let store = ManifestStore::new(layout.manifest_path(), manifest);
        store.persist()?;

        let skip = &self.options.skip;
        for key in skip.iter().filter(|key| !catalog.contains(key)) {
            warn!(key = %key, "Skip-list names a descriptor not in the catalog");
        }

        // explicit retry: FAILED records get a fresh budget
        let failed: Vec<String> = store
            .snapshot()
            .records
            .values()
            .filter(|r| r.phase == Phase::Failed && !skip.contains(&r.key))
            .map(|r| r.key.clone())
            .collect();
        for key in failed {
            let (_, event) = store.transition(&key, Phase::Pending, |r| {
                r.attempts = 0;
                r.resume_offset = 0;
            })?;
            self.observer.on_phase(&event);
        }

        let queue: Vec<&ArtifactDescriptor> = catalog
            .descriptors()
            .filter(|d| !skip.contains(&d.key))
            .collect();

        let run_cancel = self.cancel.child_token();
        let fatal = self.run_pool(layout, &store, &queue, &run_cancel);
        if let Some(e) = fatal {
            error!(error = %e, "Run stopped");
            if let Err(status_err) = store.set_status(RunStatus::Aborted) {
                warn!(error = %status_err, "Failed to record aborted status");
            }
            return Err(e);
        }

        let snapshot = store.snapshot();
        let mut result = RunResult {
            completed_keys: Vec::new(),
            failed_keys: Vec::new(),
            skipped_keys: Vec::new(),
            failures: BTreeMap::new(),
            exit_status: ExitStatus::Complete,
        };
        let mut unfinished = 0usize;
        let mut skipped_unfinished = 0usize;
        for descriptor in catalog.descriptors() {
            let key = descriptor.key.clone();
            let record = snapshot.record(&key);
            let phase = record.map(|r| r.phase).unwrap_or(Phase::Pending);
            if skip.contains(&key) {
                if phase != Phase::Done {
                    skipped_unfinished += 1;
                }
                result.skipped_keys.push(key);
                continue;
            }
            match (phase, record) {
                (Phase::Done, _) => result.completed_keys.push(key),
                (Phase::Failed, Some(record)) => {
                    result.failures.insert(
                        key.clone(),
                        DescriptorFailure {
                            kind: record.failure_kind.unwrap_or(FailureKind::Other),
                            message: record.last_error.clone().unwrap_or_default(),
                        },
                    );
                    result.failed_keys.push(key);
                }
                _ => unfinished += 1,
            }
        }

        result.exit_status = exit_status(
            result.failed_keys.len(),
            unfinished,
            skipped_unfinished,
            run_cancel.is_cancelled(),
        );
        let status = match result.exit_status {
            ExitStatus::Complete => RunStatus::Complete,
            ExitStatus::Aborted => RunStatus::Aborted,
            ExitStatus::Cancelled | ExitStatus::Partial => RunStatus::InProgress,
        };
        store.set_status(status)?;
        if result.exit_status == ExitStatus::Complete {
            layout.remove_staging()?;
        }

        info!(
            status = %result.exit_status,
            completed = result.completed_keys.len(),
            failed = result.failed_keys.len(),
            skipped = result.skipped_keys.len(),
            "Run finished"
        );
        Ok(result)
    }

    /// Run the worker pool. Returns the first run-level error, if any.
    fn run_pool(
        &self,
        layout: &InstallLayout,
        store: &ManifestStore,
        queue: &[&ArtifactDescriptor],
        cancel: &CancellationToken,
    ) -> Option<ProvisionError> {
        let worker = self.worker(layout, store, cancel);
        let next = AtomicUsize::new(0);
        let fatal: Mutex<Option<ProvisionError>> = Mutex::new(None);
        let workers = self.options.workers().min(queue.len());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let descriptor = match queue.get(index) {
                        Some(descriptor) => descriptor,
                        None => break,
                    };
                    match worker.drive(descriptor) {
                        Ok(Outcome::Done) | Ok(Outcome::Failed(_)) => {}
                        Ok(Outcome::Cancelled) => break,
                        Err(e) => {
                            // manifest is unwritable; stop everyone
                            fatal.lock().get_or_insert(e);
                            cancel.cancel();
                            break;
                        }
                    }
                });
            }
        });

        fatal.into_inner()
    }
}

/// Decide how a run ended.
///
/// A cancelled run that left work behind is `Cancelled` even if something
/// failed; otherwise any failure makes it `Aborted`.
fn exit_status(failed: usize, unfinished: usize, skipped_unfinished: usize, cancelled: bool) -> ExitStatus {
    if cancelled && unfinished > 0 {
        ExitStatus::Cancelled
    } else if failed > 0 {
        ExitStatus::Aborted
    } else if unfinished > 0 {
        ExitStatus::Cancelled
    } else if skipped_unfinished > 0 {
        ExitStatus::Partial
    } else {
        ExitStatus::Complete
    }
}
