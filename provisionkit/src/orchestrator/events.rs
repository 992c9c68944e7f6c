//! Progress notifications.

use std::sync::Arc;

use crate::manifest::Phase;

/// A committed phase change.
///
/// Emitted only after the manifest holding the change has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub key: String,
    pub from: Phase,
    pub to: Phase,
    /// Error message when `to` is [`Phase::Failed`].
    pub error: Option<String>,
}

/// Observer for run progress.
///
/// Callbacks are invoked from worker threads and must not block for long.
/// Nothing an observer does feeds back into the pipeline.
pub trait ProgressObserver: Send + Sync {
    /// Called after every committed transition.
    fn on_phase(&self, event: &PhaseEvent);

    /// Called as bytes of `key` arrive.
    fn on_bytes(&self, _key: &str, _downloaded: u64, _total: Option<u64>) {}
}

/// Shared observer handle.
pub type SharedObserver = Arc<dyn ProgressObserver>;

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_phase(&self, _event: &PhaseEvent) {}
}
