//! ProvisionKit - resumable artifact installation
//!
//! Installs a catalog of artifacts (single files, archives, directory trees)
//! into an installation root. Every artifact moves through a persisted
//! phase machine (fetch, verify, unpack, relocate) so that an interrupted
//! install resumes where it stopped, corrupted downloads never reach the
//! destination, and the finished tree keeps working after it is moved.
//!
//! ```no_run
//! use std::path::Path;
//! use provisionkit::{Provisioner, RunOptions};
//!
//! let provisioner = Provisioner::new(RunOptions::default())?;
//! let result = provisioner.run_install(Path::new("/opt/app"), Path::new("catalog.json"))?;
//! println!("{}", result.exit_status);
//! # Ok::<(), provisionkit::ProvisionError>(())
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod layout;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod relocate;
pub mod unpack;
pub mod verify;

pub use catalog::{ArchiveFormat, ArtifactDescriptor, Catalog, ContentDigest, DigestAlgorithm, UnpackKind};
pub use error::{FailureKind, NetworkError, ProvisionError, ProvisionResult};
pub use layout::InstallLayout;
pub use manifest::{InstallManifest, Phase, RunStatus, StageRecord};
pub use orchestrator::{
    ExitStatus, PhaseEvent, ProgressObserver, Provisioner, RelocationSummary, RunOptions, RunResult,
};
