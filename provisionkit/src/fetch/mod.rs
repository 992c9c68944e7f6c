//! Artifact retrieval.
//!
//! A [`Fetcher`] call is one pass over a descriptor's mirrors. It streams
//! into `<root>/.staging/<key>.part`, resuming from whatever is already on
//! disk, and moves on to the next mirror when one fails. Repeating passes
//! under a retry budget is the orchestrator's job, driven by
//! [`RetryPolicy`] and [`RetryState`].

mod http;
mod retry;
mod transport;

pub use http::{HttpTransport, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
pub use retry::{
    RetryPolicy, RetryState, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_SECS,
};
pub use transport::{DefaultTransport, FileTransport, RemoteBody, Transport};

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{ArtifactDescriptor, UnpackKind};
use crate::error::{NetworkError, ProvisionError, ProvisionResult};
use crate::layout::{file_len, remove_path};
use crate::unpack::copy_tree;

/// Buffer size for streaming downloads (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Byte progress callback: `(downloaded, total)`.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Sync);

/// Result of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Bytes now in the partial file.
    pub bytes: u64,
    pub total: Option<u64>,
    /// Mirror that delivered the bytes.
    pub url: String,
    /// Whether the pass continued an existing partial file.
    pub resumed: bool,
}

/// Retrieves descriptor content through a [`Transport`].
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher").finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Make one pass over the descriptor's mirrors.
    ///
    /// The resume offset is the length of `part` on disk. A transient
    /// failure on any mirror makes the whole pass transient; only when every
    /// mirror failed permanently is the pass permanent.
    ///
    /// # Errors
    ///
    /// * `Network` - every mirror failed
    /// * `Cancelled` - the token fired; `part` is left in place
    /// * `Io` - the staging file could not be written
    pub fn fetch(
        &self,
        descriptor: &ArtifactDescriptor,
        part: &Path,
        cancel: &CancellationToken,
        progress: ByteProgress<'_>,
    ) -> ProvisionResult<FetchOutcome> {
        if descriptor.unpack_kind == UnpackKind::DirectoryCopy {
            return self.fetch_directory(descriptor, part, cancel);
        }

        let mut any_transient = false;
        let mut last_error: Option<NetworkError> = None;

        for candidate in &descriptor.urls {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let url = match Url::parse(candidate) {
                Ok(url) => url,
                Err(e) => {
                    last_error = Some(NetworkError::permanent(candidate, e.to_string()));
                    continue;
                }
            };

            match self.fetch_from(descriptor, &url, part, cancel, progress) {
                Ok(outcome) => return Ok(outcome),
                Err(ProvisionError::Network(e)) => {
                    warn!(key = %descriptor.key, url = %candidate, error = %e, "Mirror failed");
                    any_transient |= e.is_transient();
                    last_error = Some(e);
                }
                Err(ProvisionError::Integrity { expected, actual, .. }) => {
                    // this mirror serves something else; its bytes are useless
                    warn!(
                        key = %descriptor.key,
                        url = %candidate,
                        expected = %expected,
                        actual = %actual,
                        "Mirror served unexpected size"
                    );
                    remove_path(part).map_err(|e| ProvisionError::io(part, e))?;
                    any_transient = true;
                    last_error = Some(NetworkError::transient(
                        candidate,
                        format!("expected {}, got {}", expected, actual),
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        let tried = descriptor.urls.len();
        let (url, reason) = match last_error {
            Some(e) => (e.url, e.reason),
            None => (String::new(), "no source URLs".to_string()),
        };
        let reason = format!("all {} mirror(s) failed, last: {}", tried, reason);
        Err(if any_transient {
            NetworkError::transient(url, reason)
        } else {
            NetworkError::permanent(url, reason)
        }
        .into())
    }

    /// Stream one mirror into `part`.
    fn fetch_from(
        &self,
        descriptor: &ArtifactDescriptor,
        url: &Url,
        part: &Path,
        cancel: &CancellationToken,
        progress: ByteProgress<'_>,
    ) -> ProvisionResult<FetchOutcome> {
        let mut offset = file_len(part);
        if let Some(size) = descriptor.size {
            if offset > size {
                debug!(key = %descriptor.key, offset, size, "Discarding oversized partial file");
                remove_path(part).map_err(|e| ProvisionError::io(part, e))?;
                offset = 0;
            } else if offset == size && size > 0 {
                debug!(key = %descriptor.key, "Partial file already complete");
                return Ok(FetchOutcome {
                    bytes: offset,
                    total: Some(size),
                    url: url.to_string(),
                    resumed: true,
                });
            }
        }

        let body = self.transport.open(url, offset)?;
        if let (Some(expected), Some(total)) = (descriptor.size, body.total_size) {
            if expected != total {
                return Err(ProvisionError::Integrity {
                    path: part.to_path_buf(),
                    expected: format!("{} bytes", expected),
                    actual: format!("{} bytes", total),
                });
            }
        }
        let total = body.total_size.or(descriptor.size);
        let resumed = body.start_offset > 0;

        let file = if resumed {
            OpenOptions::new().append(true).open(part)
        } else {
            File::create(part)
        }
        .map_err(|e| ProvisionError::io(part, e))?;

        if resumed {
            info!(key = %descriptor.key, url = %url, offset = body.start_offset, "Resuming download");
        } else {
            info!(key = %descriptor.key, url = %url, "Downloading");
        }

        let bytes = stream_body(body, file, part, url, total, cancel, progress)?;
        Ok(FetchOutcome {
            bytes,
            total,
            url: url.to_string(),
            resumed,
        })
    }

    /// Stage a `directory-copy` source by copying the tree into `part`.
    fn fetch_directory(
        &self,
        descriptor: &ArtifactDescriptor,
        part: &Path,
        cancel: &CancellationToken,
    ) -> ProvisionResult<FetchOutcome> {
        let mut last_error: Option<NetworkError> = None;
        for candidate in &descriptor.urls {
            let source = match Url::parse(candidate).ok().and_then(|u| u.to_file_path().ok()) {
                Some(path) => path,
                None => {
                    last_error = Some(NetworkError::permanent(
                        candidate,
                        "directory sources must be file:// paths",
                    ));
                    continue;
                }
            };
            if !source.is_dir() {
                last_error = Some(NetworkError::permanent(candidate, "source directory not found"));
                continue;
            }

            remove_path(part).map_err(|e| ProvisionError::io(part, e))?;
            info!(key = %descriptor.key, source = %source.display(), "Copying directory");
            let report = copy_tree(&source, part, cancel)?;
            return Ok(FetchOutcome {
                bytes: report.bytes,
                total: Some(report.bytes),
                url: candidate.clone(),
                resumed: false,
            });
        }

        let e = last_error.unwrap_or_else(|| NetworkError::permanent("", "no source URLs"));
        Err(e.into())
    }
}

fn stream_body(
    body: RemoteBody,
    file: File,
    part: &Path,
    url: &Url,
    total: Option<u64>,
    cancel: &CancellationToken,
    progress: ByteProgress<'_>,
) -> ProvisionResult<u64> {
    let mut reader = body.reader;
    let mut writer = BufWriter::new(file);
    let mut downloaded = body.start_offset;
    let mut buffer = vec![0u8; BUFFER_SIZE];

    progress(downloaded, total);
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                flush(&mut writer, part)?;
                return Err(NetworkError::transient(url.as_str(), format!("read failed: {}", e)).into());
            }
        };

        writer
            .write_all(&buffer[..n])
            .map_err(|e| ProvisionError::io(part, e))?;
        downloaded += n as u64;
        progress(downloaded, total);

        if let Some(total) = total {
            if downloaded > total {
                flush(&mut writer, part)?;
                return Err(ProvisionError::Integrity {
                    path: part.to_path_buf(),
                    expected: format!("{} bytes", total),
                    actual: format!("more than {} bytes", total),
                });
            }
        }

        if cancel.is_cancelled() {
            flush(&mut writer, part)?;
            return Err(ProvisionError::Cancelled);
        }
    }

    flush(&mut writer, part)?;
    if let Some(total) = total {
        if downloaded < total {
            return Err(NetworkError::transient(
                url.as_str(),
                format!("connection closed after {} of {} bytes", downloaded, total),
            )
            .into());
        }
    }
    Ok(downloaded)
}

fn flush(writer: &mut BufWriter<File>, part: &Path) -> ProvisionResult<()> {
    writer.flush().map_err(|e| ProvisionError::io(part, e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| ProvisionError::io(part, e))
}

/// Remove a staging entry, ignoring absence.
pub(crate) fn discard(path: &Path) -> ProvisionResult<()> {
    if fs::symlink_metadata(path).is_ok() {
        remove_path(path).map_err(|e| ProvisionError::io(path, e))?;
    }
    Ok(())
}
