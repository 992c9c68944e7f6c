//! Byte sources behind descriptor URLs.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use reqwest::Url;

use super::http::HttpTransport;
use crate::error::NetworkError;

/// Response body opened at some offset.
pub struct RemoteBody {
    pub reader: Box<dyn Read + Send>,
    /// Offset the body actually starts at; 0 when the source ignored the
    /// requested range.
    pub start_offset: u64,
    /// Total size of the resource, when the source reports it.
    pub total_size: Option<u64>,
}

impl std::fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBody")
            .field("start_offset", &self.start_offset)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Opens a URL for reading from a byte offset.
///
/// Implementations classify failures as transient or permanent; the fetcher
/// uses that to decide whether a pass is worth repeating.
pub trait Transport: Send + Sync {
    fn open(&self, url: &Url, offset: u64) -> Result<RemoteBody, NetworkError>;
}

/// `file://` source.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTransport;

impl Transport for FileTransport {
    fn open(&self, url: &Url, offset: u64) -> Result<RemoteBody, NetworkError> {
        let path = url
            .to_file_path()
            .map_err(|_| NetworkError::permanent(url.as_str(), "not a local file path"))?;
        let mut file = File::open(&path).map_err(|e| classify_io(url, e))?;
        let len = file
            .metadata()
            .map_err(|e| classify_io(url, e))?
            .len();

        let start_offset = if offset > 0 && offset <= len { offset } else { 0 };
        if start_offset > 0 {
            file.seek(SeekFrom::Start(start_offset))
                .map_err(|e| classify_io(url, e))?;
        }

        Ok(RemoteBody {
            reader: Box::new(file),
            start_offset,
            total_size: Some(len),
        })
    }
}

fn classify_io(url: &Url, e: io::Error) -> NetworkError {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            NetworkError::permanent(url.as_str(), e.to_string())
        }
        _ => NetworkError::transient(url.as_str(), e.to_string()),
    }
}

/// Dispatches on URL scheme: `http`/`https` over HTTP, `file` locally.
#[derive(Debug)]
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new(http: HttpTransport) -> Self {
        Self {
            http,
            file: FileTransport,
        }
    }
}

impl Transport for DefaultTransport {
    fn open(&self, url: &Url, offset: u64) -> Result<RemoteBody, NetworkError> {
        match url.scheme() {
            "http" | "https" => self.http.open(url, offset),
            "file" => self.file.open(url, offset),
            other => Err(NetworkError::permanent(
                url.as_str(),
                format!("unsupported scheme {:?}", other),
            )),
        }
    }
}
