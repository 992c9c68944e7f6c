//! HTTP transport with range-request resume.
//!
//! A request for a non-zero offset carries `Range: bytes=<offset>-`. The
//! server's answer decides where the body starts:
//!
//! - `206 Partial Content`: body starts at the offset
//! - `200 OK`: range ignored, body starts at 0 and the partial file must be
//!   rewritten
//! - `416 Range Not Satisfiable`: the partial file is stale; the request is
//!   repeated without a range

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{StatusCode, Url};
use tracing::debug;

use super::transport::{RemoteBody, Transport};
use crate::error::{NetworkError, ProvisionError, ProvisionResult};

/// Default timeout for HTTP requests in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("provisionkit/", env!("CARGO_PKG_VERSION"));

/// Blocking HTTP(S) transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with the default timeout and user agent.
    pub fn new() -> ProvisionResult<Self> {
        Self::with_settings(Duration::from_secs(DEFAULT_TIMEOUT_SECS), DEFAULT_USER_AGENT)
    }

    /// Create a transport with a custom timeout and user agent.
    pub fn with_settings(timeout: Duration, user_agent: &str) -> ProvisionResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProvisionError::HttpClient(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &Url, offset: u64) -> Result<RemoteBody, NetworkError> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().map_err(|e| classify_send_error(url, &e))?;
        let status = response.status();

        match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let total_size = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total)
                    .or_else(|| response.content_length().map(|len| len + offset));
                debug!(url = %url, offset, "Resuming download");
                Ok(RemoteBody {
                    reader: Box::new(response),
                    start_offset: offset,
                    total_size,
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                debug!(url = %url, offset, "Range not satisfiable, restarting download");
                self.open(url, 0)
            }
            s if s.is_success() => {
                if offset > 0 {
                    debug!(url = %url, offset, "Server ignored range, restarting download");
                }
                let total_size = response.content_length();
                Ok(RemoteBody {
                    reader: Box::new(response),
                    start_offset: 0,
                    total_size,
                })
            }
            s => Err(classify_status(url, s)),
        }
    }
}

/// Total length from a `Content-Range: bytes <start>-<end>/<total>` header.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Classify an HTTP status that is not a success.
pub(crate) fn classify_status(url: &Url, status: StatusCode) -> NetworkError {
    let reason = format!("HTTP {}", status);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        NetworkError::transient(url.as_str(), reason)
    } else {
        NetworkError::permanent(url.as_str(), reason)
    }
}

fn classify_send_error(url: &Url, e: &reqwest::Error) -> NetworkError {
    if e.is_builder() || e.is_redirect() {
        NetworkError::permanent(url.as_str(), e.to_string())
    } else {
        // timeouts, refused connections, resets, DNS hiccups
        NetworkError::transient(url.as_str(), e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://mirror.example/pkg.tar.gz").unwrap()
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 100-199/200"), Some(200));
        assert_eq!(parse_content_range_total("bytes 0-0/1"), Some(1));
        assert_eq!(parse_content_range_total("bytes 0-10/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(&url(), StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(classify_status(&url(), StatusCode::BAD_GATEWAY).is_transient());
        assert!(classify_status(&url(), StatusCode::REQUEST_TIMEOUT).is_transient());
        assert!(classify_status(&url(), StatusCode::TOO_MANY_REQUESTS).is_transient());

        assert!(!classify_status(&url(), StatusCode::NOT_FOUND).is_transient());
        assert!(!classify_status(&url(), StatusCode::FORBIDDEN).is_transient());
        assert!(!classify_status(&url(), StatusCode::GONE).is_transient());
    }

    #[test]
    fn test_new_transport() {
        let transport = HttpTransport::with_settings(Duration::from_secs(5), "test-agent").unwrap();
        assert_eq!(transport.timeout(), Duration::from_secs(5));
    }
}
