//! Media library access
//!
//! [`MediaSource`] is the byte-range seam between the fetcher and the media
//! library server. [`HttpMediaSource`] is the production implementation;
//! tests substitute scripted sources.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Optional per-chunk digest header (lowercase hex SHA-256 of the body)
pub const CHUNK_DIGEST_HEADER: &str = "x-chunk-sha256";

/// One byte range as received from the media library
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub bytes: Bytes,
    /// Digest reported by the server for this range, if any
    pub digest: Option<String>,
}

/// Byte-range access to remote track files
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Total size of the remote file, when the server reports it
    async fn content_length(&self, remote_path: &str) -> Result<Option<u64>>;

    /// Fetch `len` bytes starting at `start`
    async fn fetch_range(&self, remote_path: &str, start: u64, len: u64) -> Result<ChunkData>;

    /// Succeeds when the library answers at all, whatever the status code
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// HTTP media library client using `Range` requests
pub struct HttpMediaSource {
    client: Client,
    base_url: String,
}

impl HttpMediaSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("fleetbox-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Absolute URL for a remote path; absolute URLs pass through
    pub fn url_for(&self, remote_path: &str) -> String {
        if remote_path.starts_with("http://") || remote_path.starts_with("https://") {
            remote_path.to_string()
        } else {
            format!("{}/{}", self.base_url, remote_path.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn ping(&self) -> Result<()> {
        let url = format!("{}/", self.base_url);
        self.client
            .head(&url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Error::from_reqwest(&url, e))
    }

    async fn content_length(&self, remote_path: &str) -> Result<Option<u64>> {
        let url = self.url_for(remote_path);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&url, e))?;

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            // Some servers refuse HEAD; the caller falls back to the declared size
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::from_status(&url, status.as_u16()));
        }

        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok()))
    }

    async fn fetch_range(&self, remote_path: &str, start: u64, len: u64) -> Result<ChunkData> {
        if len == 0 {
            return Ok(ChunkData {
                bytes: Bytes::new(),
                digest: None,
            });
        }

        let url = self.url_for(remote_path);
        let end = start + len - 1;
        debug!(url = %url, start, end, "Fetching range");

        let response = self
            .client
            .get(&url)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await
            .map_err(|e| Error::from_reqwest(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(&url, status.as_u16()));
        }

        let digest = response
            .headers()
            .get(CHUNK_DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::from_reqwest(&url, e))?;

        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(ChunkData {
                bytes: body,
                digest,
            });
        }

        // Server ignored the range and sent the whole file; its digest (if
        // any) describes the whole body, not this slice
        let from = (start as usize).min(body.len());
        let to = (end as usize + 1).min(body.len());
        Ok(ChunkData {
            bytes: body.slice(from..to),
            digest: None,
        })
    }
}
