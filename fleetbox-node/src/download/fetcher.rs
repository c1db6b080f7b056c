//! Chunk Fetcher
//!
//! Downloads one track into the cache in adaptively sized byte ranges:
//! resumes from an existing `.part` file, verifies every chunk on receipt,
//! verifies the assembled file against the track checksum, and only then
//! renames it into place. Retryable failures are retried in place with
//! backoff; each retry resumes from whatever the partial file holds.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::download::cache::{hash_file, partial_path, sha256_hex};
use crate::download::governor::BandwidthGovernor;
use crate::download::retry::{RetryFailure, RetryPolicy};
use crate::download::source::MediaSource;
use crate::error::{Error, Result};
use fleetbox_common::model::Track;

/// Progress of one track download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub bytes_downloaded: u64,
    /// 0 when the size is unknown
    pub total_bytes: u64,
    /// Throughput of the current attempt
    pub bytes_per_second: u64,
}

/// Observer for fetch progress and retries
pub trait FetchObserver: Send + Sync {
    fn on_progress(&self, progress: FetchProgress);
    fn on_retry(&self, retry: u32, error: &Error);
}

/// Successful download summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub retries: u32,
}

pub struct ChunkFetcher {
    source: Arc<dyn MediaSource>,
    governor: BandwidthGovernor,
    retry: RetryPolicy,
}

impl ChunkFetcher {
    pub fn new(source: Arc<dyn MediaSource>, governor: BandwidthGovernor, retry: RetryPolicy) -> Self {
        Self {
            source,
            governor,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Download `track` to `dest`
    ///
    /// Progress is reported in non-decreasing byte order: after a checksum
    /// restart nothing is reported until the previous high-water mark is
    /// passed again.
    pub async fn fetch(
        &self,
        track: &Track,
        dest: &Path,
        cancel: &CancellationToken,
        observer: &dyn FetchObserver,
    ) -> std::result::Result<FetchOutcome, RetryFailure> {
        let high_water = AtomicU64::new(0);
        let high_water = &high_water;
        let label = track.id.as_str();

        let result = self
            .retry
            .run(
                label,
                cancel,
                |retry, error| observer.on_retry(retry, error),
                move |retries| async move {
                    self.attempt(track, dest, cancel, observer, high_water)
                        .await
                        .map(|bytes| FetchOutcome { bytes, retries })
                },
            )
            .await;

        match &result {
            Ok(outcome) => info!(
                track = %track.id,
                bytes = outcome.bytes,
                retries = outcome.retries,
                "Track downloaded"
            ),
            Err(failure) => warn!(
                track = %track.id,
                retries = failure.retries,
                "Track download failed: {}",
                failure.error
            ),
        }
        result
    }

    /// One pass: resume, fetch remaining chunks, verify, rename
    async fn attempt(
        &self,
        track: &Track,
        dest: &Path,
        cancel: &CancellationToken,
        observer: &dyn FetchObserver,
        high_water: &AtomicU64,
    ) -> Result<u64> {
        let total = match self.source.content_length(&track.remote_path).await? {
            Some(len) => Some(len),
            None if track.size > 0 => Some(track.size),
            None => None,
        };

        let partial = partial_path(dest);
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io("create cache directory", e))?;
        }

        let mut offset = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(Error::from_io("stat partial file", e)),
        };

        if let Some(total) = total {
            if offset > total {
                warn!(track = %track.id, offset, total, "Partial file larger than remote, restarting");
                remove_partial(&partial).await?;
                offset = 0;
            }
        }
        if offset > 0 {
            debug!(track = %track.id, offset, "Resuming partial download");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial)
            .await
            .map_err(|e| Error::from_io("open partial file", e))?;

        let started = Instant::now();
        let mut received_this_attempt = 0u64;

        loop {
            if let Some(total) = total {
                if offset >= total {
                    break;
                }
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(track.id.clone()));
            }

            let chunk_size = self.governor.recommended_chunk_size();
            let len = match total {
                Some(total) => chunk_size.min(total - offset),
                None => chunk_size,
            };

            let chunk_started = Instant::now();
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled(track.id.clone())),
                chunk = self.source.fetch_range(&track.remote_path, offset, len) => chunk?,
            };
            let received = chunk.bytes.len() as u64;

            if total.is_some() && received != len {
                return Err(Error::Checksum(format!(
                    "chunk at {} of {}: expected {} bytes, got {}",
                    offset, track.id, len, received
                )));
            }
            if let Some(expected) = &chunk.digest {
                let actual = sha256_hex(&chunk.bytes);
                if &actual != expected {
                    return Err(Error::Checksum(format!(
                        "chunk at {} of {}: digest {} != {}",
                        offset, track.id, actual, expected
                    )));
                }
            }

            self.governor.throttle(chunk.bytes.len()).await;
            file.write_all(&chunk.bytes)
                .await
                .map_err(|e| Error::from_io("write partial file", e))?;
            file.flush()
                .await
                .map_err(|e| Error::from_io("flush partial file", e))?;

            self.governor.record_throughput(received, chunk_started.elapsed());
            offset += received;
            received_this_attempt += received;

            if offset > high_water.load(Ordering::SeqCst) {
                high_water.store(offset, Ordering::SeqCst);
                let secs = started.elapsed().as_secs_f64();
                observer.on_progress(FetchProgress {
                    bytes_downloaded: offset,
                    total_bytes: total.unwrap_or(0),
                    bytes_per_second: if secs > 0.0 {
                        (received_this_attempt as f64 / secs) as u64
                    } else {
                        0
                    },
                });
            }

            // Unknown size: a short read marks the end of the file
            if total.is_none() && received < len {
                break;
            }
        }
        drop(file);

        if track.has_checksum() {
            let actual = hash_file(&partial).await?;
            if !actual.eq_ignore_ascii_case(track.checksum.trim()) {
                remove_partial(&partial).await?;
                return Err(Error::Checksum(format!(
                    "file {}: sha256 {} != {}",
                    track.id, actual, track.checksum
                )));
            }
        }

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| Error::from_io("move verified file into place", e))?;
        Ok(offset)
    }
}

async fn remove_partial(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from_io("remove partial file", e)),
    }
}
