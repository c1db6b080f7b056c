//! Per-owner download progress aggregation
//!
//! Folds [`DownloadEvent`]s into one `downloadProgress` report per playlist
//! or schedule.

use std::collections::{HashMap, HashSet};

use crate::download::job::Owner;
use crate::download::scheduler::DownloadEvent;
use fleetbox_common::control::DownloadProgress;
use fleetbox_common::model::{DownloadStatus, Track};

#[derive(Debug, Clone)]
struct TrackProgress {
    bytes_downloaded: u64,
    total_bytes: u64,
    bytes_per_second: u64,
    status: DownloadStatus,
    retry_count: u32,
}

impl TrackProgress {
    fn fraction(&self) -> f64 {
        match self.status {
            DownloadStatus::Completed => 1.0,
            _ if self.total_bytes == 0 => 0.0,
            _ => (self.bytes_downloaded as f64 / self.total_bytes as f64).min(1.0),
        }
    }

    fn remaining_bytes(&self) -> u64 {
        match self.status {
            DownloadStatus::Completed => 0,
            _ => self.total_bytes.saturating_sub(self.bytes_downloaded),
        }
    }
}

#[derive(Debug, Default)]
struct OwnerProgress {
    /// Unique track ids in first-seen order
    order: Vec<String>,
    tracks: HashMap<String, TrackProgress>,
}

/// Aggregates download progress for every tracked owner
#[derive(Debug)]
pub struct ProgressTracker {
    token: String,
    owners: HashMap<Owner, OwnerProgress>,
}

impl ProgressTracker {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            owners: HashMap::new(),
        }
    }

    /// Start (or restart) tracking `owner` with its full track list
    ///
    /// Tracks in `verified` count as already downloaded.
    pub fn track(&mut self, owner: Owner, tracks: &[Track], verified: &HashSet<String>) {
        let mut progress = OwnerProgress::default();
        for track in tracks {
            if progress.tracks.contains_key(&track.id) {
                continue;
            }
            let complete = verified.contains(&track.id);
            progress.order.push(track.id.clone());
            progress.tracks.insert(
                track.id.clone(),
                TrackProgress {
                    bytes_downloaded: if complete { track.size } else { 0 },
                    total_bytes: track.size,
                    bytes_per_second: 0,
                    status: if complete {
                        DownloadStatus::Completed
                    } else {
                        DownloadStatus::Queued
                    },
                    retry_count: 0,
                },
            );
        }
        self.owners.insert(owner, progress);
    }

    pub fn forget(&mut self, owner: &Owner) {
        self.owners.remove(owner);
    }

    pub fn is_tracking(&self, owner: &Owner) -> bool {
        self.owners.contains_key(owner)
    }

    /// Apply a scheduler event; returns the owner whose report changed
    pub fn apply(&mut self, event: &DownloadEvent) -> Option<Owner> {
        let (owner, track_id) = match event {
            DownloadEvent::Queued { track_id, owner }
            | DownloadEvent::Started { track_id, owner }
            | DownloadEvent::Progress { track_id, owner, .. }
            | DownloadEvent::Completed { track_id, owner, .. }
            | DownloadEvent::Failed { track_id, owner, .. }
            | DownloadEvent::Cancelled { track_id, owner } => (owner, track_id),
        };
        let entry = self.owners.get_mut(owner)?.tracks.get_mut(track_id)?;

        match event {
            DownloadEvent::Queued { .. } | DownloadEvent::Cancelled { .. } => {
                entry.status = DownloadStatus::Queued;
                entry.bytes_per_second = 0;
            }
            DownloadEvent::Started { .. } => {
                entry.status = DownloadStatus::Downloading;
            }
            DownloadEvent::Progress {
                bytes_downloaded,
                total_bytes,
                bytes_per_second,
                ..
            } => {
                entry.status = DownloadStatus::Downloading;
                entry.bytes_downloaded = entry.bytes_downloaded.max(*bytes_downloaded);
                if *total_bytes > 0 {
                    entry.total_bytes = *total_bytes;
                }
                entry.bytes_per_second = *bytes_per_second;
            }
            DownloadEvent::Completed { .. } => {
                entry.status = DownloadStatus::Completed;
                entry.total_bytes = entry.total_bytes.max(entry.bytes_downloaded);
                entry.bytes_downloaded = entry.total_bytes;
                entry.bytes_per_second = 0;
            }
            DownloadEvent::Failed { retry_count, .. } => {
                entry.status = DownloadStatus::Error;
                entry.retry_count = *retry_count;
                entry.bytes_per_second = 0;
            }
        }
        Some(owner.clone())
    }

    /// Current `downloadProgress` report for `owner`
    pub fn report(&self, owner: &Owner) -> Option<DownloadProgress> {
        let progress = self.owners.get(owner)?;
        let tracks: Vec<&TrackProgress> = progress
            .order
            .iter()
            .filter_map(|id| progress.tracks.get(id))
            .collect();

        let total_songs = tracks.len();
        let downloaded_songs = tracks
            .iter()
            .filter(|t| t.status == DownloadStatus::Completed)
            .count();

        // Byte-weighted when every size is known, per-song otherwise
        let sizes_known = tracks.iter().all(|t| t.total_bytes > 0);
        let fraction = if total_songs == 0 {
            1.0
        } else if sizes_known {
            let total: u64 = tracks.iter().map(|t| t.total_bytes).sum();
            let remaining: u64 = tracks.iter().map(|t| t.remaining_bytes()).sum();
            (total - remaining.min(total)) as f64 / total as f64
        } else {
            tracks.iter().map(|t| t.fraction()).sum::<f64>() / total_songs as f64
        };

        let download_speed: u64 = tracks
            .iter()
            .filter(|t| t.status == DownloadStatus::Downloading)
            .map(|t| t.bytes_per_second)
            .sum();
        let remaining: u64 = tracks.iter().map(|t| t.remaining_bytes()).sum();
        let estimated_time_remaining = if download_speed > 0 {
            remaining.div_ceil(download_speed)
        } else {
            0
        };

        let status = if downloaded_songs == total_songs {
            DownloadStatus::Completed
        } else if tracks.iter().any(|t| t.status == DownloadStatus::Downloading) {
            DownloadStatus::Downloading
        } else if tracks.iter().any(|t| t.status == DownloadStatus::Error) {
            DownloadStatus::Error
        } else {
            DownloadStatus::Queued
        };

        Some(DownloadProgress {
            token: self.token.clone(),
            playlist_id: owner.id().to_string(),
            progress: (fraction * 1000.0).round() / 10.0,
            download_speed,
            downloaded_songs,
            total_songs,
            estimated_time_remaining,
            status,
            retry_count: tracks.iter().map(|t| t.retry_count).max().unwrap_or(0),
        })
    }
}
