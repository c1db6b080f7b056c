//! Download jobs, owners and priorities

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use fleetbox_common::model::{ContentBucket, DownloadStatus, Playlist, Schedule, Track};
use fleetbox_common::time;

/// Seconds in the "high" window (schedule starts within an hour)
const HIGH_WINDOW_SECS: f64 = 3600.0;

/// Seconds in the "medium" window (within a day)
const MEDIUM_WINDOW_SECS: f64 = 86_400.0;

/// What a download belongs to; deleting the owner cancels its jobs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Owner {
    Playlist(String),
    Schedule(String),
    Announcement(String),
}

impl Owner {
    /// Storage bucket; announcements behave like schedule content
    pub fn bucket(&self) -> ContentBucket {
        match self {
            Owner::Playlist(_) => ContentBucket::Playlist,
            Owner::Schedule(_) | Owner::Announcement(_) => ContentBucket::Schedule,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Owner::Playlist(id) | Owner::Schedule(id) | Owner::Announcement(id) => id,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Playlist(id) => write!(f, "playlist:{}", id),
            Owner::Schedule(id) => write!(f, "schedule:{}", id),
            Owner::Announcement(id) => write!(f, "announcement:{}", id),
        }
    }
}

/// Download urgency, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    /// Needed by the playing source right now
    Immediate,
}

impl Priority {
    /// Bucket a time-to-need into a priority
    pub fn from_time_to_need(seconds: f64) -> Self {
        if seconds <= HIGH_WINDOW_SECS {
            Priority::High
        } else if seconds <= MEDIUM_WINDOW_SECS {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

/// Priority of every track of a playing playlist, indexed like `playlist.tracks`
///
/// The current and next tracks are `Immediate`; later tracks are bucketed by
/// the summed duration of the tracks ahead of them in play order.
pub fn playlist_priorities(playlist: &Playlist, current_index: usize) -> Vec<Priority> {
    let len = playlist.tracks.len();
    let mut priorities = vec![Priority::Low; len];
    if len == 0 {
        return priorities;
    }

    let start = current_index.min(len - 1);
    let mut ahead_secs = 0.0;
    for offset in 0..len {
        let index = (start + offset) % len;
        if offset > 0 && index < start && !playlist.looping {
            // Tracks before the current one are never reached again
            break;
        }
        priorities[index] = if offset <= 1 {
            Priority::Immediate
        } else {
            Priority::from_time_to_need(ahead_secs)
        };
        ahead_secs += playlist.tracks[index].duration.max(0.0);
    }
    priorities
}

/// Priority of every track of a schedule at `now`
///
/// An active schedule is treated like a playing playlist from its first
/// track; a future one is bucketed by time until its start.
pub fn schedule_priorities(schedule: &Schedule, now: DateTime<Utc>) -> Vec<Priority> {
    if schedule.start_date <= now {
        return playlist_priorities(&schedule.playlist, 0);
    }
    let until_start = time::seconds_until(schedule.start_date, now) as f64;
    vec![Priority::from_time_to_need(until_start); schedule.playlist.tracks.len()]
}

/// One track download
///
/// `owner` and `local_path` name the copy being fetched; every owner sharing
/// the track is listed in `owners`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: Uuid,
    pub track: Track,
    pub owner: Owner,
    pub owners: Vec<Owner>,
    pub bucket: ContentBucket,
    pub priority: Priority,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub local_path: PathBuf,
}

impl DownloadJob {
    pub fn new(track: Track, owner: Owner, priority: Priority, local_path: PathBuf) -> Self {
        let total_bytes = track.size;
        Self {
            id: Uuid::new_v4(),
            bucket: owner.bucket(),
            owners: vec![owner.clone()],
            track,
            owner,
            priority,
            status: DownloadStatus::Queued,
            bytes_downloaded: 0,
            total_bytes,
            retry_count: 0,
            last_error: None,
            local_path,
        }
    }

    /// Completion ratio 0.0-1.0 (0 when the size is unknown)
    pub fn fraction(&self) -> f64 {
        if self.status == DownloadStatus::Completed {
            1.0
        } else if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes_downloaded as f64 / self.total_bytes as f64).min(1.0)
        }
    }
}
