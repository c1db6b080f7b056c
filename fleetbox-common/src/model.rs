//! Content model shared by the control channel and the node
//!
//! These types are the JSON payloads pushed by the fleet server. Field names
//! are camelCase on the wire; aliases accept the older `songs`/`filePath`
//! spelling still emitted by some server versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single audio file referenced by a playlist, schedule or announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Stable track identifier (also the cache file stem)
    pub id: String,

    /// Path of the file on the media library server
    #[serde(alias = "filePath")]
    pub remote_path: String,

    /// Local cache path, filled in by the node once the file is verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,

    /// Duration in seconds
    #[serde(default)]
    pub duration: f64,

    /// Size in bytes (0 when the server did not report it)
    #[serde(default)]
    pub size: u64,

    /// Lowercase hex SHA-256 of the whole file; empty means "not verifiable"
    #[serde(default)]
    pub checksum: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
}

impl Track {
    /// File extension taken from the remote path, `mp3` when absent
    pub fn extension(&self) -> &str {
        let file_name = self.remote_path.rsplit('/').next().unwrap_or("");
        match file_name.rsplit_once('.') {
            Some((stem, ext))
                if !stem.is_empty()
                    && !ext.is_empty()
                    && ext.len() <= 5
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                ext
            }
            _ => "mp3",
        }
    }

    /// Whether a whole-file checksum is available for verification
    pub fn has_checksum(&self) -> bool {
        !self.checksum.trim().is_empty()
    }
}

/// Ordered list of tracks; order is play order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(alias = "songs")]
    pub tracks: Vec<Track>,

    /// Restart from the first track after the last one ends
    #[serde(rename = "loop", default = "default_loop")]
    pub looping: bool,
}

fn default_loop() -> bool {
    true
}

impl Playlist {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Index of the track that follows `index`, honoring the loop flag
    pub fn next_index(&self, index: usize) -> Option<usize> {
        if self.tracks.is_empty() {
            return None;
        }
        let next = index + 1;
        if next < self.tracks.len() {
            Some(next)
        } else if self.looping {
            Some(0)
        } else {
            None
        }
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }
}

/// How the fleet server repeats a schedule
///
/// The node only evaluates the concrete window it receives; the repeat type
/// is carried for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatType {
    #[default]
    Once,
    Daily,
    Weekly,
    Monthly,
}

/// Devices and device groups a schedule applies to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// A time-boxed program that pre-empts the base playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub playlist: Playlist,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub repeat_type: RepeatType,
    #[serde(default)]
    pub targets: Targets,
}

impl Schedule {
    /// True iff `now` lies in `[start_date, end_date]`
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && now <= self.end_date
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_date < now
    }

    /// Reject windows that can never activate and empty programs
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidInput("schedule id is empty".to_string()));
        }
        if self.end_date < self.start_date {
            return Err(Error::InvalidInput(format!(
                "schedule {} ends ({}) before it starts ({})",
                self.id, self.end_date, self.start_date
            )));
        }
        if self.playlist.is_empty() {
            return Err(Error::InvalidInput(format!(
                "schedule {} has an empty playlist",
                self.id
            )));
        }
        Ok(())
    }
}

/// When an announcement goes on air
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementTrigger {
    /// As soon as its file is ready
    #[default]
    Immediate,
    /// After every `songInterval` finished tracks
    Songs,
    /// Every `minuteInterval` minutes
    Minutes,
    /// At each local `HH:MM` in `specificTimes`, once per day
    Specific,
}

/// Short interrupt message that pre-empts every other source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    #[serde(alias = "_id")]
    pub id: String,
    pub track: Track,
    /// Lower value plays first
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub schedule_type: AnnouncementTrigger,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_interval: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute_interval: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specific_times: Vec<String>,

    /// Scheduled announcements only fire inside `[start_date, end_date]`;
    /// a missing bound is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl Announcement {
    /// One-shot announcement played as soon as possible
    pub fn immediate(id: impl Into<String>, track: Track) -> Self {
        Self {
            id: id.into(),
            track,
            priority: 0,
            schedule_type: AnnouncementTrigger::Immediate,
            song_interval: None,
            minute_interval: None,
            specific_times: Vec::new(),
            start_date: None,
            end_date: None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule_type != AnnouncementTrigger::Immediate
    }

    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        self.start_date.map(|start| start <= now).unwrap_or(true)
            && self.end_date.map(|end| now <= end).unwrap_or(true)
    }

    /// Check the trigger has the parameters it needs
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidInput("announcement id is empty".to_string()));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(Error::InvalidInput(format!(
                    "announcement {} ends before it starts",
                    self.id
                )));
            }
        }
        match self.schedule_type {
            AnnouncementTrigger::Immediate => {}
            AnnouncementTrigger::Songs => {
                if self.song_interval.unwrap_or(0) == 0 {
                    return Err(Error::InvalidInput(format!(
                        "announcement {} needs songInterval >= 1",
                        self.id
                    )));
                }
            }
            AnnouncementTrigger::Minutes => {
                if self.minute_interval.unwrap_or(0) == 0 {
                    return Err(Error::InvalidInput(format!(
                        "announcement {} needs minuteInterval >= 1",
                        self.id
                    )));
                }
            }
            AnnouncementTrigger::Specific => {
                if self.specific_times.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "announcement {} has no specificTimes",
                        self.id
                    )));
                }
                if let Some(bad) = self.specific_times.iter().find(|t| !is_clock_time(t)) {
                    return Err(Error::InvalidInput(format!(
                        "announcement {}: {:?} is not HH:MM",
                        self.id, bad
                    )));
                }
            }
        }
        Ok(())
    }
}

/// `HH:MM`, 24-hour, zero padded
fn is_clock_time(text: &str) -> bool {
    match text.split_once(':') {
        Some((h, m)) if h.len() == 2 && m.len() == 2 => {
            matches!((h.parse::<u8>(), m.parse::<u8>()), (Ok(h), Ok(m)) if h < 24 && m < 60)
        }
        _ => false,
    }
}

/// Which storage area a download belongs to
///
/// Schedule-bucket partial files are discarded on cancel; playlist-bucket
/// partials are kept for resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentBucket {
    Playlist,
    Schedule,
}

/// Audible content source, ordered by priority (lowest first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Playlist,
    Schedule,
    Announcement,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Playlist => "playlist",
            SourceKind::Schedule => "schedule",
            SourceKind::Announcement => "announcement",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "playlist" => Ok(SourceKind::Playlist),
            "schedule" => Ok(SourceKind::Schedule),
            "announcement" => Ok(SourceKind::Announcement),
            other => Err(Error::InvalidInput(format!("unknown source '{}'", other))),
        }
    }
}

/// Lifecycle of a download job as reported to the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}
