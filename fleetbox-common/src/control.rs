//! Fleet control channel messages
//!
//! Every message is a JSON object with a `type` discriminator. Inbound
//! messages ([`ControlMessage`]) carry content and commands from the fleet
//! server; outbound messages ([`StatusMessage`]) report device state back.
//!
//! # Examples
//!
//! ```
//! use fleetbox_common::control::{ControlMessage, DeviceCommand};
//!
//! let msg = ControlMessage::from_json(
//!     r#"{"type":"command","command":"setVolume","value":0.4}"#,
//! ).unwrap();
//! match msg {
//!     ControlMessage::Command { .. } => {
//!         assert_eq!(msg.device_command().unwrap(), Some(DeviceCommand::SetVolume(0.4)));
//!     }
//!     _ => unreachable!(),
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{Announcement, DownloadStatus, Playlist, Schedule};
use crate::{Error, Result};

// ========================================
// Inbound
// ========================================

/// Message received from the fleet server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Replace the base playlist
    PlaylistPush { playlist: Playlist },

    ScheduleCreated { schedule: Schedule },

    ScheduleUpdated { schedule: Schedule },

    /// Either the full schedule or just `{ "id": ... }`
    ScheduleDeleted { schedule: ScheduleRef },

    /// Direct device command
    Command {
        command: CommandKind,
        #[serde(default, alias = "volume", skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
        #[serde(default, rename = "scheduleId", skip_serializing_if = "Option::is_none")]
        schedule_id: Option<String>,
    },

    /// Queue an interrupt announcement, or register a scheduled one
    Announcement { announcement: Announcement },

    /// Forget an announcement and delete its cached file
    DeleteAnnouncement {
        #[serde(rename = "announcementId", alias = "data")]
        announcement_id: String,
    },
}

/// Identifies a schedule without requiring its full payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRef {
    pub id: String,
}

/// Command names accepted in a `command` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    SetVolume,
    Play,
    Pause,
    Restart,
    ResetSchedule,
}

/// Validated form of a `command` message
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Volume on the 0.0-1.0 scale
    SetVolume(f32),
    Play,
    Pause,
    Restart,
    /// Clear the error state of a schedule that fell back to the playlist
    ResetSchedule(String),
}

impl ControlMessage {
    /// Parse a single JSON control message
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidInput(format!("malformed control message: {}", e)))
    }

    /// Message type name as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::PlaylistPush { .. } => "playlistPush",
            ControlMessage::ScheduleCreated { .. } => "scheduleCreated",
            ControlMessage::ScheduleUpdated { .. } => "scheduleUpdated",
            ControlMessage::ScheduleDeleted { .. } => "scheduleDeleted",
            ControlMessage::Command { .. } => "command",
            ControlMessage::Announcement { .. } => "announcement",
            ControlMessage::DeleteAnnouncement { .. } => "deleteAnnouncement",
        }
    }

    /// Validate a `command` message; `Ok(None)` for every other type
    pub fn device_command(&self) -> Result<Option<DeviceCommand>> {
        let ControlMessage::Command {
            command,
            value,
            schedule_id,
        } = self
        else {
            return Ok(None);
        };

        let cmd = match command {
            CommandKind::SetVolume => {
                let raw = value.ok_or_else(|| {
                    Error::InvalidInput("setVolume requires a value".to_string())
                })?;
                DeviceCommand::SetVolume(normalize_volume(raw)?)
            }
            CommandKind::Play => DeviceCommand::Play,
            CommandKind::Pause => DeviceCommand::Pause,
            CommandKind::Restart => DeviceCommand::Restart,
            CommandKind::ResetSchedule => {
                let id = schedule_id.clone().ok_or_else(|| {
                    Error::InvalidInput("resetSchedule requires scheduleId".to_string())
                })?;
                DeviceCommand::ResetSchedule(id)
            }
        };
        Ok(Some(cmd))
    }
}

/// Map a volume value to 0.0-1.0
///
/// Values above 1.0 are read as percentages (the dashboard slider sends 0-100).
pub fn normalize_volume(raw: f64) -> Result<f32> {
    if !raw.is_finite() || raw < 0.0 {
        return Err(Error::InvalidInput(format!("invalid volume: {}", raw)));
    }
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    Ok(scaled.min(1.0) as f32)
}

// ========================================
// Outbound
// ========================================

/// What the base playlist is doing, as seen by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistStatus {
    Idle,
    Playing,
    Paused,
    /// Pre-empted by a schedule
    Schedule,
    /// Pre-empted by an announcement
    Announcement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub token: String,
    pub is_online: bool,
    /// 0-100
    pub volume: u8,
    pub playlist_status: PlaylistStatus,
}

/// Aggregated download progress for one playlist or schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub token: String,
    pub playlist_id: String,
    /// Percent, 0-100
    pub progress: f64,
    /// Bytes per second
    pub download_speed: u64,
    pub downloaded_songs: usize,
    pub total_songs: usize,
    /// Seconds
    pub estimated_time_remaining: u64,
    pub status: DownloadStatus,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub song_id: Option<String>,
    /// Seconds
    pub current_time: f64,
    /// Seconds
    pub duration: f64,
    pub completed: bool,
}

/// Message sent to the fleet server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusMessage {
    DeviceStatus(DeviceStatus),
    DownloadProgress(DownloadProgress),
    PlaybackStatus(PlaybackStatus),
}

impl StatusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            StatusMessage::DeviceStatus(_) => "deviceStatus",
            StatusMessage::DownloadProgress(_) => "downloadProgress",
            StatusMessage::PlaybackStatus(_) => "playbackStatus",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_playlist_push() {
        let msg = ControlMessage::from_json(
            r#"{"type":"playlistPush","playlist":{"id":"pl-1","tracks":[
                {"id":"t1","remotePath":"/lib/t1.mp3","duration":200,"checksum":"ab"}
            ],"loop":false}}"#,
        )
        .unwrap();

        match msg {
            ControlMessage::PlaylistPush { playlist } => {
                assert_eq!(playlist.id, "pl-1");
                assert!(!playlist.looping);
                assert_eq!(playlist.tracks[0].duration, 200.0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_schedule_deleted_accepts_bare_id() {
        let msg = ControlMessage::from_json(
            r#"{"type":"scheduleDeleted","schedule":{"id":"sch-9"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::ScheduleDeleted {
                schedule: ScheduleRef {
                    id: "sch-9".to_string()
                }
            }
        );
    }

    #[test]
    fn test_delete_announcement_accepts_data_field() {
        let msg = ControlMessage::from_json(r#"{"type":"deleteAnnouncement","data":"a-7"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::DeleteAnnouncement {
                announcement_id: "a-7".to_string()
            }
        );
        assert_eq!(msg.kind(), "deleteAnnouncement");
    }

    #[test]
    fn test_set_volume_accepts_percent_and_fraction() {
        let percent = ControlMessage::from_json(
            r#"{"type":"command","command":"setVolume","volume":70}"#,
        )
        .unwrap();
        assert_eq!(
            percent.device_command().unwrap(),
            Some(DeviceCommand::SetVolume(0.7))
        );

        let fraction = ControlMessage::from_json(
            r#"{"type":"command","command":"setVolume","value":0.25}"#,
        )
        .unwrap();
        assert_eq!(
            fraction.device_command().unwrap(),
            Some(DeviceCommand::SetVolume(0.25))
        );
    }

    #[test]
    fn test_set_volume_without_value_is_rejected() {
        let msg = ControlMessage::from_json(r#"{"type":"command","command":"setVolume"}"#)
            .unwrap();
        assert!(matches!(msg.device_command(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = ControlMessage::from_json(r#"{"type":"reboot"}"#);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_reset_schedule_requires_id() {
        let ok = ControlMessage::from_json(
            r#"{"type":"command","command":"resetSchedule","scheduleId":"s1"}"#,
        )
        .unwrap();
        assert_eq!(
            ok.device_command().unwrap(),
            Some(DeviceCommand::ResetSchedule("s1".to_string()))
        );

        let missing =
            ControlMessage::from_json(r#"{"type":"command","command":"resetSchedule"}"#).unwrap();
        assert!(missing.device_command().is_err());
    }

    #[test]
    fn test_download_progress_wire_format() {
        let msg = StatusMessage::DownloadProgress(DownloadProgress {
            token: "dev-42".to_string(),
            playlist_id: "pl-7".to_string(),
            progress: 63.5,
            download_speed: 184_320,
            downloaded_songs: 4,
            total_songs: 7,
            estimated_time_remaining: 38,
            status: DownloadStatus::Downloading,
            retry_count: 0,
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "downloadProgress",
                "token": "dev-42",
                "playlistId": "pl-7",
                "progress": 63.5,
                "downloadSpeed": 184320,
                "downloadedSongs": 4,
                "totalSongs": 7,
                "estimatedTimeRemaining": 38,
                "status": "downloading",
                "retryCount": 0
            })
        );
    }

    #[test]
    fn test_device_status_wire_format() {
        let msg = StatusMessage::DeviceStatus(DeviceStatus {
            token: "dev-1".to_string(),
            is_online: true,
            volume: 50,
            playlist_status: PlaylistStatus::Schedule,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "deviceStatus");
        assert_eq!(value["isOnline"], true);
        assert_eq!(value["playlistStatus"], "schedule");
    }
}
