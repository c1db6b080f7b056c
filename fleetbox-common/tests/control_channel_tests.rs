//! Fleet control channel wire format
//!
//! Parses full inbound payloads as the fleet server sends them and checks
//! outbound status messages field by field.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use fleetbox_common::control::{
    ControlMessage, DeviceCommand, DownloadProgress, PlaybackStatus, StatusMessage,
};
use fleetbox_common::model::{DownloadStatus, RepeatType};

#[test]
fn test_schedule_created_full_payload() {
    let msg = ControlMessage::from_json(
        &json!({
            "type": "scheduleCreated",
            "schedule": {
                "id": "sch-7",
                "playlist": {
                    "id": "pl-morning",
                    "name": "Morning",
                    "songs": [
                        {"id": "s1", "filePath": "/media/s1.mp3", "duration": 180, "size": 1024,
                         "checksum": "aa"},
                        {"id": "s2", "remotePath": "/media/s2.ogg", "duration": 200}
                    ],
                    "loop": true
                },
                "startDate": "2030-05-01T08:00:00Z",
                "endDate": "2030-05-01T10:00:00Z",
                "repeatType": "daily",
                "targets": {"devices": ["dev-1"], "groups": ["lobby"]}
            }
        })
        .to_string(),
    )
    .unwrap();

    let ControlMessage::ScheduleCreated { schedule } = msg else {
        panic!("wrong message type");
    };
    assert_eq!(schedule.id, "sch-7");
    assert_eq!(schedule.repeat_type, RepeatType::Daily);
    assert_eq!(schedule.targets.groups, vec!["lobby".to_string()]);
    assert_eq!(schedule.start_date, Utc.with_ymd_and_hms(2030, 5, 1, 8, 0, 0).unwrap());
    assert!(schedule.validate().is_ok());

    let playlist = &schedule.playlist;
    assert!(playlist.looping);
    assert_eq!(playlist.tracks.len(), 2);
    assert_eq!(playlist.tracks[0].remote_path, "/media/s1.mp3");
    assert_eq!(playlist.tracks[1].extension(), "ogg");
    assert!(!playlist.tracks[1].has_checksum());
}

#[test]
fn test_announcement_and_commands() {
    let msg = ControlMessage::from_json(
        r#"{"type":"announcement","announcement":{"id":"a1","priority":2,
            "track":{"id":"chime","remotePath":"/ann/chime.mp3","duration":4}}}"#,
    )
    .unwrap();
    assert_eq!(msg.kind(), "announcement");
    assert_eq!(msg.device_command().unwrap(), None);

    let cases = [
        (r#"{"type":"command","command":"play"}"#, DeviceCommand::Play),
        (r#"{"type":"command","command":"pause"}"#, DeviceCommand::Pause),
        (r#"{"type":"command","command":"restart"}"#, DeviceCommand::Restart),
        (
            r#"{"type":"command","command":"setVolume","volume":75}"#,
            DeviceCommand::SetVolume(0.75),
        ),
        (
            r#"{"type":"command","command":"resetSchedule","scheduleId":"sch-7"}"#,
            DeviceCommand::ResetSchedule("sch-7".to_string()),
        ),
    ];
    for (text, expected) in cases {
        let msg = ControlMessage::from_json(text).unwrap();
        assert_eq!(msg.device_command().unwrap(), Some(expected), "{}", text);
    }
}

#[test]
fn test_outbound_download_progress_matches_fleet_format() {
    let msg = StatusMessage::DownloadProgress(DownloadProgress {
        token: "dev-1".to_string(),
        playlist_id: "pl-1".to_string(),
        progress: 57.1,
        download_speed: 524_288,
        downloaded_songs: 4,
        total_songs: 7,
        estimated_time_remaining: 38,
        status: DownloadStatus::Downloading,
        retry_count: 0,
    });

    let value: Value = serde_json::to_value(&msg).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "downloadProgress",
            "token": "dev-1",
            "playlistId": "pl-1",
            "progress": 57.1,
            "downloadSpeed": 524288,
            "downloadedSongs": 4,
            "totalSongs": 7,
            "estimatedTimeRemaining": 38,
            "status": "downloading",
            "retryCount": 0
        })
    );
}

#[test]
fn test_outbound_playback_status() {
    let msg = StatusMessage::PlaybackStatus(PlaybackStatus {
        is_playing: true,
        song_id: Some("s1".to_string()),
        current_time: 12.5,
        duration: 180.0,
        completed: false,
    });
    let value: Value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "playbackStatus");
    assert_eq!(value["isPlaying"], true);
    assert_eq!(value["songId"], "s1");
    assert_eq!(value["currentTime"], 12.5);
}
