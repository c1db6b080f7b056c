//! Settings database access
//!
//! Read/write node state in the settings table (key-value store). Scalars
//! are stored with `ToString`/`FromStr`; structured values as JSON.

use crate::error::{Error, Result};
use crate::playback::session::SessionSnapshot;
use fleetbox_common::model::{Announcement, Playlist, Schedule};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

const VOLUME: &str = "volume_level";
const SESSION: &str = "playback_session";
const SCHEDULES: &str = "schedules";
const ACTIVE_SCHEDULES: &str = "active_schedule_ids";
const PLAYLIST: &str = "current_playlist";
const MANUAL_PAUSE: &str = "manual_pause";
const ANNOUNCEMENTS: &str = "announcements";

/// Get volume setting (0.0-1.0)
///
/// Stores and returns `default` when nothing has been saved yet.
pub async fn get_volume(db: &Pool<Sqlite>, default: f32) -> Result<f32> {
    match get_setting::<f32>(db, VOLUME).await? {
        Some(vol) => Ok(vol.clamp(0.0, 1.0)),
        None => {
            set_volume(db, default).await?;
            Ok(default.clamp(0.0, 1.0))
        }
    }
}

/// Set volume setting (0.0-1.0)
pub async fn set_volume(db: &Pool<Sqlite>, volume: f32) -> Result<()> {
    let clamped = volume.clamp(0.0, 1.0);
    set_setting(db, VOLUME, clamped).await
}

pub async fn save_session(db: &Pool<Sqlite>, session: &SessionSnapshot) -> Result<()> {
    set_json(db, SESSION, session).await
}

pub async fn load_session(db: &Pool<Sqlite>) -> Result<Option<SessionSnapshot>> {
    get_json(db, SESSION).await
}

/// Persist every known schedule (active or pending)
pub async fn save_schedules(db: &Pool<Sqlite>, schedules: &[Schedule]) -> Result<()> {
    set_json(db, SCHEDULES, &schedules).await
}

pub async fn load_schedules(db: &Pool<Sqlite>) -> Result<Vec<Schedule>> {
    Ok(get_json(db, SCHEDULES).await?.unwrap_or_default())
}

/// Persist the ids of schedules currently holding playback
pub async fn save_active_schedule_ids(db: &Pool<Sqlite>, ids: &[String]) -> Result<()> {
    set_json(db, ACTIVE_SCHEDULES, &ids).await
}

pub async fn load_active_schedule_ids(db: &Pool<Sqlite>) -> Result<Vec<String>> {
    Ok(get_json(db, ACTIVE_SCHEDULES).await?.unwrap_or_default())
}

pub async fn save_playlist(db: &Pool<Sqlite>, playlist: &Playlist) -> Result<()> {
    set_json(db, PLAYLIST, playlist).await
}

pub async fn load_playlist(db: &Pool<Sqlite>) -> Result<Option<Playlist>> {
    get_json(db, PLAYLIST).await
}

/// Persist the scheduled (recurring) announcements
pub async fn save_announcements(db: &Pool<Sqlite>, announcements: &[Announcement]) -> Result<()> {
    set_json(db, ANNOUNCEMENTS, &announcements).await
}

pub async fn load_announcements(db: &Pool<Sqlite>) -> Result<Vec<Announcement>> {
    Ok(get_json(db, ANNOUNCEMENTS).await?.unwrap_or_default())
}

pub async fn set_manual_pause(db: &Pool<Sqlite>, paused: bool) -> Result<()> {
    set_setting(db, MANUAL_PAUSE, paused).await
}

pub async fn get_manual_pause(db: &Pool<Sqlite>) -> Result<bool> {
    Ok(get_setting::<bool>(db, MANUAL_PAUSE).await?.unwrap_or(false))
}

/// Generic setting getter
///
/// Returns None if setting doesn't exist, Error if it cannot be parsed.
pub async fn get_setting<T: FromStr>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match value {
        Some(s) => match s.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(Error::Config(format!(
                "Failed to parse setting '{}' value: {}",
                key, s
            ))),
        },
        None => Ok(None),
    }
}

/// Generic setting setter
///
/// Inserts or updates setting in database.
pub async fn set_setting<T: ToString>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()> {
    let value_str = value.to_string();

    sqlx::query(
        r#"
        INSERT INTO settings (key, value)
        VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value_str)
    .execute(db)
    .await?;

    Ok(())
}

/// JSON-valued getter
pub async fn get_json<T: DeserializeOwned>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
    match get_setting::<String>(db, key).await? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            Error::Config(format!("Failed to decode setting '{}' as JSON: {}", key, e))
        }),
        None => Ok(None),
    }
}

/// JSON-valued setter
pub async fn set_json<T: Serialize + ?Sized>(db: &Pool<Sqlite>, key: &str, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    set_setting(db, key, text).await
}

pub async fn delete_setting(db: &Pool<Sqlite>, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(db)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::playback::session::SessionSnapshot;
    use chrono::{Duration, Utc};
    use fleetbox_common::model::{AnnouncementTrigger, RepeatType, SourceKind, Targets, Track};

    fn sample_playlist() -> Playlist {
        Playlist {
            id: "pl-1".to_string(),
            name: Some("Lobby".to_string()),
            tracks: vec![Track {
                id: "t1".to_string(),
                remote_path: "/lib/t1.mp3".to_string(),
                local_path: None,
                duration: 180.0,
                size: 4_000_000,
                checksum: "abc".to_string(),
                name: None,
                artist: None,
            }],
            looping: true,
        }
    }

    #[tokio::test]
    async fn test_volume_get_set() {
        let db = connect_in_memory().await.unwrap();

        // Default is stored on first read
        let vol = get_volume(&db, 0.5).await.unwrap();
        assert_eq!(vol, 0.5);

        set_volume(&db, 0.75).await.unwrap();
        assert_eq!(get_volume(&db, 0.5).await.unwrap(), 0.75);

        // Volume should be clamped
        set_volume(&db, 1.5).await.unwrap();
        assert_eq!(get_volume(&db, 0.5).await.unwrap(), 1.0);

        set_volume(&db, -0.5).await.unwrap();
        assert_eq!(get_volume(&db, 0.5).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_session_round_trip_and_missing() {
        let db = connect_in_memory().await.unwrap();
        assert!(load_session(&db).await.unwrap().is_none());

        let snapshot = SessionSnapshot {
            source: SourceKind::Schedule,
            playlist_id: "pl-1".to_string(),
            schedule_id: Some("sch-1".to_string()),
            index: 3,
            position_secs: 42.5,
            is_playing: true,
            saved_at: Utc::now(),
        };
        save_session(&db, &snapshot).await.unwrap();
        assert_eq!(load_session(&db).await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_schedules_and_playlist_persist() {
        let db = connect_in_memory().await.unwrap();
        assert!(load_schedules(&db).await.unwrap().is_empty());

        let now = Utc::now();
        let schedule = Schedule {
            id: "sch-1".to_string(),
            playlist: sample_playlist(),
            start_date: now,
            end_date: now + Duration::hours(1),
            repeat_type: RepeatType::Weekly,
            targets: Targets::default(),
        };
        save_schedules(&db, std::slice::from_ref(&schedule)).await.unwrap();
        save_active_schedule_ids(&db, &["sch-1".to_string()]).await.unwrap();
        save_playlist(&db, &sample_playlist()).await.unwrap();

        assert_eq!(load_schedules(&db).await.unwrap(), vec![schedule]);
        assert_eq!(load_active_schedule_ids(&db).await.unwrap(), vec!["sch-1".to_string()]);
        assert_eq!(load_playlist(&db).await.unwrap(), Some(sample_playlist()));
    }

    #[tokio::test]
    async fn test_scheduled_announcements_persist() {
        let db = connect_in_memory().await.unwrap();
        assert!(load_announcements(&db).await.unwrap().is_empty());

        let mut hourly = Announcement::immediate("hourly", sample_playlist().tracks[0].clone());
        hourly.schedule_type = AnnouncementTrigger::Minutes;
        hourly.minute_interval = Some(60);
        save_announcements(&db, std::slice::from_ref(&hourly)).await.unwrap();
        assert_eq!(load_announcements(&db).await.unwrap(), vec![hourly]);
    }

    #[tokio::test]
    async fn test_manual_pause_flag() {
        let db = connect_in_memory().await.unwrap();
        assert!(!get_manual_pause(&db).await.unwrap());
        set_manual_pause(&db, true).await.unwrap();
        assert!(get_manual_pause(&db).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_json_is_reported() {
        let db = connect_in_memory().await.unwrap();
        set_setting(&db, "schedules", "{not json").await.unwrap();
        assert!(matches!(load_schedules(&db).await, Err(Error::Config(_))));

        delete_setting(&db, "schedules").await.unwrap();
        assert!(load_schedules(&db).await.unwrap().is_empty());
    }
}
