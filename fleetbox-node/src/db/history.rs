//! Play history
//!
//! One row per track that stopped playing, from any source. A play counts
//! as completed once 90% of the track's duration was heard.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Sqlite};

use crate::error::Result;
use fleetbox_common::model::SourceKind;

/// Share of the duration that makes a play count as completed
pub const COMPLETION_RATIO: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayRecord {
    #[serde(rename = "deviceId")]
    pub token: String,
    #[serde(rename = "songId")]
    pub track_id: String,
    pub source: SourceKind,
    /// Whole seconds heard
    pub play_duration: u64,
    pub completed: bool,
    pub played_at: DateTime<Utc>,
}

impl PlayRecord {
    /// An unknown duration never counts as completed
    pub fn new(
        token: &str,
        track_id: &str,
        source: SourceKind,
        played_secs: f64,
        duration: f64,
        played_at: DateTime<Utc>,
    ) -> Self {
        let played_secs = played_secs.max(0.0);
        Self {
            token: token.to_string(),
            track_id: track_id.to_string(),
            source,
            play_duration: played_secs.floor() as u64,
            completed: duration > 0.0 && played_secs >= duration * COMPLETION_RATIO,
            played_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    token: String,
    track_id: String,
    source: String,
    play_duration: i64,
    completed: bool,
    played_at: DateTime<Utc>,
}

pub async fn create_table(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS play_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token TEXT NOT NULL,
            track_id TEXT NOT NULL,
            source TEXT NOT NULL,
            play_duration INTEGER NOT NULL,
            completed INTEGER NOT NULL,
            played_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Append `record`, keeping at most `keep` rows
pub async fn record(db: &Pool<Sqlite>, record: &PlayRecord, keep: u32) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO play_history (token, track_id, source, play_duration, completed, played_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.token)
    .bind(&record.track_id)
    .bind(record.source.as_str())
    .bind(record.play_duration as i64)
    .bind(record.completed)
    .bind(record.played_at)
    .execute(db)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM play_history
        WHERE id NOT IN (SELECT id FROM play_history ORDER BY id DESC LIMIT ?)
        "#,
    )
    .bind(i64::from(keep.max(1)))
    .execute(db)
    .await?;
    Ok(())
}

/// Newest first
pub async fn recent(db: &Pool<Sqlite>, limit: u32) -> Result<Vec<PlayRecord>> {
    let rows = sqlx::query_as::<_, HistoryRow>(
        r#"
        SELECT token, track_id, source, play_duration, completed, played_at
        FROM play_history
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(i64::from(limit))
    .fetch_all(db)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let source = row
            .source
            .parse::<SourceKind>()
            .map_err(|e| crate::error::Error::Config(format!("Corrupt history row: {}", e)))?;
        records.push(PlayRecord {
            token: row.token,
            track_id: row.track_id,
            source,
            play_duration: row.play_duration.max(0) as u64,
            completed: row.completed,
            played_at: row.played_at,
        });
    }
    Ok(records)
}
