//! Database initialization functions

use crate::error::Result;
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Create the settings and history tables if they do not exist
pub async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    super::history::create_table(pool).await?;
    Ok(())
}

/// Initialize settings table with default values
///
/// Existing values are never overwritten.
pub async fn init_settings_defaults(pool: &Pool<Sqlite>, default_volume: f32) -> Result<()> {
    info!("Initializing default settings");

    let volume = default_volume.clamp(0.0, 1.0).to_string();
    let defaults = vec![
        ("volume_level", volume.as_str()),
        ("manual_pause", "false"),
        ("schedules", "[]"),
        ("active_schedule_ids", "[]"),
        ("announcements", "[]"),
    ];

    for (key, default_value) in defaults {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
                .bind(key)
                .fetch_one(pool)
                .await?;

        if !exists {
            sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(default_value)
                .execute(pool)
                .await?;

            info!("Initialized setting '{}' with default value: {}", key, default_value);
        }
    }

    Ok(())
}
