//! Persisted key/value store
//!
//! A single SQLite `settings` table holds everything that must survive a
//! restart: volume, playback session, schedules, the base playlist and the
//! manual-pause flag. Play history has its own append-only table.

pub mod history;
pub mod init;
pub mod settings;

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::info;

/// Open (creating if missing) the node database and ensure the schema
pub async fn connect(path: &Path) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    info!("Opened database at {}", path.display());
    init::create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database with the schema applied
///
/// Limited to one connection: every SQLite memory connection is a separate
/// database.
pub async fn connect_in_memory() -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init::create_schema(&pool).await?;
    Ok(pool)
}
