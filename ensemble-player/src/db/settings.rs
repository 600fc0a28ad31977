//! Settings database access
//!
//! Read/write settings from the settings table (key-value store). The
//! player persists exactly one key: the last commanded volume.

use crate::error::Result;
use sqlx::SqlitePool;

const VAR_PLAYER_VOLUME: &str = "player:volume";

/// Default volume when no setting has been stored yet.
pub const DEFAULT_VOLUME: u8 = 75;

/// Get the persisted volume (0-100), writing the default back when unset.
pub async fn get_volume(db: &SqlitePool) -> Result<u8> {
    match get_setting(db, VAR_PLAYER_VOLUME).await? {
        Some(value) => Ok(value.parse::<u8>().unwrap_or(DEFAULT_VOLUME).min(100)),
        None => {
            save_volume(db, DEFAULT_VOLUME).await?;
            Ok(DEFAULT_VOLUME)
        }
    }
}

/// Persist the volume (0-100).
pub async fn save_volume(db: &SqlitePool, volume: u8) -> Result<()> {
    set_setting(db, VAR_PLAYER_VOLUME, &volume.min(100).to_string()).await
}

async fn get_setting(db: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    Ok(row.map(|(v,)| v))
}

async fn set_setting(db: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(db)
    .await?;

    Ok(())
}
