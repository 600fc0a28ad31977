//! Database bootstrap
//!
//! Opens (creating if necessary) the shared SQLite database and ensures
//! the schema exists. All Ensemble modules go through this so the schema
//! is defined in exactly one place.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Open the database at `path`, creating file and schema if missing.
pub async fn init_database(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new().connect_with(options).await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    create_schema(&pool).await?;

    info!("Database ready at {}", path.display());
    Ok(pool)
}

/// Open an in-memory database with the full schema (tests, tooling).
pub async fn init_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables if they do not exist.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            artist TEXT NOT NULL DEFAULT '',
            album TEXT NOT NULL DEFAULT '',
            disabled INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_memory_creates_schema() {
        let pool = init_memory().await.unwrap();

        sqlx::query("INSERT INTO files (id, path, title) VALUES (1, '/music/a.flac', 'A')")
            .execute(&pool)
            .await
            .unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn test_init_database_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("ensemble.db");

        let pool = init_database(&db_path).await.unwrap();
        drop(pool);

        assert!(db_path.exists());
    }
}
