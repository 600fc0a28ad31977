//! Media file access
//!
//! Fetch-by-id for the source queue's open path and filtered id
//! enumeration for queue construction. The filter string is an opaque SQL
//! predicate produced by the external query parser; this module never
//! interprets it.

use crate::error::{Error, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Media file metadata needed by the engine
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MediaFile {
    pub id: u32,
    pub path: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub disabled: bool,
}

/// Sort order for queue construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySort {
    None,
    Name,
    Album,
}

impl QuerySort {
    /// Parse the frontend's sort key; unknown keys mean no sorting.
    pub fn from_key(key: Option<&str>) -> Self {
        match key {
            Some("name") => QuerySort::Name,
            Some("album") => QuerySort::Album,
            _ => QuerySort::None,
        }
    }

    fn order_clause(self) -> &'static str {
        match self {
            QuerySort::None => "",
            QuerySort::Name => " ORDER BY title",
            QuerySort::Album => " ORDER BY album, title",
        }
    }
}

/// Fetch a media file by id.
///
/// Returns [`Error::MediaUnavailable`] when the id is unknown.
pub async fn fetch_by_id(db: &SqlitePool, id: u32) -> Result<MediaFile> {
    let row = sqlx::query_as::<_, MediaFile>(
        "SELECT id, path, title, artist, album, disabled FROM files WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;

    row.ok_or(Error::MediaUnavailable(id))
}

/// Enumerate media file ids matching `filter`, in query order.
///
/// # Arguments
/// - `filter`: opaque SQL predicate from the query parser, or None for all
/// - `sort`: result ordering
///
/// Fails when the result set is empty so callers do not build empty
/// queues.
pub async fn query_ids(db: &SqlitePool, filter: Option<&str>, sort: QuerySort) -> Result<Vec<u32>> {
    let mut sql = String::from("SELECT id FROM files");
    if let Some(f) = filter {
        sql.push_str(" WHERE ");
        sql.push_str(f);
    }
    sql.push_str(sort.order_clause());

    let rows: Vec<(u32,)> = sqlx::query_as(&sql).fetch_all(db).await?;
    debug!("Queue query returned {} items", rows.len());

    if rows.is_empty() {
        return Err(Error::QueueEmpty);
    }

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_db() -> SqlitePool {
        let pool = ensemble_common::db::init_memory().await.unwrap();
        for (id, title, album, disabled) in [
            (1, "Alpha", "First", false),
            (2, "Bravo", "Second", true),
            (3, "Charlie", "First", false),
        ] {
            sqlx::query("INSERT INTO files (id, path, title, artist, album, disabled) VALUES (?, ?, ?, '', ?, ?)")
                .bind(id)
                .bind(format!("/music/{}.flac", title))
                .bind(title)
                .bind(album)
                .bind(disabled)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_fetch_by_id() {
        let db = seed_db().await;

        let mf = fetch_by_id(&db, 2).await.unwrap();
        assert_eq!(mf.title, "Bravo");
        assert!(mf.disabled);

        assert!(matches!(
            fetch_by_id(&db, 99).await,
            Err(Error::MediaUnavailable(99))
        ));
    }

    #[tokio::test]
    async fn test_query_ids_sorted() {
        let db = seed_db().await;

        let all = query_ids(&db, None, QuerySort::None).await.unwrap();
        assert_eq!(all, vec![1, 2, 3]);

        let by_album = query_ids(&db, None, QuerySort::Album).await.unwrap();
        assert_eq!(by_album, vec![1, 3, 2]);
    }

    #[tokio::test]
    async fn test_query_ids_empty_fails() {
        let db = seed_db().await;
        let result = query_ids(&db, Some("id > 100"), QuerySort::None).await;
        assert!(matches!(result, Err(Error::QueueEmpty)));
    }

    #[test]
    fn test_sort_from_key() {
        assert_eq!(QuerySort::from_key(Some("name")), QuerySort::Name);
        assert_eq!(QuerySort::from_key(Some("album")), QuerySort::Album);
        assert_eq!(QuerySort::from_key(Some("bogus")), QuerySort::None);
        assert_eq!(QuerySort::from_key(None), QuerySort::None);
    }
}
