//! Document catalog.
//!
//! The `documents` table keeps the latest ingested text and metadata for
//! each document, independent of the vector index. It backs `sts get`,
//! automatic version assignment, and the document list a model migration
//! walks.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, Row, Sqlite, SqlitePool, Type};

use standards_search_core::chunk::hash_text;
use standards_search_core::models::{Document, DocumentMetadata};
use standards_search_core::{RagError, Result};

/// A catalog row.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogDocument {
    pub id: String,
    pub content_version: u64,
    pub metadata: DocumentMetadata,
    pub body: String,
    pub body_hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Decode a column, reporting a type mismatch as corruption.
fn col<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(column)
        .map_err(|e| RagError::IndexCorruption(format!("documents.{}: {}", column, e)))
}

fn col_version(row: &SqliteRow) -> Result<u64> {
    let version: i64 = col(row, "content_version")?;
    u64::try_from(version).map_err(|_| {
        RagError::IndexCorruption(format!("documents.content_version is negative ({})", version))
    })
}

/// Version to assign to `body` when the caller did not pick one.
///
/// Unchanged text keeps the catalog version; changed text gets the next
/// one; unknown documents start at 1.
pub async fn next_version(pool: &SqlitePool, id: &str, body: &str) -> Result<u64> {
    let row = sqlx::query("SELECT content_version, body_hash FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(RagError::storage)?;

    Ok(match row {
        None => 1,
        Some(row) => {
            let version = col_version(&row)?;
            let stored_hash: String = col(&row, "body_hash")?;
            if stored_hash == hash_text(body) {
                version
            } else {
                version + 1
            }
        }
    })
}

pub async fn upsert(pool: &SqlitePool, doc: &Document) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO documents (id, content_version, title, organization, published_on,
                               body, body_hash, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            content_version = excluded.content_version,
            title = excluded.title,
            organization = excluded.organization,
            published_on = excluded.published_on,
            body = excluded.body,
            body_hash = excluded.body_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&doc.document_id)
    .bind(doc.content_version as i64)
    .bind(&doc.metadata.title)
    .bind(&doc.metadata.organization)
    .bind(
        doc.metadata
            .published_on
            .map(|d| d.format("%Y-%m-%d").to_string()),
    )
    .bind(&doc.text)
    .bind(hash_text(&doc.text))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(RagError::storage)?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<CatalogDocument>> {
    let row = sqlx::query(
        "SELECT id, content_version, title, organization, published_on, body, body_hash, \
         created_at, updated_at FROM documents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(RagError::storage)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let published_on: Option<String> = col(&row, "published_on")?;
    Ok(Some(CatalogDocument {
        id: col(&row, "id")?,
        content_version: col_version(&row)?,
        metadata: DocumentMetadata {
            title: col(&row, "title")?,
            organization: col(&row, "organization")?,
            published_on: published_on
                .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        },
        body: col(&row, "body")?,
        body_hash: col(&row, "body_hash")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    }))
}

/// IDs of every catalogued document, sorted.
pub async fn list_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(RagError::storage)
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(RagError::storage)?;
    Ok(result.rows_affected() > 0)
}
