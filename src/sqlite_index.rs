//! SQLite-backed [`VectorIndex`].
//!
//! Vectors are stored as little-endian `f32` BLOBs next to a SHA-256
//! checksum of the BLOB and a copy of the chunk and document metadata, so a
//! search never needs a join beyond `publications`. Search is a brute-force
//! scan of the query model's live rows inside a single `SELECT`, which
//! SQLite's WAL mode executes against one consistent snapshot.
//!
//! # Integrity
//!
//! [`SqliteIndex::open`] refuses to hand out an index unless:
//!
//! - `PRAGMA integrity_check` reports `ok`
//! - the stored metric parses and matches the configured one
//! - every entry's model is registered, its BLOB is `dims × 4` bytes, and
//!   its checksum matches
//!
//! Any violation is [`RagError::IndexCorruption`].
//!
//! # Writes
//!
//! Write transactions read before they write (model registration, stale
//! version checks). Under WAL a deferred transaction that tries to upgrade
//! after another connection committed fails with `SQLITE_BUSY` regardless of
//! the busy timeout, so writers in this process take `write_lock` first.
//! Readers never wait on it.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, Row, Sqlite, SqliteConnection, SqlitePool, Type};
use tokio::sync::Mutex;

use standards_search_core::embedding::{blob_to_vec, vec_to_blob};
use standards_search_core::index::{
    rank_hits, validate_entry, validate_query, IndexEntry, IndexStats, Metric, ModelStats,
    PublishedDocument, SearchHit, SearchQuery, VectorIndex,
};
use standards_search_core::models::{Chunk, DocumentMetadata};
use standards_search_core::{RagError, Result};

const ENTRY_COLUMNS: &str = "e.chunk_id, e.document_id, e.content_version, e.ordinal, e.text, \
    e.start_offset, e.end_offset, e.byte_start, e.byte_end, e.token_count, e.chunk_hash, \
    e.title, e.organization, e.published_on";

pub struct SqliteIndex {
    pool: SqlitePool,
    metric: Metric,
    write_lock: Mutex<()>,
}

/// Hex SHA-256 of a vector BLOB.
pub fn checksum(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    format!("{:x}", hasher.finalize())
}

fn corrupt(message: impl Into<String>) -> RagError {
    RagError::IndexCorruption(message.into())
}

/// Decode a column; a value of the wrong type is corruption, not a panic.
fn col<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(column)
        .map_err(|e| corrupt(format!("column '{}': {}", column, e)))
}

fn col_flag(row: &SqliteRow, column: &str) -> Result<bool> {
    Ok(col::<i64>(row, column)? != 0)
}

fn col_usize(row: &SqliteRow, column: &str) -> Result<usize> {
    let value: i64 = col(row, column)?;
    usize::try_from(value).map_err(|_| corrupt(format!("negative {} ({})", column, value)))
}

fn col_u64(row: &SqliteRow, column: &str) -> Result<u64> {
    let value: i64 = col(row, column)?;
    u64::try_from(value).map_err(|_| corrupt(format!("negative {} ({})", column, value)))
}

fn chunk_from_row(row: &SqliteRow) -> Result<(Chunk, DocumentMetadata)> {
    let published_on: Option<String> = col(row, "published_on")?;
    let published_on = published_on
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| corrupt(format!("bad published_on '{}': {}", s, e)))
        })
        .transpose()?;

    let chunk = Chunk {
        chunk_id: col(row, "chunk_id")?,
        document_id: col(row, "document_id")?,
        content_version: col_u64(row, "content_version")?,
        ordinal: col_usize(row, "ordinal")?,
        text: col(row, "text")?,
        start_offset: col_usize(row, "start_offset")?,
        end_offset: col_usize(row, "end_offset")?,
        byte_start: col_usize(row, "byte_start")?,
        byte_end: col_usize(row, "byte_end")?,
        token_count: col_usize(row, "token_count")?,
        hash: col(row, "chunk_hash")?,
    };
    let metadata = DocumentMetadata {
        title: col(row, "title")?,
        organization: col(row, "organization")?,
        published_on,
    };
    Ok((chunk, metadata))
}

impl SqliteIndex {
    /// Open the index stored in `pool`, verifying it first.
    ///
    /// The schema must already exist (see [`crate::migrate`]). The first
    /// open records `metric`; later opens with a different metric fail
    /// with [`RagError::InvalidInput`].
    pub async fn open(pool: SqlitePool, metric: Metric) -> Result<Self> {
        let index = Self {
            pool,
            metric,
            write_lock: Mutex::new(()),
        };
        index.check_integrity().await?;
        index.check_metric().await?;
        let verified = index.verify_vectors().await?;
        tracing::debug!(entries = verified, metric = metric.as_str(), "index verified");
        Ok(index)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn check_integrity(&self) -> Result<()> {
        let rows: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(&self.pool)
            .await
            .map_err(RagError::storage)?;
        if rows.len() == 1 && rows[0] == "ok" {
            return Ok(());
        }
        Err(corrupt(format!("integrity_check: {}", rows.join("; "))))
    }

    async fn check_metric(&self) -> Result<()> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'metric'")
                .fetch_optional(&self.pool)
                .await
                .map_err(RagError::storage)?;

        match stored {
            None => {
                sqlx::query("INSERT INTO index_meta (key, value) VALUES ('metric', ?)")
                    .bind(self.metric.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(RagError::storage)?;
                Ok(())
            }
            Some(value) => {
                let stored: Metric = value
                    .parse()
                    .map_err(|_| corrupt(format!("unknown stored metric '{}'", value)))?;
                if stored != self.metric {
                    return Err(RagError::invalid(format!(
                        "index was created with metric '{}', configured metric is '{}'",
                        stored.as_str(),
                        self.metric.as_str()
                    )));
                }
                Ok(())
            }
        }
    }

    /// Check length and checksum of every stored vector.
    async fn verify_vectors(&self) -> Result<usize> {
        let mut rows = sqlx::query(
            r#"
            SELECT e.chunk_id, e.model_id, e.vector, e.checksum, m.dims
            FROM index_entries e
            LEFT JOIN embedding_models m ON m.model_id = e.model_id
            "#,
        )
        .fetch(&self.pool);

        let mut count = 0;
        while let Some(row) = rows.try_next().await.map_err(RagError::storage)? {
            let chunk_id: String = col(&row, "chunk_id")?;
            let model_id: String = col(&row, "model_id")?;
            let dims: Option<i64> = col(&row, "dims")?;
            let Some(dims) = dims else {
                return Err(corrupt(format!(
                    "entry '{}' references unregistered model '{}'",
                    chunk_id, model_id
                )));
            };
            let blob: Vec<u8> = col(&row, "vector")?;
            if blob.len() as i64 != dims * 4 {
                return Err(corrupt(format!(
                    "entry '{}' ({}) has {} vector bytes, expected {}",
                    chunk_id,
                    model_id,
                    blob.len(),
                    dims * 4
                )));
            }
            let stored: String = col(&row, "checksum")?;
            if checksum(&blob) != stored {
                return Err(corrupt(format!(
                    "checksum mismatch for entry '{}' ({})",
                    chunk_id, model_id
                )));
            }
            count += 1;
        }
        Ok(count)
    }

    async fn model_state(&self, model_id: &str) -> Result<Option<(usize, bool)>> {
        let row = sqlx::query("SELECT dims, retired FROM embedding_models WHERE model_id = ?")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(RagError::storage)?;
        row.map(|r| Ok((col_usize(&r, "dims")?, col_flag(&r, "retired")?)))
            .transpose()
    }
}

async fn upsert_on(conn: &mut SqliteConnection, entry: &IndexEntry) -> Result<()> {
    let model_id = entry.model_id();
    let state = sqlx::query("SELECT dims, retired FROM embedding_models WHERE model_id = ?")
        .bind(model_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(RagError::storage)?;

    match state {
        Some(row) => {
            if col_flag(&row, "retired")? {
                return Err(RagError::invalid(format!(
                    "embedding model '{}' is retired",
                    model_id
                )));
            }
            validate_entry(entry, Some(col_usize(&row, "dims")?))?;
        }
        None => {
            validate_entry(entry, None)?;
            sqlx::query(
                "INSERT INTO embedding_models (model_id, dims, retired, created_at) VALUES (?, ?, 0, ?)",
            )
            .bind(model_id)
            .bind(entry.record.vector.len() as i64)
            .bind(Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(RagError::storage)?;
        }
    }

    let chunk = &entry.chunk;
    let doc = &entry.document;
    let blob = vec_to_blob(&entry.record.vector);
    let sum = checksum(&blob);

    sqlx::query(
        r#"
        INSERT INTO index_entries (chunk_id, model_id, document_id, content_version, ordinal,
                                   text, start_offset, end_offset, byte_start, byte_end,
                                   token_count, chunk_hash, title, organization, published_on,
                                   vector, checksum, created_at, tombstoned, active)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 1)
        ON CONFLICT(chunk_id, model_id) DO UPDATE SET
            document_id = excluded.document_id,
            content_version = excluded.content_version,
            ordinal = excluded.ordinal,
            text = excluded.text,
            start_offset = excluded.start_offset,
            end_offset = excluded.end_offset,
            byte_start = excluded.byte_start,
            byte_end = excluded.byte_end,
            token_count = excluded.token_count,
            chunk_hash = excluded.chunk_hash,
            title = excluded.title,
            organization = excluded.organization,
            published_on = excluded.published_on,
            vector = excluded.vector,
            checksum = excluded.checksum,
            created_at = excluded.created_at,
            tombstoned = 0,
            active = 1
        "#,
    )
    .bind(&chunk.chunk_id)
    .bind(model_id)
    .bind(&chunk.document_id)
    .bind(chunk.content_version as i64)
    .bind(chunk.ordinal as i64)
    .bind(&chunk.text)
    .bind(chunk.start_offset as i64)
    .bind(chunk.end_offset as i64)
    .bind(chunk.byte_start as i64)
    .bind(chunk.byte_end as i64)
    .bind(chunk.token_count as i64)
    .bind(&chunk.hash)
    .bind(&doc.title)
    .bind(&doc.organization)
    .bind(doc.published_on.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(blob)
    .bind(sum)
    .bind(entry.record.created_at.to_rfc3339())
    .execute(&mut *conn)
    .await
    .map_err(RagError::storage)?;

    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn metric(&self) -> Metric {
        self.metric
    }

    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        self.upsert_many(vec![entry]).await
    }

    async fn upsert_many(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(RagError::storage)?;
        for entry in &entries {
            upsert_on(&mut tx, entry).await?;
        }
        tx.commit().await.map_err(RagError::storage)?;
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let _writer = self.write_lock.lock().await;
        let result =
            sqlx::query("UPDATE index_entries SET tombstoned = 1 WHERE chunk_id = ? AND tombstoned = 0")
                .bind(chunk_id)
                .execute(&self.pool)
                .await
                .map_err(RagError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(RagError::storage)?;

        let chunks: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT chunk_id) FROM index_entries WHERE document_id = ? AND tombstoned = 0",
        )
        .bind(document_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(RagError::storage)?;

        sqlx::query("UPDATE index_entries SET tombstoned = 1 WHERE document_id = ? AND tombstoned = 0")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

        sqlx::query("DELETE FROM publications WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;

        tx.commit().await.map_err(RagError::storage)?;
        Ok(chunks as usize)
    }

    async fn publish(
        &self,
        document_id: &str,
        content_version: u64,
        live_chunk_ids: &[String],
    ) -> Result<usize> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(RagError::storage)?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT content_version FROM publications WHERE document_id = ?")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(RagError::storage)?;
        if let Some(current) = current {
            if (content_version as i64) < current {
                return Err(RagError::invalid(format!(
                    "document '{}' is already published at version {}, refusing version {}",
                    document_id, current, content_version
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO publications (document_id, content_version, published_at)
            VALUES (?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                content_version = excluded.content_version,
                published_at = excluded.published_at
            "#,
        )
        .bind(document_id)
        .bind(content_version as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(RagError::storage)?;

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT chunk_id FROM index_entries WHERE document_id = ? AND tombstoned = 0",
        )
        .bind(document_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(RagError::storage)?;

        let live: HashSet<&str> = live_chunk_ids.iter().map(String::as_str).collect();
        let mut superseded = 0;
        for chunk_id in existing.iter().filter(|id| !live.contains(id.as_str())) {
            sqlx::query("UPDATE index_entries SET tombstoned = 1 WHERE chunk_id = ? AND document_id = ?")
                .bind(chunk_id)
                .bind(document_id)
                .execute(&mut *tx)
                .await
                .map_err(RagError::storage)?;
            superseded += 1;
        }

        tx.commit().await.map_err(RagError::storage)?;
        Ok(superseded)
    }

    async fn published_version(&self, document_id: &str) -> Result<Option<u64>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT content_version FROM publications WHERE document_id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(RagError::storage)?;
        Ok(version.map(|v| v as u64))
    }

    async fn published_document(&self, document_id: &str) -> Result<Option<PublishedDocument>> {
        let mut tx = self.pool.begin().await.map_err(RagError::storage)?;

        let version: Option<i64> =
            sqlx::query_scalar("SELECT content_version FROM publications WHERE document_id = ?")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(RagError::storage)?;
        let Some(version) = version else {
            return Ok(None);
        };

        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM index_entries e
            WHERE e.document_id = ? AND e.content_version = ? AND e.tombstoned = 0
            ORDER BY e.ordinal, e.model_id
            "#,
            ENTRY_COLUMNS
        ))
        .bind(document_id)
        .bind(version)
        .fetch_all(&mut *tx)
        .await
        .map_err(RagError::storage)?;
        tx.commit().await.map_err(RagError::storage)?;

        let mut metadata = DocumentMetadata::default();
        let mut by_ordinal: BTreeMap<usize, Chunk> = BTreeMap::new();
        for row in &rows {
            let (chunk, meta) = chunk_from_row(row)?;
            metadata = meta;
            by_ordinal.entry(chunk.ordinal).or_insert(chunk);
        }

        Ok(Some(PublishedDocument {
            document_id: document_id.to_string(),
            content_version: version as u64,
            metadata,
            chunks: by_ordinal.into_values().collect(),
        }))
    }

    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SearchHit>> {
        if query.k == 0 {
            return Ok(Vec::new());
        }
        let Some((dims, retired)) = self.model_state(query.model_id).await? else {
            return Ok(Vec::new());
        };
        validate_query(query, Some(dims))?;
        if retired {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT {}, e.vector
            FROM index_entries e
            JOIN publications p
              ON p.document_id = e.document_id AND p.content_version = e.content_version
            WHERE e.model_id = ? AND e.tombstoned = 0 AND e.active = 1
            "#,
            ENTRY_COLUMNS
        );
        let mut rows = sqlx::query(&sql).bind(query.model_id).fetch(&self.pool);

        let mut hits = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(RagError::storage)? {
            let (chunk, document) = chunk_from_row(&row)?;
            if let Some(filter) = query.filter {
                if !filter.matches(&chunk.document_id, &document) {
                    continue;
                }
            }
            let blob: Vec<u8> = col(&row, "vector")?;
            if blob.len() != dims * 4 {
                return Err(corrupt(format!(
                    "entry '{}' has {} vector bytes, expected {}",
                    chunk.chunk_id,
                    blob.len(),
                    dims * 4
                )));
            }
            let vector = blob_to_vec(&blob);
            hits.push(SearchHit {
                score: self.metric.score(query.vector, &vector),
                chunk,
                document,
            });
        }

        Ok(rank_hits(hits, query.k))
    }

    async fn retire_model(&self, model_id: &str) -> Result<usize> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(RagError::storage)?;
        let updated = sqlx::query("UPDATE embedding_models SET retired = 1 WHERE model_id = ?")
            .bind(model_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;
        if updated.rows_affected() == 0 {
            return Err(RagError::invalid(format!(
                "unknown embedding model '{}'",
                model_id
            )));
        }
        let entries = sqlx::query("UPDATE index_entries SET active = 0 WHERE model_id = ?")
            .bind(model_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;
        tx.commit().await.map_err(RagError::storage)?;
        Ok(entries.rows_affected() as usize)
    }

    async fn purge_tombstones(&self) -> Result<usize> {
        let _writer = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM index_entries WHERE tombstoned = 1")
            .execute(&self.pool)
            .await
            .map_err(RagError::storage)?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let published: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM publications")
            .fetch_one(&self.pool)
            .await
            .map_err(RagError::storage)?;

        let rows = sqlx::query(
            r#"
            SELECT m.model_id, m.dims, m.retired,
                   COUNT(e.chunk_id) AS entries,
                   COALESCE(SUM(e.tombstoned), 0) AS tombstoned
            FROM embedding_models m
            LEFT JOIN index_entries e ON e.model_id = m.model_id
            GROUP BY m.model_id
            ORDER BY m.model_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::storage)?;

        let models = rows
            .iter()
            .map(|row| {
                Ok(ModelStats {
                    model_id: col(row, "model_id")?,
                    dims: col_usize(row, "dims")?,
                    retired: col_flag(row, "retired")?,
                    entries: col_usize(row, "entries")?,
                    tombstoned: col_usize(row, "tombstoned")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(IndexStats {
            metric: self.metric,
            published_documents: published as usize,
            models,
        })
    }
}

/// Timestamp of the most recent publication, for reporting.
pub async fn last_published_at(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<i64> = sqlx::query_scalar("SELECT MAX(published_at) FROM publications")
        .fetch_one(pool)
        .await
        .map_err(RagError::storage)?;
    Ok(ts.and_then(|t| DateTime::from_timestamp(t, 0)))
}
