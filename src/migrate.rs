//! Idempotent schema migrations.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `documents` | Catalog of ingested documents (latest text and metadata) |
//! | `index_entries` | One row per `(chunk_id, model_id)`: chunk fields, vector, checksum |
//! | `publications` | Visible content version per document |
//! | `embedding_models` | Dimensionality and retirement flag per model |
//! | `index_meta` | Index-lifetime settings such as the metric |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub const SCHEMA_VERSION: i64 = 1;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            content_version INTEGER NOT NULL,
            title TEXT,
            organization TEXT,
            published_on TEXT,
            body TEXT NOT NULL,
            body_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_models (
            model_id TEXT PRIMARY KEY,
            dims INTEGER NOT NULL,
            retired INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            chunk_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            content_version INTEGER NOT NULL,
            ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            byte_start INTEGER NOT NULL,
            byte_end INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            chunk_hash TEXT NOT NULL,
            title TEXT,
            organization TEXT,
            published_on TEXT,
            vector BLOB NOT NULL,
            checksum TEXT NOT NULL,
            created_at TEXT NOT NULL,
            tombstoned INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (chunk_id, model_id),
            FOREIGN KEY (model_id) REFERENCES embedding_models(model_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS publications (
            document_id TEXT PRIMARY KEY,
            content_version INTEGER NOT NULL,
            published_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_document ON index_entries(document_id, content_version)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entries_model ON index_entries(model_id, tombstoned, active)",
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO index_meta (key, value) VALUES ('schema_version', ?)")
        .bind(SCHEMA_VERSION.to_string())
        .execute(pool)
        .await?;

    Ok(())
}
