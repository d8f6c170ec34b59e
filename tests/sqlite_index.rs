//! Durability, integrity, and visibility tests for the SQLite index.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tempfile::TempDir;

use standards_search::config::Config;
use standards_search::db;
use standards_search::engine::{Engine, NewDocument};
use standards_search::migrate;
use standards_search::sqlite_index::SqliteIndex;
use standards_search_core::chunk::{chunk_id, hash_text};
use standards_search_core::index::{IndexEntry, Metric, SearchQuery, VectorIndex};
use standards_search_core::models::{Chunk, DocumentMetadata, EmbeddingRecord, SearchFilter};
use standards_search_core::RagError;

fn test_config(tmp: &TempDir) -> Config {
    let config_content = format!(
        r#"
[db]
path = "{}"

[chunking]
target_tokens = 8
overlap_tokens = 2

[retrieval]
min_score = 0.2

[embedding]
provider = "hashing"
dims = 256
"#,
        tmp.path().join("sts.sqlite").display()
    );
    toml::from_str(&config_content).unwrap()
}

async fn open_index(tmp: &TempDir, metric: Metric) -> Result<SqliteIndex, RagError> {
    let pool = db::connect_path(&tmp.path().join("index.sqlite")).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    SqliteIndex::open(pool, metric).await
}

async fn raw_pool(tmp: &TempDir) -> SqlitePool {
    db::connect_path(&tmp.path().join("index.sqlite")).await.unwrap()
}

fn entry(doc: &str, version: u64, ordinal: usize, model: &str, vector: Vec<f32>) -> IndexEntry {
    let id = chunk_id(doc, version, ordinal);
    let text = format!("{} v{} chunk {}", doc, version, ordinal);
    IndexEntry {
        record: EmbeddingRecord {
            chunk_id: id.clone(),
            vector,
            embedding_model_id: model.to_string(),
            created_at: Utc::now(),
        },
        chunk: Chunk {
            chunk_id: id,
            document_id: doc.to_string(),
            content_version: version,
            ordinal,
            hash: hash_text(&text),
            start_offset: ordinal * 4,
            end_offset: ordinal * 4 + 4,
            byte_start: 0,
            byte_end: text.len(),
            token_count: 4,
            text,
        },
        document: DocumentMetadata {
            title: Some(format!("Title {}", doc)),
            organization: Some("ISO".to_string()),
            published_on: None,
        },
    }
}

fn query<'a>(vector: &'a [f32], model: &'a str, k: usize) -> SearchQuery<'a> {
    SearchQuery {
        vector,
        model_id: model,
        k,
        filter: None,
    }
}

async fn publish_doc(index: &SqliteIndex, doc: &str, version: u64, chunks: usize) {
    let entries: Vec<IndexEntry> = (0..chunks)
        .map(|i| entry(doc, version, i, "m", vec![1.0, i as f32 * 0.1]))
        .collect();
    let live: Vec<String> = entries.iter().map(|e| e.chunk_id().to_string()).collect();
    index.upsert_many(entries).await.unwrap();
    index.publish(doc, version, &live).await.unwrap();
}

#[tokio::test]
async fn test_unpublished_entries_are_invisible() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp, Metric::Cosine).await.unwrap();

    index
        .upsert(entry("iso", 1, 0, "m", vec![1.0, 0.0]))
        .await
        .unwrap();
    assert!(index.search(&query(&[1.0, 0.0], "m", 5)).await.unwrap().is_empty());

    index
        .publish("iso", 1, &[chunk_id("iso", 1, 0)])
        .await
        .unwrap();
    let hits = index.search(&query(&[1.0, 0.0], "m", 5)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert_eq!(hits[0].document.title.as_deref(), Some("Title iso"));
}

#[tokio::test]
async fn test_publish_supersedes_previous_version() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp, Metric::Cosine).await.unwrap();

    publish_doc(&index, "iso", 1, 3).await;

    // v2 lands but is not visible until published.
    let v2 = vec![entry("iso", 2, 0, "m", vec![0.0, 1.0])];
    index.upsert_many(v2).await.unwrap();
    let hits = index.search(&query(&[1.0, 0.0], "m", 10)).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.chunk.content_version == 1));

    let superseded = index
        .publish("iso", 2, &[chunk_id("iso", 2, 0)])
        .await
        .unwrap();
    assert_eq!(superseded, 3);
    let hits = index.search(&query(&[1.0, 0.0], "m", 10)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.content_version, 2);

    let err = index.publish("iso", 1, &[]).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidInput(_)));
}

#[tokio::test]
async fn test_ties_break_by_chunk_id() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp, Metric::Cosine).await.unwrap();

    for doc in ["c", "a", "b"] {
        index.upsert(entry(doc, 1, 0, "m", vec![1.0, 1.0])).await.unwrap();
        index.publish(doc, 1, &[chunk_id(doc, 1, 0)]).await.unwrap();
    }

    let hits = index.search(&query(&[1.0, 1.0], "m", 3)).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let top2 = index.search(&query(&[1.0, 1.0], "m", 2)).await.unwrap();
    assert_eq!(top2.len(), 2);
    assert_eq!(top2[0].chunk_id(), ids[0]);
}

#[tokio::test]
async fn test_filter_and_dimension_checks() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp, Metric::Cosine).await.unwrap();
    publish_doc(&index, "iso", 1, 2).await;
    publish_doc(&index, "iec", 1, 2).await;

    let filter = SearchFilter {
        document_ids: Some(vec!["iec".to_string()]),
        organization: None,
    };
    let q = SearchQuery {
        vector: &[1.0, 0.0],
        model_id: "m",
        k: 10,
        filter: Some(&filter),
    };
    let hits = index.search(&q).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.chunk.document_id == "iec"));

    let err = index.search(&query(&[1.0, 0.0, 0.0], "m", 5)).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidInput(_)));

    let err = index
        .upsert(entry("iso", 1, 9, "m", vec![1.0, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::InvalidInput(_)));

    // Unknown model: nothing to search, not an error.
    assert!(index.search(&query(&[1.0], "other", 5)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_by_document_and_purge() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp, Metric::Cosine).await.unwrap();
    publish_doc(&index, "iso", 1, 3).await;

    assert_eq!(index.delete_by_document("iso").await.unwrap(), 3);
    assert_eq!(index.published_version("iso").await.unwrap(), None);
    assert!(index.search(&query(&[1.0, 0.0], "m", 5)).await.unwrap().is_empty());
    assert_eq!(index.delete_by_document("iso").await.unwrap(), 0);

    let stats = index.stats().await.unwrap();
    assert_eq!(stats.models[0].tombstoned, 3);
    assert_eq!(index.purge_tombstones().await.unwrap(), 3);
    assert_eq!(index.stats().await.unwrap().models[0].entries, 0);
}

#[tokio::test]
async fn test_retired_model() {
    let tmp = TempDir::new().unwrap();
    let index = open_index(&tmp, Metric::Cosine).await.unwrap();
    publish_doc(&index, "iso", 1, 2).await;

    assert_eq!(index.retire_model("m").await.unwrap(), 2);
    assert!(index.search(&query(&[1.0, 0.0], "m", 5)).await.unwrap().is_empty());
    let err = index
        .upsert(entry("iso", 1, 0, "m", vec![1.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::InvalidInput(_)));
    assert!(matches!(
        index.retire_model("unknown").await.unwrap_err(),
        RagError::InvalidInput(_)
    ));
}

#[tokio::test]
async fn test_published_document_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let index = open_index(&tmp, Metric::Cosine).await.unwrap();
        publish_doc(&index, "iso", 4, 3).await;
        index.pool().close().await;
    }

    let index = open_index(&tmp, Metric::Cosine).await.unwrap();
    let doc = index.published_document("iso").await.unwrap().unwrap();
    assert_eq!(doc.content_version, 4);
    let ordinals: Vec<usize> = doc.chunks.iter().map(|c| c.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    assert_eq!(doc.metadata.organization.as_deref(), Some("ISO"));
    assert_eq!(index.search(&query(&[1.0, 0.0], "m", 10)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_checksum_mismatch_is_corruption() {
    let tmp = TempDir::new().unwrap();
    {
        let index = open_index(&tmp, Metric::Cosine).await.unwrap();
        publish_doc(&index, "iso", 1, 2).await;
        index.pool().close().await;
    }

    let pool = raw_pool(&tmp).await;
    sqlx::query("UPDATE index_entries SET checksum = 'x' WHERE ordinal = 1")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let err = open_index(&tmp, Metric::Cosine).await.err().unwrap();
    assert!(matches!(err, RagError::IndexCorruption(_)), "{:?}", err);
}

#[tokio::test]
async fn test_truncated_vector_is_corruption() {
    let tmp = TempDir::new().unwrap();
    {
        let index = open_index(&tmp, Metric::Cosine).await.unwrap();
        publish_doc(&index, "iso", 1, 1).await;
        index.pool().close().await;
    }

    let pool = raw_pool(&tmp).await;
    sqlx::query("UPDATE index_entries SET vector = X'0000'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let err = open_index(&tmp, Metric::Cosine).await.err().unwrap();
    assert!(matches!(err, RagError::IndexCorruption(_)), "{:?}", err);
}

#[tokio::test]
async fn test_metric_is_fixed_for_index_lifetime() {
    let tmp = TempDir::new().unwrap();
    {
        let index = open_index(&tmp, Metric::Cosine).await.unwrap();
        index.pool().close().await;
    }

    let err = open_index(&tmp, Metric::Dot).await.err().unwrap();
    assert!(matches!(err, RagError::InvalidInput(_)), "{:?}", err);

    let pool = raw_pool(&tmp).await;
    sqlx::query("UPDATE index_meta SET value = 'euclid' WHERE key = 'metric'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
    let err = open_index(&tmp, Metric::Cosine).await.err().unwrap();
    assert!(matches!(err, RagError::IndexCorruption(_)), "{:?}", err);
}

/// Searches racing a publish see either the old version or the new one,
/// never a mix.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_search_sees_whole_versions() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(open_index(&tmp, Metric::Cosine).await.unwrap());
    publish_doc(&index, "iso", 1, 4).await;

    let v2: Vec<IndexEntry> = (0..4)
        .map(|i| entry("iso", 2, i, "m", vec![1.0, i as f32 * 0.1]))
        .collect();
    let live: Vec<String> = v2.iter().map(|e| e.chunk_id().to_string()).collect();
    index.upsert_many(v2).await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..8 {
        let index = index.clone();
        readers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..10 {
                let hits = index.search(&query(&[1.0, 0.0], "m", 10)).await.unwrap();
                assert_eq!(hits.len(), 4);
                let version = hits[0].chunk.content_version;
                assert!(hits.iter().all(|h| h.chunk.content_version == version));
                seen.push(version);
            }
            seen
        }));
    }

    index.publish("iso", 2, &live).await.unwrap();

    for reader in readers {
        let seen = reader.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "version went backwards: {:?}", seen);
    }
    let hits = index.search(&query(&[1.0, 0.0], "m", 10)).await.unwrap();
    assert!(hits.iter().all(|h| h.chunk.content_version == 2));
}

#[tokio::test]
async fn test_engine_results_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);

    let (before, chunks_created) = {
        let engine = Engine::open(&cfg).await.unwrap();
        let report = engine
            .ingest(NewDocument {
                document_id: "iso-27001".to_string(),
                content_version: None,
                text: "Access control policy. Privileged access rights are reviewed quarterly. \
                       Backup copies are tested regularly."
                    .to_string(),
                metadata: DocumentMetadata::default(),
            })
            .await
            .unwrap();
        assert_eq!(report.content_version, 1);
        assert!(report.chunks_created > 1);

        let result = engine
            .search("privileged access rights reviewed", None, None, None)
            .await
            .unwrap();
        engine.close().await;
        (result, report.chunks_created)
    };
    assert!(!before.is_empty());

    let engine = Engine::open(&cfg).await.unwrap();
    let after = engine
        .search("privileged access rights reviewed", None, None, None)
        .await
        .unwrap();
    assert_eq!(before, after);

    let doc = engine.get("iso-27001").await.unwrap().unwrap();
    assert_eq!(doc.published_version, Some(1));
    assert_eq!(doc.chunks.len(), chunks_created);
    engine.close().await;
}

#[tokio::test]
async fn test_engine_explicit_versions() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(&test_config(&tmp)).await.unwrap();

    let doc = |version: u64, text: &str| NewDocument {
        document_id: "nist".to_string(),
        content_version: Some(version),
        text: text.to_string(),
        metadata: DocumentMetadata::default(),
    };

    engine.ingest(doc(5, "incident response plan")).await.unwrap();
    let report = engine.ingest(doc(6, "incident response playbook")).await.unwrap();
    assert_eq!(report.chunks_superseded, 1);

    let err = engine.ingest(doc(5, "old text")).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidInput(_)));

    // A failed stale ingest leaves the catalog untouched.
    let current = engine.get("nist").await.unwrap().unwrap();
    assert_eq!(current.content_version, 6);
    assert_eq!(current.body, "incident response playbook");
    engine.close().await;
}

#[tokio::test]
async fn test_wrong_typed_column_is_corruption() {
    let tmp = TempDir::new().unwrap();
    {
        let index = open_index(&tmp, Metric::Cosine).await.unwrap();
        publish_doc(&index, "iso", 1, 1).await;
        index.pool().close().await;
    }

    let pool = raw_pool(&tmp).await;
    sqlx::query("UPDATE index_entries SET vector = 42")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let err = open_index(&tmp, Metric::Cosine).await.err().unwrap();
    assert!(matches!(err, RagError::IndexCorruption(_)), "{:?}", err);
}

#[tokio::test]
async fn test_wrong_typed_catalog_row_is_corruption() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(&test_config(&tmp)).await.unwrap();
    engine
        .ingest(NewDocument {
            document_id: "nist".to_string(),
            content_version: None,
            text: "incident response plan".to_string(),
            metadata: DocumentMetadata::default(),
        })
        .await
        .unwrap();

    sqlx::query("UPDATE documents SET content_version = 'seven'")
        .execute(engine.pool())
        .await
        .unwrap();
    let err = engine.get("nist").await.unwrap_err();
    assert!(matches!(err, RagError::IndexCorruption(_)), "{:?}", err);
    engine.close().await;
}

/// Writers on separate documents share one database file; none of them
/// may fail because another holds the write lock.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_writers_on_distinct_documents() {
    let tmp = TempDir::new().unwrap();
    let index = Arc::new(open_index(&tmp, Metric::Cosine).await.unwrap());

    let mut writers = Vec::new();
    for n in 0..16 {
        let index = index.clone();
        writers.push(tokio::spawn(async move {
            let doc = format!("doc-{:02}", n);
            for version in 1..=2 {
                let entries: Vec<IndexEntry> = (0..3)
                    .map(|i| entry(&doc, version, i, "m", vec![1.0, i as f32 * 0.1]))
                    .collect();
                let live: Vec<String> = entries.iter().map(|e| e.chunk_id().to_string()).collect();
                index.upsert_many(entries).await?;
                index.publish(&doc, version, &live).await?;
            }
            index.delete_by_document(&doc).await?;
            let entries = vec![entry(&doc, 3, 0, "m", vec![1.0, 0.0])];
            let live = vec![entries[0].chunk_id().to_string()];
            index.upsert_many(entries).await?;
            index.publish(&doc, 3, &live).await
        }));
    }
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let hits = index.search(&query(&[1.0, 0.0], "m", 100)).await.unwrap();
    assert_eq!(hits.len(), 16);
    assert!(hits.iter().all(|h| h.chunk.content_version == 3));
}

fn doc_text(n: usize) -> String {
    format!(
        "Clause {} requires documented controls. Records are retained for {} years.",
        n,
        n + 1
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_ingests_many_documents_in_parallel() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.ingest.max_parallel_documents = 8;
    let engine = Engine::open(&cfg).await.unwrap();

    let docs: Vec<NewDocument> = (0..40)
        .map(|n| NewDocument {
            document_id: format!("std-{:02}", n),
            content_version: None,
            text: doc_text(n),
            metadata: DocumentMetadata::default(),
        })
        .collect();
    let results = engine.ingest_many(docs).await;
    assert_eq!(results.len(), 40);
    for (n, result) in results.into_iter().enumerate() {
        let report = result.unwrap_or_else(|e| panic!("std-{:02}: {}", n, e));
        assert_eq!(report.content_version, 1);
    }

    for n in [0, 17, 39] {
        let doc = engine.get(&format!("std-{:02}", n)).await.unwrap().unwrap();
        assert_eq!(doc.published_version, Some(1));
        assert_eq!(doc.body, doc_text(n));
    }
    engine.close().await;
}

/// Concurrent edits of one document each get their own version and the
/// catalog ends on the last one published.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_serialises_edits_to_one_document() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(Engine::open(&test_config(&tmp)).await.unwrap());

    let mut tasks = Vec::new();
    for n in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let report = engine
                .ingest(NewDocument {
                    document_id: "iso-9001".to_string(),
                    content_version: None,
                    text: doc_text(n),
                    metadata: DocumentMetadata::default(),
                })
                .await?;
            Ok::<_, RagError>((report.content_version, doc_text(n)))
        }));
    }

    let mut versions = Vec::new();
    let mut last_text = String::new();
    for task in tasks {
        let (version, text) = task.await.unwrap().unwrap();
        if version == 8 {
            last_text = text;
        }
        versions.push(version);
    }
    versions.sort();
    assert_eq!(versions, (1..=8).collect::<Vec<u64>>());

    let doc = engine.get("iso-9001").await.unwrap().unwrap();
    assert_eq!(doc.content_version, 8);
    assert_eq!(doc.published_version, Some(8));
    assert_eq!(doc.body, last_text);
    assert!(doc.chunks.iter().all(|c| c.content_version == 8));
}

#[tokio::test]
async fn test_engine_rejects_new_text_under_published_version() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(&test_config(&tmp)).await.unwrap();

    let doc = |text: &str| NewDocument {
        document_id: "iec-61508".to_string(),
        content_version: Some(1),
        text: text.to_string(),
        metadata: DocumentMetadata::default(),
    };

    engine.ingest(doc("alpha original text here")).await.unwrap();
    engine.ingest(doc("alpha original text here")).await.unwrap();
    let err = engine.ingest(doc("alpha completely different body")).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidInput(_)), "{:?}", err);

    let current = engine.get("iec-61508").await.unwrap().unwrap();
    assert_eq!(current.body, "alpha original text here");
    assert!(current.chunks.iter().all(|c| c.text.starts_with("alpha original")));
    engine.close().await;
}
