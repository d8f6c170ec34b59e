//! `sts stats` and `sts vacuum`.
//!
//! Stats summarize what the index serves: published documents and, per
//! embedding model, its dimensionality, entry count, tombstones, and
//! whether it is retired.

use anyhow::Result;

use crate::catalog;
use crate::config::Config;
use crate::engine::Engine;
use crate::sqlite_index::last_published_at;

pub async fn run_stats(config: &Config, json: bool) -> Result<()> {
    let engine = Engine::open(config).await?;
    let stats = engine.stats().await?;
    let catalogued = catalog::list_ids(engine.pool()).await?.len();
    let last_publish = last_published_at(engine.pool()).await?;
    let active = engine.model_id().to_string();
    let next = engine.next_model_id().map(str::to_string);
    engine.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Standards Search — Index Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Metric:      {}", stats.metric.as_str());
    println!();
    println!("  Documents:   {} catalogued, {} published", catalogued, stats.published_documents);
    println!(
        "  Last publish: {}",
        last_publish
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string())
    );

    if !stats.models.is_empty() {
        println!();
        println!("  By model:");
        println!(
            "  {:<32} {:>6} {:>8} {:>10}   {}",
            "MODEL", "DIMS", "ENTRIES", "TOMBSTONED", "STATE"
        );
        println!("  {}", "-".repeat(76));
        for m in &stats.models {
            let state = if m.retired {
                "retired"
            } else if m.model_id == active {
                "active"
            } else if next.as_deref() == Some(m.model_id.as_str()) {
                "backfilling"
            } else {
                "standby"
            };
            println!(
                "  {:<32} {:>6} {:>8} {:>10}   {}",
                m.model_id, m.dims, m.entries, m.tombstoned, state
            );
        }
    }

    println!();
    Ok(())
}

pub async fn run_vacuum(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let purged = engine.vacuum().await?;
    sqlx::query("VACUUM").execute(engine.pool()).await?;
    engine.close().await;

    println!("vacuum");
    println!("  tombstoned entries purged: {}", purged);
    println!("ok");
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
