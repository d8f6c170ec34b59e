//! `sts embed`: embedding-model migration.
//!
//! A migration runs in three steps:
//!
//! 1. Add the new model as `[embedding_next]` and run `sts embed backfill`.
//!    Queries keep using `[embedding]` while the new generation fills in.
//! 2. Swap the sections so the new model is `[embedding]`.
//! 3. Run `sts embed retire <old-model>` to stop serving the old one and
//!    `sts vacuum` to reclaim space.

use anyhow::Result;

use crate::config::Config;
use crate::engine::Engine;

pub async fn run_backfill(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let report = engine.backfill().await;
    engine.close().await;
    let report = report?;

    println!("embed backfill {}", report.model_id);
    println!("  documents: {}", report.documents);
    println!("  embeddings written: {}", report.embeddings);
    println!("ok");
    Ok(())
}

pub async fn run_retire(config: &Config, model_id: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let entries = engine.retire(model_id).await;
    engine.close().await;
    let entries = entries?;

    println!("embed retire {}", model_id);
    println!("  entries deactivated: {}", entries);
    println!("ok");
    Ok(())
}
