//! `sts get`: print a catalogued document and its published chunks.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::engine::Engine;

pub async fn run_get(config: &Config, id: &str, json: bool) -> Result<()> {
    let engine = Engine::open(config).await?;
    let doc = engine.get(id).await?;
    engine.close().await;

    let Some(doc) = doc else {
        bail!("document not found: {}", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("--- Document ---");
    println!("id:           {}", doc.document_id);
    println!(
        "title:        {}",
        doc.metadata.title.as_deref().unwrap_or("(untitled)")
    );
    if let Some(org) = &doc.metadata.organization {
        println!("organization: {}", org);
    }
    if let Some(date) = doc.metadata.published_on {
        println!("published_on: {}", date);
    }
    println!("version:      {}", doc.content_version);
    println!(
        "published:    {}",
        doc.published_version
            .map(|v| format!("v{}", v))
            .unwrap_or_else(|| "no".to_string())
    );
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!(
            "[chunk {}] tokens {}..{} id={}",
            chunk.ordinal, chunk.start_offset, chunk.end_offset, chunk.chunk_id
        );
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}
