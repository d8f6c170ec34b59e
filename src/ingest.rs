//! `sts ingest` and `sts remove`.
//!
//! Each file becomes one document. The document ID defaults to the file
//! stem and the title to the first Markdown `# ` heading. Files are read up
//! front and ingested concurrently; one failing file does not stop the
//! others, but the command exits non-zero.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use standards_search_core::models::DocumentMetadata;

use crate::config::Config;
use crate::engine::{Engine, NewDocument};

/// Options shared by every file of one `sts ingest` invocation.
#[derive(Debug, Default)]
pub struct IngestArgs {
    pub id: Option<String>,
    pub version: Option<u64>,
    pub title: Option<String>,
    pub organization: Option<String>,
    pub published_on: Option<String>,
}

pub async fn run_ingest(config: &Config, files: &[PathBuf], args: IngestArgs) -> Result<()> {
    if files.is_empty() {
        bail!("no files given");
    }
    if files.len() > 1 && (args.id.is_some() || args.version.is_some() || args.title.is_some()) {
        bail!("--id, --version, and --title apply to a single file only");
    }
    let published_on = args
        .published_on
        .as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .context("--published-on must be YYYY-MM-DD")?;

    let mut docs = Vec::with_capacity(files.len());
    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let document_id = match &args.id {
            Some(id) => id.clone(),
            None => document_id_for(path)?,
        };
        let title = args.title.clone().or_else(|| first_heading(&text));
        docs.push(NewDocument {
            document_id,
            content_version: args.version,
            text,
            metadata: DocumentMetadata {
                title,
                organization: args.organization.clone(),
                published_on,
            },
        });
    }

    let engine = Engine::open(config).await?;
    let results = engine.ingest_many(docs).await;

    let mut published = 0usize;
    let mut failed = 0usize;
    let mut chunks = 0usize;
    let mut embeddings = 0usize;
    let mut superseded = 0usize;

    println!("ingest");
    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(report) => {
                println!(
                    "  {} v{}: {} chunks, {} superseded",
                    report.document_id,
                    report.content_version,
                    report.chunks_created,
                    report.chunks_superseded
                );
                published += 1;
                chunks += report.chunks_created;
                embeddings += report.embeddings_created;
                superseded += report.chunks_superseded;
            }
            Err(e) => {
                eprintln!("Error: {}: {}", path.display(), e);
                failed += 1;
            }
        }
    }
    println!("  documents published: {}", published);
    println!("  chunks written: {}", chunks);
    println!("  embeddings written: {}", embeddings);
    println!("  chunks superseded: {}", superseded);

    engine.close().await;

    if failed > 0 {
        bail!("{} of {} documents failed to ingest", failed, files.len());
    }
    println!("ok");
    Ok(())
}

pub async fn run_remove(config: &Config, id: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let report = engine.remove(id).await?;
    engine.close().await;

    println!("remove {}", report.document_id);
    println!("  chunks removed: {}", report.chunks_removed);
    println!("ok");
    Ok(())
}

fn document_id_for(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("cannot derive a document id from {}", path.display()))
}

fn first_heading(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_from_stem() {
        assert_eq!(
            document_id_for(Path::new("/docs/iso-27001.md")).unwrap(),
            "iso-27001"
        );
        assert_eq!(document_id_for(Path::new("NIST.SP.800-53.txt")).unwrap(), "NIST.SP.800-53");
    }

    #[test]
    fn test_first_heading() {
        assert_eq!(
            first_heading("\n# Information security controls\n\nBody").as_deref(),
            Some("Information security controls")
        );
        assert_eq!(first_heading("## Not a title\ntext"), None);
        assert_eq!(first_heading("plain text"), None);
    }
}
