//! `sts search` and `sts ask`.
//!
//! Both print a human-readable summary by default; `--json` prints the
//! [`RetrievalResult`] (or [`Answer`](standards_search_core::generation::Answer))
//! exactly as the HTTP API returns it.

use anyhow::Result;

use standards_search_core::models::{RetrievalResult, SearchFilter};

use crate::config::Config;
use crate::engine::Engine;

/// Query options shared by `search` and `ask`.
#[derive(Debug, Default)]
pub struct QueryArgs {
    pub k: Option<usize>,
    pub max_tokens: Option<usize>,
    pub documents: Vec<String>,
    pub organization: Option<String>,
    pub json: bool,
}

impl QueryArgs {
    pub fn filter(&self) -> Option<SearchFilter> {
        if self.documents.is_empty() && self.organization.is_none() {
            return None;
        }
        Some(SearchFilter {
            document_ids: (!self.documents.is_empty()).then(|| self.documents.clone()),
            organization: self.organization.clone(),
        })
    }
}

pub async fn run_search(config: &Config, query: &str, args: QueryArgs) -> Result<()> {
    let engine = Engine::open(config).await?;
    let filter = args.filter();
    let result = engine
        .search(query, args.k, args.max_tokens, filter.as_ref())
        .await?;
    engine.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    print_retrieval(&result);
    Ok(())
}

pub async fn run_ask(config: &Config, question: &str, args: QueryArgs) -> Result<()> {
    let engine = Engine::open(config).await?;
    let filter = args.filter();
    let answer = engine
        .ask(question, args.k, args.max_tokens, filter.as_ref())
        .await?;
    engine.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    match &answer.answer {
        Some(text) => {
            println!("{}", text.trim());
            println!();
        }
        None => {
            println!("No relevant passages found.");
            return Ok(());
        }
    }
    println!("Sources:");
    for citation in &answer.retrieval.citations {
        let marker = if answer.used_citations.contains(&citation.label) {
            "*"
        } else {
            " "
        };
        println!(
            " {}[{}] {} {}",
            marker,
            citation.label,
            citation.document_id,
            citation.title.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_retrieval(result: &RetrievalResult) {
    if result.is_empty() {
        println!("No results.");
        return;
    }

    for chunk in &result.results {
        println!(
            "{}. [{:.4}] {} #{} (tokens {}..{})",
            chunk.rank,
            chunk.score,
            chunk.document_id,
            chunk.ordinal,
            chunk.start_offset,
            chunk.end_offset
        );
        println!("    chunk: {}", chunk.chunk_id);
        println!("    {}", snippet(&chunk.text, 160));
        println!();
    }

    println!("Citations:");
    for citation in &result.citations {
        println!(
            "  [{}] {} tokens {}..{}{}",
            citation.label,
            citation.document_id,
            citation.start_offset,
            citation.end_offset,
            citation
                .title
                .as_deref()
                .map(|t| format!(" \"{}\"", t))
                .unwrap_or_default()
        );
    }
    println!("Context: {} tokens", result.context_tokens);
}

/// First `max_chars` characters of `text` on one line.
fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat,
    }
}
