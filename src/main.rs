//! # Standards Search CLI (`sts`)
//!
//! ## Usage
//!
//! ```bash
//! sts --config ./config/sts.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sts init` | Create the SQLite database and run schema migrations |
//! | `sts ingest <files...>` | Chunk, embed, and publish documents |
//! | `sts remove <id>` | Remove a document from search |
//! | `sts search "<query>"` | Retrieve context and citations |
//! | `sts ask "<question>"` | Retrieve, then generate a cited answer |
//! | `sts get <id>` | Show a document and its published chunks |
//! | `sts stats` | Index summary per embedding model |
//! | `sts vacuum` | Purge tombstoned entries |
//! | `sts embed backfill` | Embed published documents with `[embedding_next]` |
//! | `sts embed retire <model>` | Stop serving an embedding model |
//! | `sts serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use standards_search::ingest::IngestArgs;
use standards_search::search::QueryArgs;
use standards_search::{config, embed_cmd, get, ingest, logging, migrate, search, server, stats};

/// Standards Search: retrieval-augmented search over technical standards.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sts.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "sts", version, about = "Standards Search: chunk, embed, index, and cite technical standards")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sts.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct QueryOpts {
    /// Number of passages to return (defaults to `retrieval.default_k`).
    #[arg(long)]
    k: Option<usize>,

    /// Context token budget (defaults to `retrieval.max_context_tokens`).
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Restrict to a document ID. Repeatable.
    #[arg(long = "document")]
    documents: Vec<String>,

    /// Restrict to documents from this organization.
    #[arg(long)]
    organization: Option<String>,

    /// Print the full JSON response.
    #[arg(long)]
    json: bool,
}

impl From<QueryOpts> for QueryArgs {
    fn from(o: QueryOpts) -> Self {
        QueryArgs {
            k: o.k,
            max_tokens: o.max_tokens,
            documents: o.documents,
            organization: o.organization,
            json: o.json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest documents from text files.
    ///
    /// Unchanged files keep their version; changed files are published as
    /// the next version and supersede the previous chunks.
    Ingest {
        /// Files to ingest, one document each.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Document ID (single file only; defaults to the file stem).
        #[arg(long)]
        id: Option<String>,

        /// Explicit content version (single file only).
        #[arg(long)]
        version: Option<u64>,

        /// Title (single file only; defaults to the first `# ` heading).
        #[arg(long)]
        title: Option<String>,

        /// Publishing organization, e.g. `ISO`.
        #[arg(long)]
        organization: Option<String>,

        /// Publication date (YYYY-MM-DD).
        #[arg(long)]
        published_on: Option<String>,
    },

    /// Remove a document from search.
    Remove {
        /// Document ID.
        id: String,
    },

    /// Retrieve ranked passages, context, and citations.
    Search {
        query: String,
        #[command(flatten)]
        opts: QueryOpts,
    },

    /// Retrieve passages and generate an answer citing them.
    Ask {
        question: String,
        #[command(flatten)]
        opts: QueryOpts,
    },

    /// Show a document and its published chunks.
    Get {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Purge tombstoned entries and compact the database.
    Vacuum,

    /// Embedding-model migration.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed every published document with the `[embedding_next]` model.
    Backfill,

    /// Stop serving a model and mark its entries inactive.
    Retire {
        /// Model ID as shown by `sts stats`.
        model: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            files,
            id,
            version,
            title,
            organization,
            published_on,
        } => {
            let args = IngestArgs {
                id,
                version,
                title,
                organization,
                published_on,
            };
            ingest::run_ingest(&cfg, &files, args).await?;
        }
        Commands::Remove { id } => {
            ingest::run_remove(&cfg, &id).await?;
        }
        Commands::Search { query, opts } => {
            search::run_search(&cfg, &query, opts.into()).await?;
        }
        Commands::Ask { question, opts } => {
            search::run_ask(&cfg, &question, opts.into()).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Vacuum => {
            stats::run_vacuum(&cfg).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Backfill => {
                embed_cmd::run_backfill(&cfg).await?;
            }
            EmbedAction::Retire { model } => {
                embed_cmd::run_retire(&cfg, &model).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
