//! # qmd CLI
//!
//! ## Usage
//!
//! ```bash
//! qmd --config ./config/qmd.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qmd init` | Create the SQLite database and schema |
//! | `qmd update` | Rescan collections and index changes |
//! | `qmd embed` | Embed chunks that have no vector yet |
//! | `qmd search "<text>"` | Keyword (BM25) search |
//! | `qmd vsearch "<text>"` | Vector search |
//! | `qmd query "<text>"` | Hybrid search with expansion, fusion and reranking |
//! | `qmd get <#docid or collection/path>` | Show one document |
//! | `qmd multi-get <glob or list>` | Show several documents |
//! | `qmd ls [collection[/prefix]]` | List collections or indexed files |
//! | `qmd context add/list/rm` | Describe collections and folders |
//! | `qmd collection add/remove/rename` | Edit configured collections |
//! | `qmd cleanup` | Purge long-inactive documents and orphaned content |
//! | `qmd status` | Index overview |
//! | `qmd collections` | List configured collections |
//!
//! Logs go to stderr. `QMD_LOG` sets the filter (default `qmd=info,warn`),
//! `QMD_LOG_FORMAT=json` switches to JSON lines.

use clap::{Args, Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use qmd::search::SearchMode;
use qmd::get::MultiGetOptions;
use qmd::{collection, config, context, db, embed_cmd, get, indexer, search, stats};

/// qmd: local hybrid search over Markdown collections.
#[derive(Parser)]
#[command(
    name = "qmd",
    about = "qmd: local hybrid search (BM25 + vectors + reranking) over Markdown collections",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qmd.toml")]
    config: PathBuf,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct QueryArgs {
    /// Query text.
    query: String,

    /// Maximum number of results.
    #[arg(long, short = 'n')]
    limit: Option<usize>,

    /// Restrict to one collection.
    #[arg(long, short = 'c', conflicts_with = "all")]
    collection: Option<String>,

    /// Search every collection (the default).
    #[arg(long)]
    all: bool,

    /// Drop results scoring below this value.
    #[arg(long)]
    min_score: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Rescan collections: index new and changed files, soft-delete removed ones.
    Update {
        /// Only this collection.
        #[arg(long, short = 'c')]
        collection: Option<String>,
    },

    /// Embed chunks lacking a vector from the configured model.
    Embed {
        /// Drop existing vectors and embed everything again.
        #[arg(long)]
        force: bool,

        /// Only this collection.
        #[arg(long, short = 'c')]
        collection: Option<String>,
    },

    /// Keyword (BM25) search.
    Search(QueryArgs),

    /// Vector search. Requires an embedding provider and `qmd embed`.
    Vsearch(QueryArgs),

    /// Hybrid search: query expansion, keyword + vector retrieval, RRF, reranking.
    Query(QueryArgs),

    /// Show a document by `#docid` or `collection/path`.
    Get {
        target: String,
    },

    /// Show every document matching a glob over `collection/path`, or a
    /// comma-separated list of targets.
    MultiGet {
        pattern: String,

        /// Only the first N lines of each document.
        #[arg(long, short = 'l')]
        lines: Option<usize>,

        /// Skip documents larger than this many bytes.
        #[arg(long, default_value_t = get::DEFAULT_MULTI_GET_MAX_BYTES)]
        max_bytes: usize,
    },

    /// List collections, or the indexed files under `collection[/prefix]`.
    Ls {
        target: Option<String>,
    },

    /// Manage path contexts.
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Add, remove or rename configured collections.
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Hard-delete documents inactive longer than the retention window.
    Cleanup {
        /// Report what would be removed without removing it.
        #[arg(long)]
        dry_run: bool,

        /// Retention window in days (default: `[cleanup] retention_days`).
        #[arg(long)]
        older_than: Option<u32>,

        /// Only this collection.
        #[arg(long, short = 'c')]
        collection: Option<String>,
    },

    /// Show index statistics.
    Status,

    /// List configured collections.
    Collections,
}

#[derive(Subcommand)]
enum ContextAction {
    /// Describe a collection (`notes`) or a folder (`notes/ops`).
    Add { target: String, description: String },

    /// List contexts.
    List {
        #[arg(long, short = 'c')]
        collection: Option<String>,
    },

    /// Remove a context.
    Rm { target: String },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Add a directory as a collection.
    Add {
        path: PathBuf,

        /// Collection name (default: the directory name).
        #[arg(long)]
        name: Option<String>,

        /// Include glob; repeatable (default: `**/*.md`).
        #[arg(long = "mask")]
        masks: Vec<String>,
    },

    /// Remove a collection and drop its documents from the index.
    Remove { name: String },

    /// Rename a collection, keeping its indexed documents.
    Rename { from: String, to: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("QMD_LOG").unwrap_or_else(|_| EnvFilter::new("qmd=info,warn"));
    let format = env::var("QMD_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn run_query(cfg: &config::Config, mode: SearchMode, args: QueryArgs, json: bool) -> anyhow::Result<()> {
    search::run_search(
        cfg,
        mode,
        &args.query,
        args.collection,
        args.limit,
        args.min_score,
        json,
    )
    .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let json = cli.json;

    match cli.command {
        Commands::Init => {
            db::init(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Update { collection } => {
            indexer::run_update(&cfg, collection, json).await?;
        }
        Commands::Embed { force, collection } => {
            embed_cmd::run_embed(&cfg, force, collection, json).await?;
        }
        Commands::Search(args) => run_query(&cfg, SearchMode::Search, args, json).await?,
        Commands::Vsearch(args) => run_query(&cfg, SearchMode::VSearch, args, json).await?,
        Commands::Query(args) => run_query(&cfg, SearchMode::Query, args, json).await?,
        Commands::Get { target } => {
            get::run_get(&cfg, &target, json).await?;
        }
        Commands::MultiGet {
            pattern,
            lines,
            max_bytes,
        } => {
            let options = MultiGetOptions { lines, max_bytes };
            get::run_multi_get(&cfg, &pattern, &options, json).await?;
        }
        Commands::Ls { target } => {
            get::run_ls(&cfg, target.as_deref(), json).await?;
        }
        Commands::Context { action } => match action {
            ContextAction::Add { target, description } => {
                context::run_context_add(&cfg, &target, &description, json).await?;
            }
            ContextAction::List { collection } => {
                context::run_context_list(&cfg, collection.as_deref(), json).await?;
            }
            ContextAction::Rm { target } => {
                context::run_context_rm(&cfg, &target).await?;
            }
        },
        Commands::Collection { action } => match action {
            CollectionAction::Add { path, name, masks } => {
                collection::run_collection_add(&cli.config, name, &path, &masks, json)?;
            }
            CollectionAction::Remove { name } => {
                collection::run_collection_remove(&cli.config, &cfg, &name, json).await?;
            }
            CollectionAction::Rename { from, to } => {
                collection::run_collection_rename(&cli.config, &cfg, &from, &to, json).await?;
            }
        },
        Commands::Cleanup {
            dry_run,
            older_than,
            collection,
        } => {
            indexer::run_cleanup(&cfg, older_than, collection, dry_run, json).await?;
        }
        Commands::Status => {
            stats::run_status(&cfg, json).await?;
        }
        Commands::Collections => {
            stats::run_collections(&cfg, json)?;
        }
    }

    Ok(())
}
