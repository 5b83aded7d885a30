//! Index status and collection listing.
//!
//! `qmd status` shows what is indexed per collection (active and
//! soft-deleted documents, chunks, embedding coverage) and which providers
//! are configured. Embedding coverage counts only vectors written by the
//! configured model. `qmd collections` lists the configured collections.

use anyhow::Result;
use serde::Serialize;

use qmd_core::models::CollectionStats;
use qmd_core::store::Store;

use crate::config::{Config, StorageBackend};
use crate::{db, embedding};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub backend: String,
    pub contents: i64,
    pub collections: Vec<CollectionStats>,
    pub embedding: String,
    pub rerank: String,
    pub expansion: String,
}

impl StatusReport {
    pub fn total_active(&self) -> i64 {
        self.collections.iter().map(|c| c.active_documents).sum()
    }

    pub fn total_chunks(&self) -> i64 {
        self.collections.iter().map(|c| c.chunks).sum()
    }

    pub fn total_embedded(&self) -> i64 {
        self.collections.iter().map(|c| c.embedded_chunks).sum()
    }
}

fn provider_label(provider: &str, model: Option<&str>) -> String {
    match model {
        Some(m) if provider != "disabled" => format!("{provider} ({m})"),
        _ => provider.to_string(),
    }
}

/// Gather counts from the store and provider settings from the config.
pub async fn status<S: Store + ?Sized>(store: &S, config: &Config) -> Result<StatusReport> {
    let model = embedding::active_model(&config.embedding);
    let mut collections = store.stats(model.as_deref()).await?;
    // Configured collections with nothing indexed yet still show up.
    for c in &config.collections {
        if !collections.iter().any(|s| s.collection == c.name) {
            collections.push(CollectionStats {
                collection: c.name.clone(),
                ..Default::default()
            });
        }
    }
    collections.sort_by(|a, b| a.collection.cmp(&b.collection));

    Ok(StatusReport {
        database: config.db.path.display().to_string(),
        backend: match config.storage.backend {
            StorageBackend::Sqlite => "sqlite".to_string(),
            StorageBackend::Memory => "memory".to_string(),
        },
        contents: store.content_count().await?,
        collections,
        embedding: provider_label(&config.embedding.provider, model.as_deref()),
        rerank: provider_label(&config.rerank.provider, config.rerank.model.as_deref()),
        expansion: provider_label(&config.expansion.provider, config.expansion.model.as_deref()),
    })
}

pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let store = db::open_store(config).await?;
    let report = status(&store, config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let chunks = report.total_chunks();
    let embedded = report.total_embedded();

    println!("qmd status");
    println!("==========");
    println!();
    println!("  Database:    {} ({})", report.database, report.backend);
    println!("  Documents:   {}", report.total_active());
    println!("  Contents:    {}", report.contents);
    println!("  Chunks:      {}", chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        embedded,
        chunks,
        if chunks > 0 { (embedded * 100) / chunks } else { 0 }
    );
    println!();
    println!("  Embedding:   {}", report.embedding);
    println!("  Rerank:      {}", report.rerank);
    println!("  Expansion:   {}", report.expansion);

    if !report.collections.is_empty() {
        println!();
        println!(
            "  {:<24} {:>8} {:>9} {:>8} {:>10}",
            "COLLECTION", "ACTIVE", "INACTIVE", "CHUNKS", "EMBEDDED"
        );
        println!("  {}", "-".repeat(63));
        for c in &report.collections {
            println!(
                "  {:<24} {:>8} {:>9} {:>8} {:>10}",
                c.collection,
                c.active_documents,
                c.inactive_documents,
                c.chunks,
                c.embedded_chunks
            );
        }
    }
    println!();
    Ok(())
}

#[derive(Debug, Serialize)]
struct CollectionEntry<'a> {
    name: &'a str,
    path: String,
    include_globs: &'a [String],
    exclude_globs: &'a [String],
}

pub fn run_collections(config: &Config, json: bool) -> Result<()> {
    let entries: Vec<CollectionEntry<'_>> = config
        .collections
        .iter()
        .map(|c| CollectionEntry {
            name: &c.name,
            path: c.path.display().to_string(),
            include_globs: &c.include_globs,
            exclude_globs: &c.exclude_globs,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No collections configured.");
        return Ok(());
    }
    for e in &entries {
        println!("{:<20} {}  [{}]", e.name, e.path, e.include_globs.join(", "));
    }
    Ok(())
}
