//! Incremental indexer.
//!
//! The only mutating path into a store. Writes for one collection are
//! serialized through a per-collection async lock so content, chunks and
//! the lexical index never disagree; different collections index in
//! parallel. Bodies are content-addressed: identical text at two paths is
//! stored, chunked and embedded once.
//!
//! Content rows are shared across collections, so purging orphans is a
//! store-wide operation: writers hold the purge guard for reading and
//! [`Indexer::cleanup`] takes it exclusively. A body inserted by a writer
//! in another collection therefore can never be purged before its document
//! row lands.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use qmd_core::chunk::{chunk_text, ChunkParams};
use qmd_core::models::{content_hash, CleanupReport, Content, Document};
use qmd_core::store::Store;
use qmd_core::QmdError;

use crate::config::{CollectionConfig, Config};
use crate::db;

const SECS_PER_DAY: i64 = 86_400;

/// What [`Indexer::add_document`] did with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// No active row existed for the path.
    Added,
    /// The path's content or title changed.
    Updated,
    Unchanged,
}

/// Counts from one `update` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
}

impl UpdateReport {
    fn record(&mut self, outcome: AddOutcome) {
        match outcome {
            AddOutcome::Added => self.added += 1,
            AddOutcome::Updated => self.updated += 1,
            AddOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn merge(&mut self, other: &UpdateReport) {
        self.added += other.added;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

pub struct Indexer<S: Store> {
    store: Arc<S>,
    params: ChunkParams,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    purge_guard: AsyncRwLock<()>,
}

impl<S: Store> Indexer<S> {
    pub fn new(store: Arc<S>, params: ChunkParams) -> Self {
        Self {
            store,
            params,
            locks: Mutex::new(HashMap::new()),
            purge_guard: AsyncRwLock::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_for(&self, collection: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn write_lock(&self, collection: &str) -> OwnedMutexGuard<()> {
        self.lock_for(collection).lock_owned().await
    }

    /// Index one document body under `(collection, path)`.
    pub async fn add_document(
        &self,
        collection: &str,
        path: &str,
        title: &str,
        content: &str,
    ) -> Result<AddOutcome> {
        if collection.is_empty() || path.is_empty() {
            return Err(QmdError::InvalidInput("collection and path must not be empty".into()).into());
        }

        let _purge = self.purge_guard.read().await;
        let _guard = self.write_lock(collection).await;
        let hash = content_hash(content);
        let now = chrono::Utc::now().timestamp();

        let existing = self
            .store
            .get_document(collection, path)
            .await
            .with_context(|| format!("{collection}/{path}"))?;

        let outcome = match &existing {
            Some(doc) if doc.active && doc.hash == hash && doc.title == title => {
                return Ok(AddOutcome::Unchanged);
            }
            Some(doc) if doc.active => AddOutcome::Updated,
            _ => AddOutcome::Added,
        };

        if !self.store.content_exists(&hash).await? {
            let chunks = chunk_text(&hash, content, &self.params);
            debug!(collection, path, chunks = chunks.len(), "new content");
            let row = Content {
                hash: hash.clone(),
                body: content.to_string(),
                size: content.len(),
            };
            self.store
                .insert_content(&row, &chunks)
                .await
                .with_context(|| format!("storing content {hash} for {collection}/{path}"))?;
        }

        let doc = Document {
            collection: collection.to_string(),
            path: path.to_string(),
            title: title.to_string(),
            hash,
            active: true,
            created_at: existing.as_ref().map(|d| d.created_at).unwrap_or(now),
            modified_at: now,
            deactivated_at: None,
        };
        self.store
            .upsert_document(&doc)
            .await
            .with_context(|| format!("{collection}/{path}"))?;
        self.store
            .index_document(&doc, content)
            .await
            .with_context(|| format!("indexing {collection}/{path}"))?;

        Ok(outcome)
    }

    /// Soft-delete the active document at `(collection, path)`.
    ///
    /// Content, chunks and embeddings stay until [`cleanup`](Self::cleanup).
    pub async fn remove_document(&self, collection: &str, path: &str) -> Result<bool> {
        let _purge = self.purge_guard.read().await;
        let _guard = self.write_lock(collection).await;
        let now = chrono::Utc::now().timestamp();
        let removed = self
            .store
            .deactivate_document(collection, path, now)
            .await
            .with_context(|| format!("{collection}/{path}"))?;
        Ok(removed)
    }

    /// Hard-delete documents inactive for more than `older_than_days`, then
    /// orphaned content. A dry run reports the same counts and changes nothing.
    ///
    /// Expired cache entries are purged only by an unscoped run.
    pub async fn cleanup(
        &self,
        older_than_days: u32,
        collection: Option<&str>,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        let now = chrono::Utc::now().timestamp();
        let cutoff = now - i64::from(older_than_days) * SECS_PER_DAY;

        let _purge = self.purge_guard.write().await;
        let mut report = self
            .store
            .purge_inactive(cutoff, collection, dry_run)
            .await
            .context("cleanup failed")?;
        if collection.is_none() {
            report.cache_entries = self
                .store
                .purge_expired_cache(now, dry_run)
                .await
                .context("cache cleanup failed")?;
        }
        Ok(report)
    }

    /// Move every row of `from` to `to`.
    pub async fn rename_collection(&self, from: &str, to: &str) -> Result<usize> {
        let _purge = self.purge_guard.write().await;
        let moved = self
            .store
            .rename_collection(from, to)
            .await
            .with_context(|| format!("renaming collection '{from}' to '{to}'"))?;
        info!(from, to, documents = moved, "collection renamed");
        Ok(moved)
    }

    /// Delete a collection's documents and contexts. Its content becomes
    /// orphaned and goes on the next cleanup.
    pub async fn drop_collection(&self, collection: &str) -> Result<usize> {
        let _purge = self.purge_guard.read().await;
        let _guard = self.write_lock(collection).await;
        let dropped = self
            .store
            .drop_collection(collection)
            .await
            .with_context(|| format!("dropping collection '{collection}'"))?;
        info!(collection, documents = dropped, "collection dropped");
        Ok(dropped)
    }

    /// Rescan every configured collection.
    pub async fn update(&self, collections: &[CollectionConfig]) -> Result<UpdateReport> {
        let mut total = UpdateReport::default();
        for collection in collections {
            let report = match self.update_collection(collection).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(collection = %collection.name, error = %format!("{e:#}"), "collection skipped");
                    total.failed += 1;
                    continue;
                }
            };
            info!(
                collection = %collection.name,
                added = report.added,
                updated = report.updated,
                unchanged = report.unchanged,
                removed = report.removed,
                failed = report.failed,
                "collection updated"
            );
            total.merge(&report);
        }
        Ok(total)
    }

    /// Index the files of one collection and soft-delete documents whose
    /// files are gone.
    pub async fn update_collection(&self, collection: &CollectionConfig) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();
        let root = &collection.path;
        if !root.is_dir() {
            bail!(
                "collection '{}' root does not exist: {}",
                collection.name,
                root.display()
            );
        }

        let include_set = build_globset(&collection.include_globs)?;
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(collection.exclude_globs.iter().cloned());
        let exclude_set = build_globset(&excludes)?;

        let mut seen = HashSet::new();
        let walker = WalkDir::new(root)
            .follow_links(collection.follow_symlinks)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(collection = %collection.name, error = %e, "walk failed");
                    report.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = relative_path(root, entry.path());
            if exclude_set.is_match(&rel) || !include_set.is_match(&rel) {
                continue;
            }
            seen.insert(rel.clone());

            let body = match std::fs::read_to_string(entry.path()) {
                Ok(b) => b,
                Err(e) => {
                    warn!(collection = %collection.name, path = %rel, error = %e, "unreadable file skipped");
                    report.failed += 1;
                    continue;
                }
            };
            let title = extract_title(&body, entry.path());

            match self.add_document(&collection.name, &rel, &title, &body).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!(collection = %collection.name, path = %rel, error = %format!("{e:#}"), "indexing failed");
                    report.failed += 1;
                }
            }
        }

        let indexed = self.store.list_documents(&collection.name).await?;
        for doc in indexed {
            if seen.contains(&doc.path) {
                continue;
            }
            if self.remove_document(&collection.name, &doc.path).await? {
                debug!(collection = %collection.name, path = %doc.path, "file gone, deactivated");
                report.removed += 1;
            }
        }

        Ok(report)
    }
}

pub async fn run_update(config: &Config, collection: Option<String>, json: bool) -> Result<()> {
    let selected: Vec<CollectionConfig> = match &collection {
        Some(name) => vec![config
            .collection(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown collection: '{}'", name))?],
        None => config.collections.clone(),
    };
    if selected.is_empty() {
        bail!("no collections configured; add a [[collections]] entry to the config");
    }

    let store = Arc::new(db::open_store(config).await?);
    let indexer = Indexer::new(store, config.chunking.params()?);
    let report = indexer.update(&selected).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("update ({} collection{})", selected.len(), if selected.len() == 1 { "" } else { "s" });
    println!("  added: {}", report.added);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  removed: {}", report.removed);
    println!("  failed: {}", report.failed);
    if report.added + report.updated > 0 && config.embedding.is_enabled() {
        println!("  run `qmd embed` to embed new content");
    }
    Ok(())
}

pub async fn run_cleanup(
    config: &Config,
    older_than: Option<u32>,
    collection: Option<String>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let days = older_than.unwrap_or(config.cleanup.retention_days);
    let store = Arc::new(db::open_store(config).await?);
    let indexer = Indexer::new(store, config.chunking.params()?);
    let report = indexer.cleanup(days, collection.as_deref(), dry_run).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let verb = if dry_run { "would remove" } else { "removed" };
    println!(
        "cleanup (inactive > {} day{}){}",
        days,
        if days == 1 { "" } else { "s" },
        if dry_run { " (dry-run)" } else { "" }
    );
    println!("  documents {}: {}", verb, report.documents);
    println!("  contents {}: {}", verb, report.contents);
    println!("  chunks {}: {}", verb, report.chunks);
    println!("  embeddings {}: {}", verb, report.embeddings);
    if collection.is_none() {
        println!("  cache entries {}: {}", verb, report.cache_entries);
    }
    Ok(())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{pattern}'"))?);
    }
    Ok(builder.build()?)
}

/// Collection-relative path with `/` separators.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// First Markdown `# ` heading, else the file name.
pub fn extract_title(body: &str, path: &Path) -> String {
    body.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        })
}
