//! Document retrieval by docid or `collection/path`.
//!
//! Besides single-document `get`, this module backs `ls` (collections, or
//! the active files under a `collection/prefix`) and `multi-get`, which
//! resolves a glob over `collection/path` or a comma-separated target list.
//! `multi-get` skips bodies larger than `max_bytes` instead of printing them.

use anyhow::{bail, Context as _, Result};
use globset::GlobBuilder;
use serde::Serialize;

use qmd_core::models::{most_specific_context, Document};
use qmd_core::store::Store;
use qmd_core::QmdError;

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub docid: String,
    pub collection: String,
    pub path: String,
    pub title: String,
    pub active: bool,
    pub created_at: String, // ISO8601
    pub modified_at: String, // ISO8601
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub body: String,
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub seq: usize,
    pub pos: usize,
    pub text: String,
}

/// How a `get` target names a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target<'a> {
    Docid(&'a str),
    Path { collection: &'a str, path: &'a str },
}

/// `#abc123` or a bare hex prefix is a docid; `collection/path` is a path.
pub fn parse_target(target: &str) -> Result<Target<'_>> {
    let target = target.trim();
    if let Some(id) = target.strip_prefix('#') {
        return docid_target(id);
    }
    if let Some((collection, path)) = target.split_once('/') {
        if collection.is_empty() || path.is_empty() {
            bail!("expected <collection>/<path>, got '{}'", target);
        }
        return Ok(Target::Path { collection, path });
    }
    docid_target(target)
}

fn docid_target(id: &str) -> Result<Target<'_>> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(QmdError::InvalidInput(format!("'{id}' is not a docid")).into());
    }
    Ok(Target::Docid(id))
}

async fn resolve<S: Store + ?Sized>(store: &S, target: &Target<'_>) -> Result<Document> {
    match target {
        Target::Path { collection, path } => match store.get_document(collection, path).await? {
            Some(doc) => Ok(doc),
            None => Err(QmdError::NotFound(format!("{collection}/{path}")).into()),
        },
        Target::Docid(id) => {
            let prefix = id.to_ascii_lowercase();
            let mut matches = store.find_by_docid(&prefix).await?;
            // Identical content at several paths shares one docid.
            let same_content = matches.windows(2).all(|w| w[0].hash == w[1].hash);
            match matches.len() {
                0 => Err(QmdError::NotFound(format!("#{id}")).into()),
                _ if same_content => Ok(matches.remove(0)),
                _ => {
                    let names: Vec<String> = matches
                        .iter()
                        .map(|d| format!("{}/{} (#{})", d.collection, d.path, d.docid()))
                        .collect();
                    bail!("docid #{} is ambiguous: {}", id, names.join(", "))
                }
            }
        }
    }
}

/// Load a document with its body and chunks.
pub async fn get_document<S: Store + ?Sized>(store: &S, target: &str) -> Result<DocumentResponse> {
    let target = parse_target(target)?;
    let doc = resolve(store, &target).await?;

    let body = store
        .get_content(&doc.hash)
        .await?
        .map(|c| c.body)
        .unwrap_or_default();
    let chunks = store
        .get_chunks(&doc.hash)
        .await?
        .into_iter()
        .map(|c| ChunkResponse {
            seq: c.seq,
            pos: c.pos,
            text: c.text,
        })
        .collect();
    let contexts = store.list_path_contexts(Some(&doc.collection)).await?;
    let context =
        most_specific_context(&contexts, &doc.collection, &doc.path).map(|c| c.description.clone());

    Ok(DocumentResponse {
        docid: doc.docid(),
        collection: doc.collection,
        path: doc.path,
        title: doc.title,
        active: doc.active,
        created_at: format_ts_iso(doc.created_at),
        modified_at: format_ts_iso(doc.modified_at),
        context,
        body,
        chunks,
    })
}

pub async fn run_get(config: &Config, target: &str, json: bool) -> Result<()> {
    let store = db::open_store(config).await?;
    let doc = get_document(&store, target).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("--- Document ---");
    println!("docid:       #{}", doc.docid);
    println!("title:       {}", doc.title);
    println!("collection:  {}", doc.collection);
    println!("path:        {}", doc.path);
    if !doc.active {
        println!("active:      false");
    }
    println!("created_at:  {}", doc.created_at);
    println!("modified_at: {}", doc.modified_at);
    if let Some(context) = &doc.context {
        println!("context:     {}", context);
    }
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {} @ {}]", chunk.seq, chunk.pos);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}

/// One configured collection and its active document count.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionListing {
    pub name: String,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListing {
    pub docid: String,
    pub collection: String,
    pub path: String,
    pub title: String,
    pub bytes: usize,
    pub modified_at: String,
}

/// Split an `ls` target (`name`, `name/prefix`, optionally `qmd://`-prefixed)
/// into the collection and a path prefix. Trailing slashes are ignored.
pub fn parse_ls_target(target: &str) -> Result<(&str, Option<&str>)> {
    let target = target.trim();
    let target = target.strip_prefix("qmd://").unwrap_or(target);
    let target = target.trim_end_matches('/');
    let (collection, prefix) = match target.split_once('/') {
        Some((c, p)) => (c, Some(p.trim_matches('/')).filter(|p| !p.is_empty())),
        None => (target, None),
    };
    if collection.is_empty() {
        bail!("expected <collection>[/<path>], got '{}'", target);
    }
    Ok((collection, prefix))
}

/// `path` is `prefix` itself or lies under the `prefix` directory.
fn under_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub async fn list_collections<S: Store + ?Sized>(
    store: &S,
    config: &Config,
) -> Result<Vec<CollectionListing>> {
    let mut listings = Vec::with_capacity(config.collections.len());
    for c in &config.collections {
        listings.push(CollectionListing {
            name: c.name.clone(),
            files: store.list_documents(&c.name).await?.len(),
        });
    }
    Ok(listings)
}

/// Active documents of `collection` under `prefix`, ordered by path.
pub async fn list_files<S: Store + ?Sized>(
    store: &S,
    collection: &str,
    prefix: Option<&str>,
) -> Result<Vec<FileListing>> {
    let mut files = Vec::new();
    for doc in store.list_documents(collection).await? {
        if prefix.is_some_and(|p| !under_prefix(&doc.path, p)) {
            continue;
        }
        let bytes = store
            .get_content(&doc.hash)
            .await?
            .map(|c| c.body.len())
            .unwrap_or(0);
        files.push(FileListing {
            docid: doc.docid(),
            bytes,
            modified_at: format_ts_iso(doc.modified_at),
            collection: doc.collection,
            path: doc.path,
            title: doc.title,
        });
    }
    Ok(files)
}

pub async fn run_ls(config: &Config, target: Option<&str>, json: bool) -> Result<()> {
    let store = db::open_store(config).await?;

    let Some(target) = target else {
        let listings = list_collections(&store, config).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&listings)?);
            return Ok(());
        }
        if listings.is_empty() {
            println!("No collections configured.");
            return Ok(());
        }
        for l in &listings {
            println!("qmd://{}/  ({} file{})", l.name, l.files, if l.files == 1 { "" } else { "s" });
        }
        return Ok(());
    };

    let (collection, prefix) = parse_ls_target(target)?;
    if config.collection(collection).is_none() {
        bail!("unknown collection: '{}'", collection);
    }
    let files = list_files(&store, collection, prefix).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }
    if files.is_empty() {
        println!("No files under qmd://{}/{}", collection, prefix.unwrap_or(""));
        return Ok(());
    }
    for f in &files {
        println!(
            "{:>8}  {}  qmd://{}/{}",
            format_bytes(f.bytes),
            f.modified_at,
            f.collection,
            f.path
        );
    }
    Ok(())
}

fn format_bytes(bytes: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let b = bytes as f64;
    if b >= MB {
        format!("{:.1}M", b / MB)
    } else if b >= KB {
        format!("{:.1}K", b / KB)
    } else {
        format!("{bytes}B")
    }
}

pub const DEFAULT_MULTI_GET_MAX_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone)]
pub struct MultiGetOptions {
    /// Keep only the first `lines` lines of each body.
    pub lines: Option<usize>,
    /// Bodies larger than this are skipped.
    pub max_bytes: usize,
}

impl Default for MultiGetOptions {
    fn default() -> Self {
        Self {
            lines: None,
            max_bytes: DEFAULT_MULTI_GET_MAX_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiGetEntry {
    pub docid: String,
    pub collection: String,
    pub path: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Why the body was left out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Documents named by `pattern`: a glob matched against `collection/path`
/// (`*` stays within one path component), or a comma-separated list of
/// `get` targets.
async fn select_documents<S: Store + ?Sized>(
    store: &S,
    config: &Config,
    pattern: &str,
) -> Result<Vec<Document>> {
    let pattern = pattern.trim();
    if !is_glob(pattern) {
        let mut docs = Vec::new();
        for target in pattern.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            docs.push(resolve(store, &parse_target(target)?).await?);
        }
        return Ok(docs);
    }

    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid glob '{pattern}'"))?
        .compile_matcher();
    let mut docs = Vec::new();
    for c in &config.collections {
        for doc in store.list_documents(&c.name).await? {
            if matcher.is_match(format!("{}/{}", doc.collection, doc.path)) {
                docs.push(doc);
            }
        }
    }
    Ok(docs)
}

pub async fn multi_get<S: Store + ?Sized>(
    store: &S,
    config: &Config,
    pattern: &str,
    options: &MultiGetOptions,
) -> Result<Vec<MultiGetEntry>> {
    let docs = select_documents(store, config, pattern).await?;
    let mut entries = Vec::with_capacity(docs.len());
    for doc in docs {
        let body = store
            .get_content(&doc.hash)
            .await?
            .map(|c| c.body)
            .unwrap_or_default();
        let (body, skipped) = if body.len() > options.max_bytes {
            let reason = format!("{} bytes exceeds --max-bytes {}", body.len(), options.max_bytes);
            (None, Some(reason))
        } else {
            let body = match options.lines {
                Some(n) => body.lines().take(n).collect::<Vec<_>>().join("\n"),
                None => body,
            };
            (Some(body), None)
        };
        entries.push(MultiGetEntry {
            docid: doc.docid(),
            collection: doc.collection,
            path: doc.path,
            title: doc.title,
            body,
            skipped,
        });
    }
    Ok(entries)
}

pub async fn run_multi_get(
    config: &Config,
    pattern: &str,
    options: &MultiGetOptions,
    json: bool,
) -> Result<()> {
    let store = db::open_store(config).await?;
    let entries = multi_get(&store, config, pattern, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No documents match '{}'.", pattern);
        return Ok(());
    }
    for e in &entries {
        println!("=== qmd://{}/{}  #{} ===", e.collection, e.path, e.docid);
        match (&e.body, &e.skipped) {
            (Some(body), _) => println!("{}", body),
            (None, Some(reason)) => println!("[skipped: {}]", reason),
            (None, None) => {}
        }
        println!();
    }
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmd_core::chunk::ChunkParams;
    use qmd_core::models::{content_hash, docid, PathContext};
    use qmd_core::store::memory::InMemoryStore;
    use std::sync::Arc;

    use crate::config::parse_config;
    use crate::indexer::Indexer;

    fn two_collections() -> Config {
        parse_config(
            r#"
[storage]
backend = "memory"

[[collections]]
name = "notes"
path = "./notes"

[[collections]]
name = "work"
path = "./work"
"#,
        )
        .unwrap()
    }

    async fn indexed() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let indexer = Indexer::new(store.clone(), ChunkParams::default());
        let docs = [
            ("notes", "ops/deploy.md", "Deploy", "line one\nline two\nline three"),
            ("notes", "ops/rollback.md", "Rollback", "undo the deploy"),
            ("notes", "opsec.md", "Opsec", "keep secrets"),
            ("work", "plan.md", "Plan", "quarterly plan"),
        ];
        for (collection, path, title, body) in docs {
            indexer.add_document(collection, path, title, body).await.unwrap();
        }
        store
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("#a1b2c3").unwrap(), Target::Docid("a1b2c3"));
        assert_eq!(parse_target("a1b2c3").unwrap(), Target::Docid("a1b2c3"));
        assert_eq!(
            parse_target("notes/dir/x.md").unwrap(),
            Target::Path {
                collection: "notes",
                path: "dir/x.md"
            }
        );
        assert!(parse_target("#zzz").is_err());
        assert!(parse_target("/x.md").is_err());
    }

    #[tokio::test]
    async fn test_get_by_docid_and_path() {
        let store = Arc::new(InMemoryStore::new());
        let indexer = Indexer::new(store.clone(), ChunkParams::default());
        indexer.add_document("notes", "a.md", "A", "alpha body").await.unwrap();

        let id = docid(&content_hash("alpha body"));
        let by_id = get_document(store.as_ref(), &format!("#{id}")).await.unwrap();
        assert_eq!(by_id.path, "a.md");
        assert_eq!(by_id.body, "alpha body");
        assert_eq!(by_id.chunks.len(), 1);

        let by_path = get_document(store.as_ref(), "notes/a.md").await.unwrap();
        assert_eq!(by_path.docid, id);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryStore::new();
        let err = get_document(&store, "notes/none.md").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QmdError>(),
            Some(QmdError::NotFound(_))
        ));
    }

    #[test]
    fn test_parse_ls_target() {
        assert_eq!(parse_ls_target("notes").unwrap(), ("notes", None));
        assert_eq!(parse_ls_target("notes/").unwrap(), ("notes", None));
        assert_eq!(parse_ls_target("qmd://notes/ops/").unwrap(), ("notes", Some("ops")));
        assert!(parse_ls_target("/ops").is_err());
    }

    #[tokio::test]
    async fn test_ls_counts_active_documents_per_collection() {
        let store = indexed().await;
        store.deactivate_document("work", "plan.md", 1).await.unwrap();

        let listings = list_collections(store.as_ref(), &two_collections()).await.unwrap();
        let counts: Vec<(&str, usize)> =
            listings.iter().map(|l| (l.name.as_str(), l.files)).collect();
        assert_eq!(counts, vec![("notes", 3), ("work", 0)]);
    }

    #[tokio::test]
    async fn test_ls_prefix_matches_whole_components() {
        let store = indexed().await;
        let files = list_files(store.as_ref(), "notes", Some("ops")).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["ops/deploy.md", "ops/rollback.md"]);
        assert_eq!(files[1].bytes, "undo the deploy".len());

        let all = list_files(store.as_ref(), "notes", None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_multi_get_by_glob() {
        let store = indexed().await;
        let config = two_collections();
        let entries = multi_get(store.as_ref(), &config, "notes/ops/*.md", &MultiGetOptions::default())
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["ops/deploy.md", "ops/rollback.md"]);

        let everywhere = multi_get(store.as_ref(), &config, "*/*.md", &MultiGetOptions::default())
            .await
            .unwrap();
        assert_eq!(everywhere.len(), 2);
    }

    #[tokio::test]
    async fn test_multi_get_target_list_with_line_limit() {
        let store = indexed().await;
        let options = MultiGetOptions {
            lines: Some(2),
            ..Default::default()
        };
        let entries = multi_get(
            store.as_ref(),
            &two_collections(),
            "notes/ops/deploy.md, work/plan.md",
            &options,
        )
        .await
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].body.as_deref(), Some("line one\nline two"));
        assert_eq!(entries[1].collection, "work");

        let err = multi_get(store.as_ref(), &two_collections(), "notes/missing.md", &options).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_multi_get_skips_large_bodies() {
        let store = indexed().await;
        let options = MultiGetOptions {
            lines: None,
            max_bytes: 15,
        };
        let entries = multi_get(store.as_ref(), &two_collections(), "notes/**", &options)
            .await
            .unwrap();
        let deploy = entries.iter().find(|e| e.path == "ops/deploy.md").unwrap();
        assert!(deploy.body.is_none());
        assert!(deploy.skipped.as_deref().unwrap().contains("max-bytes"));
        let opsec = entries.iter().find(|e| e.path == "opsec.md").unwrap();
        assert_eq!(opsec.body.as_deref(), Some("keep secrets"));
    }

    #[tokio::test]
    async fn test_get_includes_path_context() {
        let store = indexed().await;
        store
            .set_path_context(&PathContext {
                collection: "notes".into(),
                path: "ops".into(),
                description: "runbooks".into(),
                updated_at: 0,
            })
            .await
            .unwrap();

        let doc = get_document(store.as_ref(), "notes/ops/deploy.md").await.unwrap();
        assert_eq!(doc.context.as_deref(), Some("runbooks"));
        let doc = get_document(store.as_ref(), "notes/opsec.md").await.unwrap();
        assert_eq!(doc.context, None);
    }
}
