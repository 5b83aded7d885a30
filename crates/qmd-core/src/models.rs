//! Core data models used throughout qmd.
//!
//! These types represent the documents, content, chunks and search results
//! that flow through the ingestion and retrieval pipeline.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Number of hex characters of the content hash shown as a docid.
pub const DOCID_LEN: usize = 6;

/// A document row: one path inside one collection pointing at content.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: String,
    pub path: String,
    pub title: String,
    pub hash: String,
    pub active: bool,
    pub created_at: i64,
    pub modified_at: i64,
    /// Unix seconds when the document was soft-deleted.
    pub deactivated_at: Option<i64>,
}

impl Document {
    pub fn docid(&self) -> String {
        docid(&self.hash)
    }
}

/// Content-addressed document body.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub hash: String,
    pub body: String,
    pub size: usize,
}

/// A slice of a content body; the unit embeddings are computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub hash: String,
    pub seq: usize,
    /// Byte offset of the chunk in the content body.
    pub pos: usize,
    pub text: String,
}

/// A chunk that still needs an embedding for the active model.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub hash: String,
    pub seq: usize,
    pub title: String,
    pub text: String,
}

/// Which collections a search may see. `None` means every collection.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub collections: Option<Vec<String>>,
}

impl SearchFilter {
    pub fn all() -> Self {
        Self { collections: None }
    }

    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collections: Some(vec![name.into()]),
        }
    }

    pub fn allows(&self, collection: &str) -> bool {
        match &self.collections {
            None => true,
            Some(names) => names.iter().any(|n| n == collection),
        }
    }
}

/// A scored document as it moves through the query pipeline.
///
/// `score` means different things per stage: a method's own normalized
/// score, then the fused RRF score, then the blended rerank score.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResult {
    pub docid: String,
    pub collection: String,
    pub path: String,
    pub title: String,
    #[serde(skip)]
    pub hash: String,
    pub score: f64,
    /// Best-matching chunk text, used for display and as rerank input.
    pub snippet: String,
    /// Description of the most specific path context covering the document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl SearchResult {
    /// Identity used to merge one logical document across ranked lists.
    pub fn key(&self) -> (&str, &str) {
        (&self.collection, &self.path)
    }
}

/// Results from one retrieval method for one query variant, best first.
pub type RankedList = Vec<SearchResult>;

/// Summary of documents and embeddings for one collection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionStats {
    pub collection: String,
    pub active_documents: i64,
    pub inactive_documents: i64,
    pub chunks: i64,
    pub embedded_chunks: i64,
}

/// Counts produced by a cleanup run (or what a dry run would remove).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub documents: usize,
    pub contents: usize,
    pub chunks: usize,
    pub embeddings: usize,
    /// Expired provider cache entries.
    pub cache_entries: usize,
}

/// A human description attached to a collection or a folder inside it.
///
/// An empty `path` covers the whole collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathContext {
    pub collection: String,
    pub path: String,
    pub description: String,
    pub updated_at: i64,
}

impl PathContext {
    /// Whether this context covers `path` in `collection`. Matching is by
    /// whole path components, so `ops` covers `ops/deploy.md` but not
    /// `opsec.md`.
    pub fn covers(&self, collection: &str, path: &str) -> bool {
        if self.collection != collection {
            return false;
        }
        let prefix = self.path.trim_matches('/');
        prefix.is_empty()
            || path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// The covering context with the longest path, if any.
pub fn most_specific_context<'a>(
    contexts: &'a [PathContext],
    collection: &str,
    path: &str,
) -> Option<&'a PathContext> {
    contexts
        .iter()
        .filter(|c| c.covers(collection, path))
        .max_by_key(|c| c.path.trim_matches('/').len())
}

/// SHA-256 of the body bytes, lowercase hex.
pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn docid(hash: &str) -> String {
    hash.chars().take(DOCID_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash("hello");
        assert_eq!(a, content_hash("hello"));
        assert_ne!(a, content_hash("hello "));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_docid_is_hash_prefix() {
        let hash = content_hash("some body");
        assert_eq!(docid(&hash), &hash[..DOCID_LEN]);
    }

    fn ctx(path: &str, description: &str) -> PathContext {
        PathContext {
            collection: "notes".into(),
            path: path.into(),
            description: description.into(),
            updated_at: 0,
        }
    }

    #[test]
    fn test_context_covers_whole_components() {
        let ops = ctx("ops", "runbooks");
        assert!(ops.covers("notes", "ops"));
        assert!(ops.covers("notes", "ops/deploy.md"));
        assert!(!ops.covers("notes", "opsec.md"));
        assert!(!ops.covers("docs", "ops/deploy.md"));
        assert!(ctx("", "all notes").covers("notes", "anything.md"));
    }

    #[test]
    fn test_most_specific_context_wins() {
        let contexts = vec![
            ctx("", "all notes"),
            ctx("ops", "runbooks"),
            ctx("ops/k8s", "cluster notes"),
        ];
        let pick = |path: &str| {
            most_specific_context(&contexts, "notes", path).map(|c| c.description.as_str())
        };
        assert_eq!(pick("ops/k8s/upgrade.md"), Some("cluster notes"));
        assert_eq!(pick("ops/deploy.md"), Some("runbooks"));
        assert_eq!(pick("readme.md"), Some("all notes"));
        assert_eq!(most_specific_context(&contexts, "docs", "readme.md"), None);
    }

    #[test]
    fn test_filter_allows() {
        assert!(SearchFilter::all().allows("notes"));
        let f = SearchFilter::collection("notes");
        assert!(f.allows("notes"));
        assert!(!f.allows("docs"));
    }
}
