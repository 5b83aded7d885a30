//! Storage abstraction for qmd.
//!
//! The [`Store`] trait covers every persistent operation the indexer and
//! the query pipeline need: content-addressed bodies and chunks, document
//! rows with soft delete, the lexical index, the vector index, path
//! contexts, and a small response cache for model providers. Fusion
//! and blending never see a store; they work on [`RankedList`]s produced
//! by the adapters in [`crate::lexical`] and [`crate::vector`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! [`RankedList`]: crate::models::RankedList

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Chunk, CleanupReport, CollectionStats, Content, Document, PathContext, PendingChunk,
    SearchFilter,
};

/// Direction of the raw scores a lexical backend produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOrder {
    HigherIsBetter,
    /// SQLite FTS5 `bm25()` and similar engines.
    LowerIsBetter,
}

/// Backend-neutral full-text query. Each backend renders it in its own syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtsQuery {
    /// All terms must match.
    Terms(Vec<String>),
    /// The raw query matched as one literal phrase.
    Phrase(String),
}

/// A document matched by the lexical index, with its backend-native score.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub collection: String,
    pub path: String,
    pub title: String,
    pub hash: String,
    pub raw_score: f64,
    pub snippet: String,
}

/// The best-scoring chunk of an active document matched by the vector index.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub collection: String,
    pub path: String,
    pub title: String,
    pub hash: String,
    pub seq: usize,
    /// Dot product against the normalized query vector.
    pub score: f32,
    pub text: String,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_content`](Store::insert_content) | Store a body and its chunks once per hash |
/// | [`upsert_document`](Store::upsert_document) | Insert or revive a `(collection, path)` row |
/// | [`deactivate_document`](Store::deactivate_document) | Soft delete and drop from the lexical index |
/// | [`index_document`](Store::index_document) | Upsert the lexical index entry |
/// | [`keyword_search`](Store::keyword_search) | Full-text search over active documents |
/// | [`vector_search`](Store::vector_search) | Dot-product search over stored chunk vectors |
/// | [`pending_chunks`](Store::pending_chunks) | Chunks lacking an embedding for a model |
/// | [`purge_inactive`](Store::purge_inactive) | Hard-delete expired documents and orphans |
/// | [`set_path_context`](Store::set_path_context) | Describe a collection or folder |
/// | [`rename_collection`](Store::rename_collection) | Move every row to a new collection name |
/// | [`cache_get`](Store::cache_get) | Read a cached provider response |
#[async_trait]
pub trait Store: Send + Sync {
    async fn content_exists(&self, hash: &str) -> Result<bool>;

    async fn get_content(&self, hash: &str) -> Result<Option<Content>>;

    /// Insert a content row and its chunks. A no-op if the hash already exists.
    async fn insert_content(&self, content: &Content, chunks: &[Chunk]) -> Result<()>;

    async fn get_chunks(&self, hash: &str) -> Result<Vec<Chunk>>;

    /// Look up a document by `(collection, path)` regardless of `active`.
    async fn get_document(&self, collection: &str, path: &str) -> Result<Option<Document>>;

    /// Active documents whose content hash starts with `prefix`.
    async fn find_by_docid(&self, prefix: &str) -> Result<Vec<Document>>;

    /// Active documents of one collection, ordered by path.
    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>>;

    /// Insert or update the row keyed by `(collection, path)`.
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    /// Mark the active document inactive and remove its lexical entry.
    ///
    /// Returns `false` when no active document matched.
    async fn deactivate_document(&self, collection: &str, path: &str, at: i64) -> Result<bool>;

    /// Point the lexical index entry for `doc` at its current title and body.
    async fn index_document(&self, doc: &Document, body: &str) -> Result<()>;

    /// Raw score direction of [`keyword_search`](Store::keyword_search).
    fn lexical_order(&self) -> ScoreOrder;

    /// Full-text search over active documents, best first.
    ///
    /// Returns [`QmdError::InvalidQuery`](crate::QmdError::InvalidQuery)
    /// when the backend cannot parse the rendered query.
    async fn keyword_search(
        &self,
        query: &FtsQuery,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<LexicalHit>>;

    /// Vector search over active documents, best first.
    ///
    /// Returns at most one hit per document, carrying its best-scoring
    /// chunk (the lowest `seq` on ties), and at most `limit` documents.
    /// Only embeddings produced by `model` are considered; chunks without
    /// one are simply absent.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>>;

    /// Distinct chunks of active documents with no embedding for `model`.
    async fn pending_chunks(&self, model: &str, filter: &SearchFilter) -> Result<Vec<PendingChunk>>;

    /// Store an embedding, replacing any previous vector for `(hash, seq)`.
    async fn upsert_embedding(&self, hash: &str, seq: usize, model: &str, vector: &[f32])
        -> Result<()>;

    /// Drop embeddings for content referenced by documents in `filter`.
    async fn clear_embeddings(&self, filter: &SearchFilter) -> Result<usize>;

    /// Hard-delete documents inactive since before `cutoff`, then content,
    /// chunks and embeddings no document references any more.
    ///
    /// With `dry_run` nothing changes and the report says what would go.
    async fn purge_inactive(
        &self,
        cutoff: i64,
        collection: Option<&str>,
        dry_run: bool,
    ) -> Result<CleanupReport>;

    /// Per-collection counts. `embedded_chunks` only counts vectors written
    /// by `model`; with `None` it is always zero.
    async fn stats(&self, model: Option<&str>) -> Result<Vec<CollectionStats>>;

    async fn content_count(&self) -> Result<i64>;

    /// Insert or replace the context for `(collection, path)`.
    async fn set_path_context(&self, context: &PathContext) -> Result<()>;

    /// Contexts ordered by collection then path; `None` lists every collection.
    async fn list_path_contexts(&self, collection: Option<&str>) -> Result<Vec<PathContext>>;

    /// Returns `false` when no context existed.
    async fn remove_path_context(&self, collection: &str, path: &str) -> Result<bool>;

    /// Move documents, lexical entries and contexts from `from` to `to`.
    ///
    /// Fails with [`QmdError::InvalidInput`](crate::QmdError::InvalidInput)
    /// when `to` already has documents. Returns the number of documents moved.
    async fn rename_collection(&self, from: &str, to: &str) -> Result<usize>;

    /// Hard-delete every document and context of `collection`. Content is
    /// left for [`purge_inactive`](Store::purge_inactive) to collect.
    async fn drop_collection(&self, collection: &str) -> Result<usize>;

    /// A cached response that has not expired at `now`.
    async fn cache_get(&self, key: &str, now: i64) -> Result<Option<String>>;

    /// Store a response; `expires_at` of `None` never expires.
    async fn cache_set(
        &self,
        key: &str,
        model: &str,
        response: &str,
        now: i64,
        expires_at: Option<i64>,
    ) -> Result<()>;

    /// Delete entries expired at `now`. With `dry_run` only count them.
    async fn purge_expired_cache(&self, now: i64, dry_run: bool) -> Result<usize>;
}
