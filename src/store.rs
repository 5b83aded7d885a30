//! Runtime-selected storage backend.
//!
//! Commands hold an [`AnyStore`] so the backend chosen in `[storage]` can be
//! passed to generic code without boxing every call.

use async_trait::async_trait;

use qmd_core::models::{
    Chunk, CleanupReport, CollectionStats, Content, Document, PathContext, PendingChunk,
    SearchFilter,
};
use qmd_core::store::memory::InMemoryStore;
use qmd_core::store::{FtsQuery, LexicalHit, ScoreOrder, Store, VectorHit};
use qmd_core::Result;

use crate::sqlite_store::SqliteStore;

pub enum AnyStore {
    Sqlite(SqliteStore),
    Memory(InMemoryStore),
}

macro_rules! delegate {
    ($self:ident, $s:ident => $call:expr) => {
        match $self {
            AnyStore::Sqlite($s) => $call,
            AnyStore::Memory($s) => $call,
        }
    };
}

#[async_trait]
impl Store for AnyStore {
    async fn content_exists(&self, hash: &str) -> Result<bool> {
        delegate!(self, s => s.content_exists(hash).await)
    }

    async fn get_content(&self, hash: &str) -> Result<Option<Content>> {
        delegate!(self, s => s.get_content(hash).await)
    }

    async fn insert_content(&self, content: &Content, chunks: &[Chunk]) -> Result<()> {
        delegate!(self, s => s.insert_content(content, chunks).await)
    }

    async fn get_chunks(&self, hash: &str) -> Result<Vec<Chunk>> {
        delegate!(self, s => s.get_chunks(hash).await)
    }

    async fn get_document(&self, collection: &str, path: &str) -> Result<Option<Document>> {
        delegate!(self, s => s.get_document(collection, path).await)
    }

    async fn find_by_docid(&self, prefix: &str) -> Result<Vec<Document>> {
        delegate!(self, s => s.find_by_docid(prefix).await)
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        delegate!(self, s => s.list_documents(collection).await)
    }

    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        delegate!(self, s => s.upsert_document(doc).await)
    }

    async fn deactivate_document(&self, collection: &str, path: &str, at: i64) -> Result<bool> {
        delegate!(self, s => s.deactivate_document(collection, path, at).await)
    }

    async fn index_document(&self, doc: &Document, body: &str) -> Result<()> {
        delegate!(self, s => s.index_document(doc, body).await)
    }

    fn lexical_order(&self) -> ScoreOrder {
        delegate!(self, s => s.lexical_order())
    }

    async fn keyword_search(
        &self,
        query: &FtsQuery,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<LexicalHit>> {
        delegate!(self, s => s.keyword_search(query, filter, limit).await)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        delegate!(self, s => s.vector_search(query_vec, model, filter, limit).await)
    }

    async fn pending_chunks(&self, model: &str, filter: &SearchFilter) -> Result<Vec<PendingChunk>> {
        delegate!(self, s => s.pending_chunks(model, filter).await)
    }

    async fn upsert_embedding(
        &self,
        hash: &str,
        seq: usize,
        model: &str,
        vector: &[f32],
    ) -> Result<()> {
        delegate!(self, s => s.upsert_embedding(hash, seq, model, vector).await)
    }

    async fn clear_embeddings(&self, filter: &SearchFilter) -> Result<usize> {
        delegate!(self, s => s.clear_embeddings(filter).await)
    }

    async fn purge_inactive(
        &self,
        cutoff: i64,
        collection: Option<&str>,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        delegate!(self, s => s.purge_inactive(cutoff, collection, dry_run).await)
    }

    async fn stats(&self, model: Option<&str>) -> Result<Vec<CollectionStats>> {
        delegate!(self, s => s.stats(model).await)
    }

    async fn content_count(&self) -> Result<i64> {
        delegate!(self, s => s.content_count().await)
    }

    async fn set_path_context(&self, context: &PathContext) -> Result<()> {
        delegate!(self, s => s.set_path_context(context).await)
    }

    async fn list_path_contexts(&self, collection: Option<&str>) -> Result<Vec<PathContext>> {
        delegate!(self, s => s.list_path_contexts(collection).await)
    }

    async fn remove_path_context(&self, collection: &str, path: &str) -> Result<bool> {
        delegate!(self, s => s.remove_path_context(collection, path).await)
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<usize> {
        delegate!(self, s => s.rename_collection(from, to).await)
    }

    async fn drop_collection(&self, collection: &str) -> Result<usize> {
        delegate!(self, s => s.drop_collection(collection).await)
    }

    async fn cache_get(&self, key: &str, now: i64) -> Result<Option<String>> {
        delegate!(self, s => s.cache_get(key, now).await)
    }

    async fn cache_set(
        &self,
        key: &str,
        model: &str,
        response: &str,
        now: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        delegate!(self, s => s.cache_set(key, model, response, now, expires_at).await)
    }

    async fn purge_expired_cache(&self, now: i64, dry_run: bool) -> Result<usize> {
        delegate!(self, s => s.purge_expired_cache(now, dry_run).await)
    }
}
