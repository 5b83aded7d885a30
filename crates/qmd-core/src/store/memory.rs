//! In-memory [`Store`] implementation for tests and ephemeral indexes.
//!
//! All state sits behind a single `RwLock` so multi-table updates are
//! atomic. Keyword search scores by term frequency (higher is better);
//! vector search is a brute-force dot product over stored vectors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::dot;
use crate::error::{QmdError, Result};
use crate::models::{
    Chunk, CleanupReport, CollectionStats, Content, Document, PathContext, PendingChunk,
    SearchFilter,
};

use super::{FtsQuery, LexicalHit, ScoreOrder, Store, VectorHit};

const SNIPPET_CHARS: usize = 160;

type DocKey = (String, String);

struct StoredVector {
    model: String,
    vector: Vec<f32>,
}

struct CachedResponse {
    response: String,
    expires_at: Option<i64>,
}

impl CachedResponse {
    fn expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    contents: HashMap<String, Content>,
    chunks: HashMap<String, Vec<Chunk>>,
    documents: BTreeMap<DocKey, Document>,
    /// Lexical entries: title and body per `(collection, path)`.
    lexical: BTreeMap<DocKey, (String, String)>,
    embeddings: HashMap<(String, usize), StoredVector>,
    contexts: BTreeMap<DocKey, PathContext>,
    cache: HashMap<String, CachedResponse>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| QmdError::storage("in-memory store", "lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| QmdError::storage("in-memory store", "lock poisoned"))
    }
}

fn key(collection: &str, path: &str) -> DocKey {
    (collection.to_string(), path.to_string())
}

/// Count case-insensitive occurrences of `needle` in `haystack` (both lowercased by caller).
fn occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

/// Up to [`SNIPPET_CHARS`] characters of `body` starting near the first match of `needle`.
fn snippet(body: &str, needle: &str) -> String {
    let lower = body.to_lowercase();
    // Lowercasing can change byte lengths, so only trust the offset when it maps back.
    let start = lower
        .find(needle)
        .filter(|&i| lower.len() == body.len() && body.is_char_boundary(i))
        .unwrap_or(0);
    body[start..].chars().take(SNIPPET_CHARS).collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn content_exists(&self, hash: &str) -> Result<bool> {
        Ok(self.read()?.contents.contains_key(hash))
    }

    async fn get_content(&self, hash: &str) -> Result<Option<Content>> {
        Ok(self.read()?.contents.get(hash).cloned())
    }

    async fn insert_content(&self, content: &Content, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.write()?;
        if inner.contents.contains_key(&content.hash) {
            return Ok(());
        }
        inner.contents.insert(content.hash.clone(), content.clone());
        inner.chunks.insert(content.hash.clone(), chunks.to_vec());
        Ok(())
    }

    async fn get_chunks(&self, hash: &str) -> Result<Vec<Chunk>> {
        Ok(self.read()?.chunks.get(hash).cloned().unwrap_or_default())
    }

    async fn get_document(&self, collection: &str, path: &str) -> Result<Option<Document>> {
        Ok(self.read()?.documents.get(&key(collection, path)).cloned())
    }

    async fn find_by_docid(&self, prefix: &str) -> Result<Vec<Document>> {
        let inner = self.read()?;
        Ok(inner
            .documents
            .values()
            .filter(|d| d.active && d.hash.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>> {
        let inner = self.read()?;
        Ok(inner
            .documents
            .values()
            .filter(|d| d.active && d.collection == collection)
            .cloned()
            .collect())
    }

    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut inner = self.write()?;
        let entry = inner
            .documents
            .entry(key(&doc.collection, &doc.path))
            .or_insert_with(|| doc.clone());
        let created_at = entry.created_at;
        *entry = doc.clone();
        entry.created_at = created_at;
        Ok(())
    }

    async fn deactivate_document(&self, collection: &str, path: &str, at: i64) -> Result<bool> {
        let mut inner = self.write()?;
        let k = key(collection, path);
        let changed = match inner.documents.get_mut(&k) {
            Some(doc) if doc.active => {
                doc.active = false;
                doc.deactivated_at = Some(at);
                true
            }
            _ => false,
        };
        if changed {
            inner.lexical.remove(&k);
        }
        Ok(changed)
    }

    async fn index_document(&self, doc: &Document, body: &str) -> Result<()> {
        let mut inner = self.write()?;
        inner.lexical.insert(
            key(&doc.collection, &doc.path),
            (doc.title.clone(), body.to_string()),
        );
        Ok(())
    }

    fn lexical_order(&self) -> ScoreOrder {
        ScoreOrder::HigherIsBetter
    }

    async fn keyword_search(
        &self,
        query: &FtsQuery,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<LexicalHit>> {
        let needles: Vec<String> = match query {
            FtsQuery::Terms(terms) if terms.is_empty() => {
                return Err(QmdError::InvalidQuery("empty term list".into()));
            }
            FtsQuery::Terms(terms) => terms.iter().map(|t| t.to_lowercase()).collect(),
            FtsQuery::Phrase(phrase) if phrase.trim().is_empty() => return Ok(Vec::new()),
            FtsQuery::Phrase(phrase) => vec![phrase.trim().to_lowercase()],
        };

        let inner = self.read()?;
        let mut hits = Vec::new();

        for ((collection, path), (title, body)) in &inner.lexical {
            if !filter.allows(collection) {
                continue;
            }
            let Some(doc) = inner.documents.get(&key(collection, path)) else {
                continue;
            };
            if !doc.active {
                continue;
            }

            let haystack = format!("{}\n{}", title, body).to_lowercase();
            let counts: Vec<usize> = needles.iter().map(|n| occurrences(&haystack, n)).collect();
            if counts.iter().any(|&c| c == 0) {
                continue;
            }

            hits.push(LexicalHit {
                collection: collection.clone(),
                path: path.clone(),
                title: title.clone(),
                hash: doc.hash.clone(),
                raw_score: counts.iter().sum::<usize>() as f64,
                snippet: snippet(body, &needles[0]),
            });
        }

        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let inner = self.read()?;
        let mut hits = Vec::new();

        for doc in inner.documents.values() {
            if !doc.active || !filter.allows(&doc.collection) {
                continue;
            }
            let mut best: Option<(&Chunk, f32)> = None;
            for chunk in inner.chunks.get(&doc.hash).into_iter().flatten() {
                let Some(stored) = inner.embeddings.get(&(chunk.hash.clone(), chunk.seq)) else {
                    continue;
                };
                if stored.model != model {
                    continue;
                }
                let score = dot(query_vec, &stored.vector);
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((chunk, score));
                }
            }
            if let Some((chunk, score)) = best {
                hits.push(VectorHit {
                    collection: doc.collection.clone(),
                    path: doc.path.clone(),
                    title: doc.title.clone(),
                    hash: doc.hash.clone(),
                    seq: chunk.seq,
                    score,
                    text: chunk.text.clone(),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn pending_chunks(&self, model: &str, filter: &SearchFilter) -> Result<Vec<PendingChunk>> {
        let inner = self.read()?;
        let mut titles: BTreeMap<&str, &str> = BTreeMap::new();
        for doc in inner.documents.values() {
            if doc.active && filter.allows(&doc.collection) {
                titles.entry(doc.hash.as_str()).or_insert(doc.title.as_str());
            }
        }

        let mut pending = Vec::new();
        for (hash, title) in titles {
            for chunk in inner.chunks.get(hash).into_iter().flatten() {
                let done = inner
                    .embeddings
                    .get(&(chunk.hash.clone(), chunk.seq))
                    .is_some_and(|v| v.model == model);
                if !done {
                    pending.push(PendingChunk {
                        hash: chunk.hash.clone(),
                        seq: chunk.seq,
                        title: title.to_string(),
                        text: chunk.text.clone(),
                    });
                }
            }
        }
        Ok(pending)
    }

    async fn upsert_embedding(
        &self,
        hash: &str,
        seq: usize,
        model: &str,
        vector: &[f32],
    ) -> Result<()> {
        let mut inner = self.write()?;
        inner.embeddings.insert(
            (hash.to_string(), seq),
            StoredVector {
                model: model.to_string(),
                vector: vector.to_vec(),
            },
        );
        Ok(())
    }

    async fn clear_embeddings(&self, filter: &SearchFilter) -> Result<usize> {
        let mut inner = self.write()?;
        let hashes: BTreeSet<String> = inner
            .documents
            .values()
            .filter(|d| filter.allows(&d.collection))
            .map(|d| d.hash.clone())
            .collect();
        let before = inner.embeddings.len();
        inner.embeddings.retain(|(hash, _), _| !hashes.contains(hash));
        Ok(before - inner.embeddings.len())
    }

    async fn purge_inactive(
        &self,
        cutoff: i64,
        collection: Option<&str>,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        let mut inner = self.write()?;

        let expired: Vec<DocKey> = inner
            .documents
            .iter()
            .filter(|(_, d)| {
                !d.active
                    && d.deactivated_at.unwrap_or(d.modified_at) <= cutoff
                    && collection.map_or(true, |c| c == d.collection)
            })
            .map(|(k, _)| k.clone())
            .collect();

        let referenced: BTreeSet<&str> = inner
            .documents
            .iter()
            .filter(|(k, _)| !expired.contains(k))
            .map(|(_, d)| d.hash.as_str())
            .collect();
        let orphans: Vec<String> = inner
            .contents
            .keys()
            .filter(|h| !referenced.contains(h.as_str()))
            .cloned()
            .collect();

        let report = CleanupReport {
            documents: expired.len(),
            contents: orphans.len(),
            chunks: orphans
                .iter()
                .map(|h| inner.chunks.get(h).map_or(0, Vec::len))
                .sum(),
            embeddings: inner
                .embeddings
                .keys()
                .filter(|(h, _)| orphans.contains(h))
                .count(),
            ..Default::default()
        };

        if !dry_run {
            for k in &expired {
                inner.documents.remove(k);
                inner.lexical.remove(k);
            }
            for h in &orphans {
                inner.contents.remove(h);
                inner.chunks.remove(h);
            }
            inner.embeddings.retain(|(h, _), _| !orphans.contains(h));
        }

        Ok(report)
    }

    async fn stats(&self, model: Option<&str>) -> Result<Vec<CollectionStats>> {
        let inner = self.read()?;
        let mut by_collection: BTreeMap<String, CollectionStats> = BTreeMap::new();
        for doc in inner.documents.values() {
            let entry = by_collection
                .entry(doc.collection.clone())
                .or_insert_with(|| CollectionStats {
                    collection: doc.collection.clone(),
                    ..Default::default()
                });
            if !doc.active {
                entry.inactive_documents += 1;
                continue;
            }
            entry.active_documents += 1;
            for chunk in inner.chunks.get(&doc.hash).into_iter().flatten() {
                entry.chunks += 1;
                let embedded = inner
                    .embeddings
                    .get(&(chunk.hash.clone(), chunk.seq))
                    .is_some_and(|v| Some(v.model.as_str()) == model);
                if embedded {
                    entry.embedded_chunks += 1;
                }
            }
        }
        Ok(by_collection.into_values().collect())
    }

    async fn content_count(&self) -> Result<i64> {
        Ok(self.read()?.contents.len() as i64)
    }

    async fn set_path_context(&self, context: &PathContext) -> Result<()> {
        let mut inner = self.write()?;
        inner.contexts.insert(
            key(&context.collection, &context.path),
            context.clone(),
        );
        Ok(())
    }

    async fn list_path_contexts(&self, collection: Option<&str>) -> Result<Vec<PathContext>> {
        let inner = self.read()?;
        Ok(inner
            .contexts
            .values()
            .filter(|c| collection.map_or(true, |name| name == c.collection))
            .cloned()
            .collect())
    }

    async fn remove_path_context(&self, collection: &str, path: &str) -> Result<bool> {
        Ok(self.write()?.contexts.remove(&key(collection, path)).is_some())
    }

    async fn rename_collection(&self, from: &str, to: &str) -> Result<usize> {
        let mut inner = self.write()?;
        if inner.documents.keys().any(|(c, _)| c == to) {
            return Err(QmdError::InvalidInput(format!(
                "collection '{to}' already has documents"
            )));
        }

        let moved: Vec<DocKey> = inner
            .documents
            .keys()
            .filter(|(c, _)| c == from)
            .cloned()
            .collect();
        for k in &moved {
            if let Some(mut doc) = inner.documents.remove(k) {
                doc.collection = to.to_string();
                inner.documents.insert(key(to, &k.1), doc);
            }
            if let Some(entry) = inner.lexical.remove(k) {
                inner.lexical.insert(key(to, &k.1), entry);
            }
        }

        let contexts: Vec<DocKey> = inner
            .contexts
            .keys()
            .filter(|(c, _)| c == from)
            .cloned()
            .collect();
        for k in contexts {
            if let Some(mut ctx) = inner.contexts.remove(&k) {
                ctx.collection = to.to_string();
                inner.contexts.insert(key(to, &k.1), ctx);
            }
        }
        Ok(moved.len())
    }

    async fn drop_collection(&self, collection: &str) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.documents.len();
        inner.documents.retain(|(c, _), _| c != collection);
        inner.lexical.retain(|(c, _), _| c != collection);
        inner.contexts.retain(|(c, _), _| c != collection);
        Ok(before - inner.documents.len())
    }

    async fn cache_get(&self, key: &str, now: i64) -> Result<Option<String>> {
        let inner = self.read()?;
        Ok(inner
            .cache
            .get(key)
            .filter(|entry| !entry.expired(now))
            .map(|entry| entry.response.clone()))
    }

    async fn cache_set(
        &self,
        key: &str,
        _model: &str,
        response: &str,
        _now: i64,
        expires_at: Option<i64>,
    ) -> Result<()> {
        self.write()?.cache.insert(
            key.to_string(),
            CachedResponse {
                response: response.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn purge_expired_cache(&self, now: i64, dry_run: bool) -> Result<usize> {
        let mut inner = self.write()?;
        let expired = inner.cache.values().filter(|e| e.expired(now)).count();
        if !dry_run {
            inner.cache.retain(|_, e| !e.expired(now));
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::content_hash;

    fn doc(collection: &str, path: &str, body: &str) -> (Document, Content) {
        let hash = content_hash(body);
        (
            Document {
                collection: collection.into(),
                path: path.into(),
                title: path.into(),
                hash: hash.clone(),
                active: true,
                created_at: 100,
                modified_at: 100,
                deactivated_at: None,
            },
            Content {
                hash,
                body: body.into(),
                size: body.len(),
            },
        )
    }

    async fn put(store: &InMemoryStore, collection: &str, path: &str, body: &str) -> Document {
        let (d, c) = doc(collection, path, body);
        let chunk = Chunk {
            hash: c.hash.clone(),
            seq: 0,
            pos: 0,
            text: body.into(),
        };
        store.insert_content(&c, &[chunk]).await.unwrap();
        store.upsert_document(&d).await.unwrap();
        store.index_document(&d, body).await.unwrap();
        d
    }

    #[tokio::test]
    async fn test_keyword_search_requires_all_terms() {
        let store = InMemoryStore::new();
        put(&store, "notes", "a.md", "rust cargo rust").await;
        put(&store, "notes", "b.md", "rust only").await;

        let q = FtsQuery::Terms(vec!["rust".into(), "cargo".into()]);
        let hits = store.keyword_search(&q, &SearchFilter::all(), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.md");
        assert_eq!(hits[0].raw_score, 3.0);
    }

    #[tokio::test]
    async fn test_empty_terms_is_invalid_query() {
        let store = InMemoryStore::new();
        let err = store
            .keyword_search(&FtsQuery::Terms(vec![]), &SearchFilter::all(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, QmdError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_deactivate_hides_from_keyword_search() {
        let store = InMemoryStore::new();
        put(&store, "notes", "a.md", "deploy guide").await;
        assert!(store.deactivate_document("notes", "a.md", 200).await.unwrap());
        assert!(!store.deactivate_document("notes", "a.md", 201).await.unwrap());

        let q = FtsQuery::Terms(vec!["deploy".into()]);
        let hits = store.keyword_search(&q, &SearchFilter::all(), 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_purge_keeps_shared_content() {
        let store = InMemoryStore::new();
        put(&store, "notes", "a.md", "same body").await;
        put(&store, "notes", "b.md", "same body").await;
        store.deactivate_document("notes", "a.md", 50).await.unwrap();

        let report = store.purge_inactive(100, None, false).await.unwrap();
        assert_eq!(report.documents, 1);
        assert_eq!(report.contents, 0);
        assert_eq!(store.content_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_count_only_the_given_model() {
        let store = InMemoryStore::new();
        let d = put(&store, "notes", "a.md", "alpha").await;
        store.upsert_embedding(&d.hash, 0, "model-a", &[1.0]).await.unwrap();

        let embedded = |stats: Vec<CollectionStats>| stats[0].embedded_chunks;
        assert_eq!(embedded(store.stats(Some("model-a")).await.unwrap()), 1);
        assert_eq!(embedded(store.stats(Some("model-b")).await.unwrap()), 0);
        assert_eq!(embedded(store.stats(None).await.unwrap()), 0);
    }

    #[tokio::test]
    async fn test_rename_collection_moves_documents_and_contexts() {
        let store = InMemoryStore::new();
        put(&store, "notes", "a.md", "alpha").await;
        put(&store, "docs", "b.md", "beta").await;
        store
            .set_path_context(&PathContext {
                collection: "notes".into(),
                path: String::new(),
                description: "personal notes".into(),
                updated_at: 1,
            })
            .await
            .unwrap();

        assert!(matches!(
            store.rename_collection("notes", "docs").await,
            Err(QmdError::InvalidInput(_))
        ));
        assert_eq!(store.rename_collection("notes", "journal").await.unwrap(), 1);

        assert!(store.get_document("notes", "a.md").await.unwrap().is_none());
        assert!(store.get_document("journal", "a.md").await.unwrap().is_some());
        let q = FtsQuery::Terms(vec!["alpha".into()]);
        let hits = store.keyword_search(&q, &SearchFilter::all(), 10).await.unwrap();
        assert_eq!(hits[0].collection, "journal");
        let contexts = store.list_path_contexts(Some("journal")).await.unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].collection, "journal");
    }

    #[tokio::test]
    async fn test_cache_respects_expiry() {
        let store = InMemoryStore::new();
        store.cache_set("k1", "m", "fresh", 0, Some(100)).await.unwrap();
        store.cache_set("k2", "m", "forever", 0, None).await.unwrap();

        assert_eq!(store.cache_get("k1", 50).await.unwrap().as_deref(), Some("fresh"));
        assert_eq!(store.cache_get("k1", 100).await.unwrap(), None);
        assert_eq!(store.purge_expired_cache(100, true).await.unwrap(), 1);
        assert_eq!(store.purge_expired_cache(100, false).await.unwrap(), 1);
        assert_eq!(store.purge_expired_cache(100, false).await.unwrap(), 0);
        assert_eq!(store.cache_get("k2", i64::MAX).await.unwrap().as_deref(), Some("forever"));
    }
}
