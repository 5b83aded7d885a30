//! Vector (semantic) retrieval adapter.
//!
//! The query is embedded, L2-normalized and compared by dot product with
//! stored chunk vectors, which are normalized at write time. The store
//! returns one hit per document, carrying its best chunk.

use crate::embedding::{l2_normalize, EmbeddingProvider};
use crate::error::{QmdError, Result};
use crate::models::{docid, RankedList, SearchFilter, SearchResult};
use crate::store::Store;

pub struct VectorIndex<'a, S: Store + ?Sized> {
    store: &'a S,
    provider: Option<&'a dyn EmbeddingProvider>,
}

impl<'a, S: Store + ?Sized> VectorIndex<'a, S> {
    pub fn new(store: &'a S, provider: Option<&'a dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    fn provider(&self) -> Result<&'a dyn EmbeddingProvider> {
        self.provider.ok_or_else(|| {
            QmdError::NotReady(
                "no embedding provider configured; set [embedding] provider and run `qmd embed`"
                    .into(),
            )
        })
    }

    /// Embed `query` and search with the resulting vector.
    pub async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<RankedList> {
        let provider = self.provider()?;
        let vectors = provider.embed(&[query.to_string()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| QmdError::provider(provider.model_name(), "empty embedding response"))?;
        self.search_vector(vector, filter, limit).await
    }

    /// Search by a raw query vector. The vector is normalized here.
    pub async fn search_vector(
        &self,
        mut query_vec: Vec<f32>,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<RankedList> {
        let provider = self.provider()?;
        l2_normalize(&mut query_vec);

        let hits = self
            .store
            .vector_search(&query_vec, provider.model_name(), filter, limit)
            .await?;

        let results = hits
            .into_iter()
            .map(|hit| SearchResult {
                docid: docid(&hit.hash),
                collection: hit.collection,
                path: hit.path,
                title: hit.title,
                hash: hit.hash,
                score: f64::from(hit.score),
                snippet: hit.text,
                context: None,
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{content_hash, Chunk, Content, Document};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;

    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("cat") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
    }

    async fn put(store: &InMemoryStore, path: &str, chunks: &[&str], vectors: &[Option<[f32; 2]>]) {
        let body = chunks.concat();
        let hash = content_hash(&body);
        let content = Content {
            hash: hash.clone(),
            body: body.clone(),
            size: body.len(),
        };
        let rows: Vec<Chunk> = chunks
            .iter()
            .enumerate()
            .map(|(seq, t)| Chunk {
                hash: hash.clone(),
                seq,
                pos: 0,
                text: t.to_string(),
            })
            .collect();
        store.insert_content(&content, &rows).await.unwrap();
        store
            .upsert_document(&Document {
                collection: "notes".into(),
                path: path.into(),
                title: path.into(),
                hash: hash.clone(),
                active: true,
                created_at: 0,
                modified_at: 0,
                deactivated_at: None,
            })
            .await
            .unwrap();
        for (seq, v) in vectors.iter().enumerate() {
            if let Some(v) = v {
                store.upsert_embedding(&hash, seq, "axis", v).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_no_provider_is_not_ready() {
        let store = InMemoryStore::new();
        let err = VectorIndex::new(&store, None)
            .search("cats", &SearchFilter::all(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, QmdError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_best_chunk_per_document_and_missing_embeddings_skipped() {
        let store = InMemoryStore::new();
        put(&store, "cats.md", &["cat one", "dog two"], &[Some([1.0, 0.0]), Some([0.0, 1.0])]).await;
        put(&store, "dogs.md", &["dog"], &[Some([0.0, 1.0])]).await;
        put(&store, "raw.md", &["cat raw"], &[None]).await;

        let provider = AxisEmbedder;
        let results = VectorIndex::new(&store, Some(&provider))
            .search("cat", &SearchFilter::all(), 5)
            .await
            .unwrap();

        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["cats.md", "dogs.md"]);
        assert_eq!(results[0].snippet, "cat one");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_many_matching_chunks_do_not_crowd_out_documents() {
        let store = InMemoryStore::new();
        let cat = Some([1.0, 0.0]);
        put(&store, "a.md", &["cat 1", "cat 2", "cat 3", "cat 4", "cat 5"], &[cat; 5]).await;
        put(&store, "b.md", &["cat b"], &[Some([0.9, 0.1])]).await;
        put(&store, "c.md", &["cat c"], &[Some([0.8, 0.2])]).await;

        let provider = AxisEmbedder;
        let results = VectorIndex::new(&store, Some(&provider))
            .search("cat", &SearchFilter::all(), 3)
            .await
            .unwrap();

        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.md", "c.md"]);
        assert_eq!(results[0].snippet, "cat 1");
    }
}
