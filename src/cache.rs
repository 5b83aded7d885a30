//! Response cache for expansion and reranking.
//!
//! Both providers are deterministic for a given model and input, so their
//! answers are memoized in the store's `llm_cache` table. Keys are the
//! SHA-256 of `(kind, model, input)`; rerank scores are cached per
//! `(query, candidate)` so a shortlist that only partly overlaps a previous
//! one still reuses the known scores.
//!
//! A cache read or write failure never fails the request: the provider is
//! called as if the entry were missing.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use qmd_core::expand::QueryExpander;
use qmd_core::models::content_hash;
use qmd_core::rerank::RerankProvider;
use qmd_core::store::Store;
use qmd_core::{QmdError, Result};

use crate::config::CacheConfig;

/// Cache key for one provider call.
pub fn cache_key(kind: &str, model: &str, input: &str) -> String {
    content_hash(&format!("{kind}\0{model}\0{input}"))
}

fn expiry(now: i64, ttl_secs: Option<i64>) -> Option<i64> {
    ttl_secs.map(|ttl| now + ttl)
}

pub struct CachedExpander<S: Store + ?Sized> {
    inner: Box<dyn QueryExpander>,
    store: Arc<S>,
    ttl_secs: Option<i64>,
}

impl<S: Store + ?Sized> CachedExpander<S> {
    pub fn new(inner: Box<dyn QueryExpander>, store: Arc<S>, ttl_secs: Option<i64>) -> Self {
        Self {
            inner,
            store,
            ttl_secs,
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized + 'static> QueryExpander for CachedExpander<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>> {
        let model = self.inner.model_name();
        let key = cache_key("expand", model, query);
        let now = chrono::Utc::now().timestamp();

        match self.store.cache_get(&key, now).await {
            Ok(Some(cached)) => {
                debug!(model, "expansion cache hit");
                return Ok(cached.lines().map(str::to_string).collect());
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "expansion cache read failed"),
        }

        let variants = self.inner.expand(query).await?;
        let response = variants.join("\n");
        if let Err(e) = self
            .store
            .cache_set(&key, model, &response, now, expiry(now, self.ttl_secs))
            .await
        {
            warn!(error = %e, "expansion cache write failed");
        }
        Ok(variants)
    }
}

pub struct CachedReranker<S: Store + ?Sized> {
    inner: Box<dyn RerankProvider>,
    store: Arc<S>,
    ttl_secs: Option<i64>,
}

impl<S: Store + ?Sized> CachedReranker<S> {
    pub fn new(inner: Box<dyn RerankProvider>, store: Arc<S>, ttl_secs: Option<i64>) -> Self {
        Self {
            inner,
            store,
            ttl_secs,
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized + 'static> RerankProvider for CachedReranker<S> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>> {
        let model = self.inner.model_name();
        let now = chrono::Utc::now().timestamp();
        let keys: Vec<String> = candidates
            .iter()
            .map(|c| cache_key("rerank", model, &format!("{query}\0{c}")))
            .collect();

        let mut scores: Vec<Option<f64>> = Vec::with_capacity(keys.len());
        for key in &keys {
            let cached = match self.store.cache_get(key, now).await {
                Ok(hit) => hit.and_then(|v| v.parse::<f64>().ok()),
                Err(e) => {
                    warn!(error = %e, "rerank cache read failed");
                    None
                }
            };
            scores.push(cached);
        }

        let missing: Vec<usize> = (0..scores.len()).filter(|&i| scores[i].is_none()).collect();
        debug!(
            model,
            cached = scores.len() - missing.len(),
            missing = missing.len(),
            "rerank cache lookup"
        );
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| candidates[i].clone()).collect();
            let fresh = self.inner.rerank(query, &texts).await?;
            if fresh.len() != texts.len() {
                return Err(QmdError::provider(
                    model,
                    format!("expected {} scores, got {}", texts.len(), fresh.len()),
                ));
            }
            for (&i, score) in missing.iter().zip(fresh) {
                scores[i] = Some(score);
                let written = self
                    .store
                    .cache_set(&keys[i], model, &score.to_string(), now, expiry(now, self.ttl_secs))
                    .await;
                if let Err(e) = written {
                    warn!(error = %e, "rerank cache write failed");
                }
            }
        }

        Ok(scores.into_iter().map(|s| s.unwrap_or(0.0)).collect())
    }
}

/// Wrap `expander` in the cache when enabled. The built-in synonym table
/// is cheaper than a cache lookup and is never wrapped.
pub fn cached_expander<S: Store + ?Sized + 'static>(
    expander: Box<dyn QueryExpander>,
    store: Arc<S>,
    config: &CacheConfig,
) -> Box<dyn QueryExpander> {
    if !config.enabled || expander.name() == "synonyms" {
        return expander;
    }
    Box::new(CachedExpander::new(expander, store, config.ttl_secs()))
}

/// Wrap `reranker` in the cache when enabled.
pub fn cached_reranker<S: Store + ?Sized + 'static>(
    reranker: Box<dyn RerankProvider>,
    store: Arc<S>,
    config: &CacheConfig,
) -> Box<dyn RerankProvider> {
    if !config.enabled {
        return reranker;
    }
    Box::new(CachedReranker::new(reranker, store, config.ttl_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmd_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scores a candidate by its length and records every batch it sees.
    #[derive(Default, Clone)]
    struct Counting {
        batches: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl RerankProvider for Counting {
        fn model_name(&self) -> &str {
            "counting"
        }
        async fn rerank(&self, _query: &str, candidates: &[String]) -> Result<Vec<f64>> {
            if let Ok(mut batches) = self.batches.lock() {
                batches.push(candidates.to_vec());
            }
            Ok(candidates.iter().map(|c| c.len() as f64 / 10.0).collect())
        }
    }

    #[derive(Default, Clone)]
    struct Echo {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl QueryExpander for Echo {
        fn name(&self) -> &str {
            "llm"
        }
        fn model_name(&self) -> &str {
            "echo-1"
        }
        async fn expand(&self, query: &str) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![format!("{query} guide"), format!("{query} howto")])
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cache_key_separates_kind_model_and_input() {
        let base = cache_key("rerank", "m", "q");
        assert_eq!(base, cache_key("rerank", "m", "q"));
        assert_ne!(base, cache_key("expand", "m", "q"));
        assert_ne!(base, cache_key("rerank", "m2", "q"));
        assert_ne!(base, cache_key("rerank", "m", "q2"));
    }

    #[tokio::test]
    async fn test_reranker_only_scores_cache_misses() {
        let store = Arc::new(InMemoryStore::new());
        let counting = Counting::default();
        let cached = CachedReranker::new(Box::new(counting.clone()), store, None);

        let first = cached.rerank("q", &strings(&["aa", "bbbb"])).await.unwrap();
        assert_eq!(first, vec![0.2, 0.4]);
        let second = cached.rerank("q", &strings(&["bbbb", "cccccc"])).await.unwrap();
        assert_eq!(second, vec![0.4, 0.6]);

        let batches = counting.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1], strings(&["cccccc"]));
    }

    #[tokio::test]
    async fn test_reranker_cache_is_per_query() {
        let store = Arc::new(InMemoryStore::new());
        let counting = Counting::default();
        let cached = CachedReranker::new(Box::new(counting.clone()), store, None);

        cached.rerank("q1", &strings(&["aa"])).await.unwrap();
        cached.rerank("q2", &strings(&["aa"])).await.unwrap();
        assert_eq!(counting.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expander_reuses_cached_variants() {
        let store = Arc::new(InMemoryStore::new());
        let echo = Echo::default();
        let cached = CachedExpander::new(Box::new(echo.clone()), store, Some(3600));

        let first = cached.expand("deploy").await.unwrap();
        let second = cached.expand("deploy").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, strings(&["deploy guide", "deploy howto"]));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

        cached.expand("rollback").await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disabled_cache_leaves_providers_unwrapped() {
        let store = Arc::new(InMemoryStore::new());
        let config = CacheConfig {
            enabled: false,
            ttl_days: 7,
        };
        let echo = Echo::default();
        let expander = cached_expander(Box::new(echo), store, &config);
        assert_eq!(expander.model_name(), "echo-1");
    }
}
