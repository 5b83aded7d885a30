//! Query pipeline: `search`, `vsearch` and `query`.
//!
//! `query` runs `RECEIVED → EXPANDED → RETRIEVED → FUSED → [RERANKED]`:
//! the query is expanded into variants, every variant × method branch runs
//! concurrently under a timeout, the surviving lists are fused with weighted
//! RRF, and the top of the fused list is optionally reranked.
//!
//! Before printing, each result picks up the description of the most
//! specific path context covering it.

use anyhow::{bail, Result};
use futures::future::{join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use qmd_core::embedding::EmbeddingProvider;
use qmd_core::expand::{expand_query, QueryExpander};
use qmd_core::fusion::{reciprocal_rank_fusion, WeightedList};
use qmd_core::lexical::LexicalIndex;
use qmd_core::models::{most_specific_context, RankedList, SearchFilter};
use qmd_core::rerank::{rerank_fused, RerankProvider};
use qmd_core::store::Store;
use qmd_core::vector::VectorIndex;
use qmd_core::QmdError;

use crate::config::{Config, RetrievalConfig};
use crate::{cache, db, embedding, expansion, rerank};

/// Characters of the best chunk shown as a text-mode excerpt.
const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Lexical only.
    Search,
    /// Vector only.
    VSearch,
    /// Expanded hybrid retrieval with fusion and optional reranking.
    Query,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub filter: SearchFilter,
    pub min_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Lexical,
    Vector,
}

pub struct QueryEngine<S: Store> {
    store: Arc<S>,
    embedder: Option<Box<dyn EmbeddingProvider>>,
    reranker: Option<Box<dyn RerankProvider>>,
    expander: Option<Box<dyn QueryExpander>>,
    retrieval: RetrievalConfig,
    rerank_top_k: usize,
}

impl<S: Store> QueryEngine<S> {
    pub fn new(store: Arc<S>, retrieval: RetrievalConfig) -> Self {
        Self {
            store,
            embedder: None,
            reranker: None,
            expander: None,
            retrieval,
            rerank_top_k: qmd_core::rerank::DEFAULT_RERANK_TOP_K,
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Box<dyn EmbeddingProvider>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_reranker(mut self, reranker: Option<Box<dyn RerankProvider>>, top_k: usize) -> Self {
        self.reranker = reranker;
        self.rerank_top_k = top_k;
        self
    }

    pub fn with_expander(mut self, expander: Option<Box<dyn QueryExpander>>) -> Self {
        self.expander = expander;
        self
    }

    fn embedder(&self) -> Option<&dyn EmbeddingProvider> {
        self.embedder.as_deref()
    }

    /// Lexical search, best first.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<RankedList> {
        if query.trim().is_empty() {
            return Ok(RankedList::new());
        }
        let results = LexicalIndex::new(self.store.as_ref())
            .search(query, &options.filter, options.limit)
            .await?;
        Ok(finish(results, options))
    }

    /// Vector search. Fails with [`QmdError::NotReady`] when no embedder is
    /// configured or nothing has been embedded yet; never falls back to
    /// lexical results.
    pub async fn vsearch(&self, query: &str, options: &SearchOptions) -> Result<RankedList> {
        let Some(embedder) = self.embedder() else {
            return Err(QmdError::NotReady(
                "vector search needs an embedding provider; set [embedding] provider in config"
                    .into(),
            )
            .into());
        };

        let embedded: i64 = self
            .store
            .stats(Some(embedder.model_name()))
            .await?
            .iter()
            .filter(|s| options.filter.allows(&s.collection))
            .map(|s| s.embedded_chunks)
            .sum();
        if embedded == 0 {
            return Err(QmdError::NotReady(format!(
                "no embeddings for model '{}' yet; run `qmd embed`",
                embedder.model_name()
            ))
            .into());
        }

        if query.trim().is_empty() {
            return Ok(RankedList::new());
        }
        let results = VectorIndex::new(self.store.as_ref(), Some(embedder))
            .search(query, &options.filter, options.limit)
            .await?;
        Ok(finish(results, options))
    }

    /// Hybrid search: expand, retrieve in parallel, fuse, rerank.
    pub async fn query(&self, query: &str, options: &SearchOptions) -> Result<RankedList> {
        if query.trim().is_empty() {
            return Ok(RankedList::new());
        }

        let variants = expand_query(
            self.expander.as_deref(),
            query,
            self.retrieval.max_variants,
        )
        .await;

        let fusion = self.retrieval.fusion();
        let mut methods = vec![Method::Lexical];
        if self.embedder.is_some() {
            methods.push(Method::Vector);
        }

        let mut weights = Vec::new();
        let mut branches: Vec<BoxFuture<'_, (Method, usize, Result<RankedList>)>> = Vec::new();
        for (idx, variant) in variants.iter().enumerate() {
            for &method in &methods {
                weights.push(fusion.weight_for_variant(idx));
                branches.push(self.branch(method, idx, variant, &options.filter).boxed());
            }
        }

        let outcomes = join_all(branches).await;

        let mut lists = Vec::new();
        let mut last_err = None;
        for ((method, idx, outcome), weight) in outcomes.into_iter().zip(weights) {
            match outcome {
                Ok(results) => {
                    debug!(?method, variant = idx, hits = results.len(), "branch done");
                    lists.push(WeightedList::new(results, weight));
                }
                Err(e) => {
                    warn!(?method, variant = idx, error = %format!("{e:#}"), "retrieval branch dropped");
                    last_err = Some(e);
                }
            }
        }

        if lists.is_empty() {
            match last_err {
                Some(e) => return Err(e.context("every retrieval branch failed")),
                None => bail!("no retrieval branch ran"),
            }
        }

        let fused = reciprocal_rank_fusion(&lists, fusion.k);
        let ranked = rerank_fused(self.reranker.as_deref(), query, fused, self.rerank_top_k).await;
        Ok(finish(ranked, options))
    }

    /// Fill in `context` from the store's path contexts.
    pub async fn attach_contexts(&self, results: &mut RankedList) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let contexts = self.store.list_path_contexts(None).await?;
        for result in results.iter_mut() {
            result.context = most_specific_context(&contexts, &result.collection, &result.path)
                .map(|c| c.description.clone());
        }
        Ok(())
    }

    async fn branch(
        &self,
        method: Method,
        idx: usize,
        variant: &str,
        filter: &SearchFilter,
    ) -> (Method, usize, Result<RankedList>) {
        let limit = self.retrieval.candidate_k;
        let store = self.store.as_ref();
        let timeout = Duration::from_millis(self.retrieval.branch_timeout_ms);

        let run = async {
            match method {
                Method::Lexical => LexicalIndex::new(store).search(variant, filter, limit).await,
                Method::Vector => {
                    VectorIndex::new(store, self.embedder())
                        .search(variant, filter, limit)
                        .await
                }
            }
        };

        let result = match tokio::time::timeout(timeout, run).await {
            Ok(r) => r.map_err(anyhow::Error::from),
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
        };
        (method, idx, result)
    }
}

/// Apply the score floor and result limit.
fn finish(mut results: RankedList, options: &SearchOptions) -> RankedList {
    results.retain(|r| r.score >= options.min_score);
    results.truncate(options.limit);
    results
}

/// First `max` characters of `text` on one line, with an ellipsis when cut.
fn excerpt(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let cut: String = flat.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}

/// Build an engine with the providers `mode` needs.
///
/// `query` treats provider construction failures as "not configured" and
/// degrades; `vsearch` surfaces them. Expansion and rerank responses go
/// through the store's response cache when `[cache]` is enabled.
pub fn build_engine<S: Store + 'static>(
    store: Arc<S>,
    config: &Config,
    mode: SearchMode,
) -> Result<QueryEngine<S>> {
    let engine = QueryEngine::new(store.clone(), config.retrieval.clone());
    match mode {
        SearchMode::Search => Ok(engine),
        SearchMode::VSearch => {
            Ok(engine.with_embedder(embedding::create_provider(&config.embedding)?))
        }
        SearchMode::Query => {
            let embedder = embedding::create_provider(&config.embedding).unwrap_or_else(|e| {
                warn!(error = %e, "embedding provider unavailable, lexical only");
                None
            });
            let reranker = rerank::create_reranker(&config.rerank)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "reranker unavailable, skipping rerank");
                    None
                })
                .map(|r| cache::cached_reranker(r, store.clone(), &config.cache));
            let expander = expansion::create_expander(&config.expansion)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "query expander unavailable");
                    None
                })
                .map(|x| cache::cached_expander(x, store.clone(), &config.cache));
            Ok(engine
                .with_embedder(embedder)
                .with_reranker(reranker, config.rerank.top_k)
                .with_expander(expander))
        }
    }
}

pub async fn run_search(
    config: &Config,
    mode: SearchMode,
    query: &str,
    collection: Option<String>,
    limit: Option<usize>,
    min_score: Option<f64>,
    json: bool,
) -> Result<()> {
    let filter = match collection {
        Some(name) => {
            if config.collection(&name).is_none() {
                bail!("unknown collection: '{}'", name);
            }
            SearchFilter::collection(name)
        }
        None => SearchFilter::all(),
    };
    let options = SearchOptions {
        limit: limit.unwrap_or(config.retrieval.final_limit).max(1),
        filter,
        min_score: min_score.unwrap_or(config.retrieval.min_score),
    };

    let store = Arc::new(db::open_store(config).await?);
    let engine = build_engine(store, config, mode)?;
    let mut results = match mode {
        SearchMode::Search => engine.search(query, &options).await?,
        SearchMode::VSearch => engine.vsearch(query, &options).await?,
        SearchMode::Query => engine.query(query, &options).await?,
    };
    engine.attach_contexts(&mut results).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}/{}  #{}",
            i + 1,
            result.score,
            result.collection,
            result.path,
            result.docid
        );
        println!("    title: {}", result.title);
        if let Some(context) = &result.context {
            println!("    context: {}", context);
        }
        if !result.snippet.is_empty() {
            println!("    excerpt: \"{}\"", excerpt(&result.snippet, EXCERPT_CHARS));
        }
        println!();
    }
    Ok(())
}
