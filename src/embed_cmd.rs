//! `qmd embed`: fill in missing chunk embeddings.
//!
//! Only `(hash, seq)` pairs lacking a vector from the configured model are
//! sent to the provider, so an interrupted run resumes where it stopped and
//! a finished run is a no-op. `--force` drops existing vectors first.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use qmd_core::embedding::{l2_normalize, EmbeddingProvider};
use qmd_core::models::{PendingChunk, SearchFilter};
use qmd_core::store::Store;
use qmd_core::QmdError;

use crate::config::Config;
use crate::{db, embedding};

#[derive(Debug, Clone)]
pub struct EmbedOptions {
    pub force: bool,
    pub collection: Option<String>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedReport {
    /// Vectors dropped by `--force`.
    pub cleared: usize,
    pub pending: usize,
    pub embedded: usize,
    pub failed: usize,
}

/// Text sent to the embedder for one chunk.
fn embed_input(chunk: &PendingChunk) -> String {
    if chunk.title.is_empty() {
        chunk.text.clone()
    } else {
        format!("{}\n\n{}", chunk.title, chunk.text)
    }
}

/// Embed every pending chunk in batches. A failed batch is logged,
/// counted and skipped; the next run picks it up again.
pub async fn embed_pending<S: Store + ?Sized>(
    store: &S,
    provider: &dyn EmbeddingProvider,
    options: &EmbedOptions,
) -> Result<EmbedReport> {
    let filter = match &options.collection {
        Some(c) => SearchFilter::collection(c.clone()),
        None => SearchFilter::all(),
    };
    let model = provider.model_name();
    let mut report = EmbedReport::default();

    if options.force {
        report.cleared = store
            .clear_embeddings(&filter)
            .await
            .context("failed to clear embeddings")?;
        info!(cleared = report.cleared, "cleared existing embeddings");
    }

    let pending = store
        .pending_chunks(model, &filter)
        .await
        .context("failed to list pending chunks")?;
    report.pending = pending.len();
    if pending.is_empty() {
        return Ok(report);
    }

    let batch_size = options.batch_size.max(1);
    let batches = pending.len().div_ceil(batch_size);
    for (n, batch) in pending.chunks(batch_size).enumerate() {
        let texts: Vec<String> = batch.iter().map(embed_input).collect();

        let vectors = match provider.embed(&texts).await {
            Ok(v) if v.len() == batch.len() => v,
            Ok(v) => {
                let e = QmdError::provider(
                    model,
                    format!("expected {} embeddings, got {}", batch.len(), v.len()),
                );
                warn!(batch = n + 1, error = %e, "embedding batch failed");
                report.failed += batch.len();
                continue;
            }
            Err(e) => {
                warn!(batch = n + 1, error = %e, "embedding batch failed");
                report.failed += batch.len();
                continue;
            }
        };

        for (chunk, mut vector) in batch.iter().zip(vectors) {
            l2_normalize(&mut vector);
            store
                .upsert_embedding(&chunk.hash, chunk.seq, model, &vector)
                .await
                .with_context(|| format!("storing embedding {}:{}", chunk.hash, chunk.seq))?;
            report.embedded += 1;
        }
        info!(
            batch = n + 1,
            batches,
            embedded = report.embedded,
            total = report.pending,
            "embedded batch"
        );
    }

    Ok(report)
}

pub async fn run_embed(
    config: &Config,
    force: bool,
    collection: Option<String>,
    json: bool,
) -> Result<()> {
    let provider = embedding::create_provider(&config.embedding)?.ok_or_else(|| {
        QmdError::NotReady(
            "embedding provider is disabled; set [embedding] provider in config".into(),
        )
    })?;
    if let Some(name) = &collection {
        if config.collection(name).is_none() {
            anyhow::bail!("unknown collection: '{}'", name);
        }
    }

    let store = db::open_store(config).await?;
    let options = EmbedOptions {
        force,
        collection,
        batch_size: config.embedding.batch_size,
    };
    let report = embed_pending(&store, provider.as_ref(), &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("embed ({})", provider.model_name());
    if force {
        println!("  cleared: {}", report.cleared);
    }
    println!("  pending: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qmd_core::chunk::ChunkParams;
    use qmd_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::indexer::Indexer;

    /// Fails every call after the first `ok_calls`.
    struct Flaky {
        ok_calls: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> qmd_core::Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok_calls {
                return Err(QmdError::provider("flaky", "503"));
            }
            Ok(texts.iter().map(|_| vec![3.0, 4.0]).collect())
        }
    }

    async fn seeded(docs: usize) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let indexer = Indexer::new(store.clone(), ChunkParams::default());
        for i in 0..docs {
            indexer
                .add_document("notes", &format!("{i}.md"), "t", &format!("body number {i}"))
                .await
                .unwrap();
        }
        store
    }

    fn options(batch_size: usize) -> EmbedOptions {
        EmbedOptions {
            force: false,
            collection: None,
            batch_size,
        }
    }

    #[tokio::test]
    async fn test_resume_fills_only_the_gap() {
        let store = seeded(5).await;
        let flaky = Flaky {
            ok_calls: 1,
            calls: AtomicUsize::new(0),
        };
        let first = embed_pending(store.as_ref(), &flaky, &options(2)).await.unwrap();
        assert_eq!(first.pending, 5);
        assert_eq!(first.embedded, 2);
        assert_eq!(first.failed, 3);

        let healthy = Flaky {
            ok_calls: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let second = embed_pending(store.as_ref(), &healthy, &options(2)).await.unwrap();
        assert_eq!(second.pending, 3);
        assert_eq!(second.embedded, 3);

        let third = embed_pending(store.as_ref(), &healthy, &options(2)).await.unwrap();
        assert_eq!(third.pending, 0);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_force_recomputes() {
        let store = seeded(2).await;
        let healthy = Flaky {
            ok_calls: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        embed_pending(store.as_ref(), &healthy, &options(10)).await.unwrap();

        let forced = EmbedOptions {
            force: true,
            ..options(10)
        };
        let report = embed_pending(store.as_ref(), &healthy, &forced).await.unwrap();
        assert_eq!(report.cleared, 2);
        assert_eq!(report.embedded, 2);
    }

    #[tokio::test]
    async fn test_stored_vectors_are_normalized() {
        let store = seeded(1).await;
        let healthy = Flaky {
            ok_calls: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        embed_pending(store.as_ref(), &healthy, &options(10)).await.unwrap();

        let hits = store
            .vector_search(&[0.6, 0.8], "flaky", &SearchFilter::all(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
