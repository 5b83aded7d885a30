//! Reranker blending.
//!
//! A cross-encoder style reranker scores the fused shortlist against the
//! query. Its scores are blended with min-max normalized fusion scores,
//! trusting fusion more near the top of the list:
//!
//! | Fused position | Fusion weight | Reranker weight |
//! |----------------|---------------|-----------------|
//! | 1-3            | 0.75          | 0.25            |
//! | 4-10           | 0.60          | 0.40            |
//! | 11+            | 0.40          | 0.60            |
//!
//! This stage never fails a query: without a reranker, or when it errors,
//! the fused order is returned unchanged.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{RankedList, SearchResult};

/// Number of fused candidates sent to the reranker.
pub const DEFAULT_RERANK_TOP_K: usize = 30;

/// `(last 1-based position in band, fusion weight, reranker weight)`.
const BANDS: [(usize, f64, f64); 3] = [(3, 0.75, 0.25), (10, 0.60, 0.40), (usize::MAX, 0.40, 0.60)];

/// A black-box relevance scorer.
///
/// Returns one score in `[0, 1]` per candidate, in candidate order.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>>;
}

/// Blend weights `(fusion, reranker)` for a 1-based fused position.
pub fn band_weights(position: usize) -> (f64, f64) {
    BANDS
        .iter()
        .find(|(last, _, _)| position <= *last)
        .map(|&(_, fused, rerank)| (fused, rerank))
        .unwrap_or((0.40, 0.60))
}

/// Min-max normalize scores to `[0, 1]`. All-equal inputs map to `1.0`.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|&s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Blend fused candidates (in fused order) with reranker scores.
///
/// Returns the candidates re-sorted by blended score; equal blended scores
/// keep fused order. Mismatched lengths return the input unchanged.
pub fn blend(candidates: &[SearchResult], rerank_scores: &[f64]) -> RankedList {
    if candidates.len() != rerank_scores.len() {
        return candidates.to_vec();
    }

    let fused: Vec<f64> = candidates.iter().map(|c| c.score).collect();
    let fused_norm = normalize_scores(&fused);

    let mut blended: RankedList = candidates
        .iter()
        .zip(fused_norm.iter().zip(rerank_scores))
        .enumerate()
        .map(|(idx, (candidate, (&norm, &rerank)))| {
            let (w_fused, w_rerank) = band_weights(idx + 1);
            SearchResult {
                score: w_fused * norm + w_rerank * rerank.clamp(0.0, 1.0),
                ..candidate.clone()
            }
        })
        .collect();

    blended.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    blended
}

/// Text the reranker sees for one candidate.
pub fn rerank_text(result: &SearchResult) -> String {
    if result.snippet.is_empty() {
        result.title.clone()
    } else {
        format!("{}\n{}", result.title, result.snippet)
    }
}

/// Rerank the first `top_k` fused results.
///
/// On success only the blended shortlist is returned, since the remaining
/// fused scores are not comparable with blended ones. Without a provider,
/// or on any provider failure, `fused` comes back untouched.
pub async fn rerank_fused(
    provider: Option<&dyn RerankProvider>,
    query: &str,
    fused: RankedList,
    top_k: usize,
) -> RankedList {
    let Some(provider) = provider else {
        return fused;
    };
    if fused.is_empty() || top_k == 0 {
        return fused;
    }

    let shortlist = &fused[..top_k.min(fused.len())];
    let texts: Vec<String> = shortlist.iter().map(rerank_text).collect();

    match provider.rerank(query, &texts).await {
        Ok(scores) if scores.len() == shortlist.len() => {
            debug!(model = provider.model_name(), candidates = scores.len(), "reranked");
            blend(shortlist, &scores)
        }
        Ok(scores) => {
            warn!(
                model = provider.model_name(),
                expected = shortlist.len(),
                got = scores.len(),
                "reranker returned wrong number of scores, keeping fused order"
            );
            fused
        }
        Err(e) => {
            warn!(model = provider.model_name(), error = %e, "reranker failed, keeping fused order");
            fused
        }
    }
}
