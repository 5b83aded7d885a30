//! Weighted Reciprocal Rank Fusion.
//!
//! Combines ranked lists from every retrieval method and query variant
//! into one ordering:
//!
//! ```text
//! fused(d) = sum over lists i containing d of: weight_i / (k + rank_i(d) + 1)
//! ```
//!
//! where `rank` is 0-based and documents are identified by
//! `(collection, path)`. Absence from a list contributes nothing. Only
//! ranks matter, so the lists' own score scales never interact.
//!
//! Fusion is a pure function: the same lists always produce the same output.

use std::collections::{HashMap, HashSet};

use crate::models::{RankedList, SearchResult};

/// Default RRF smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Weight of lists retrieved for the unexpanded query.
pub const ORIGINAL_QUERY_WEIGHT: f64 = 2.0;

/// Weight of lists retrieved for an expansion variant.
pub const VARIANT_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub k: f64,
    pub original_weight: f64,
    pub variant_weight: f64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            original_weight: ORIGINAL_QUERY_WEIGHT,
            variant_weight: VARIANT_WEIGHT,
        }
    }
}

impl FusionParams {
    /// Weight for lists of variant `index`; index 0 is the original query.
    pub fn weight_for_variant(&self, index: usize) -> f64 {
        if index == 0 {
            self.original_weight
        } else {
            self.variant_weight
        }
    }
}

/// One input list and the weight of its contributions.
#[derive(Debug, Clone)]
pub struct WeightedList {
    pub results: RankedList,
    pub weight: f64,
}

impl WeightedList {
    pub fn new(results: RankedList, weight: f64) -> Self {
        Self { results, weight }
    }
}

struct Fused {
    result: SearchResult,
    score: f64,
    /// `(rank, list index)` of the document's earliest appearance.
    first_seen: (usize, usize),
}

/// Fuse `lists` with smoothing constant `k`.
///
/// The output is sorted by fused score, descending, with `score` set to
/// the fused value. Ties go to the document that appeared at the better
/// rank, then in the earlier list. The representative result (title,
/// snippet) is taken from that earliest appearance.
pub fn reciprocal_rank_fusion(lists: &[WeightedList], k: f64) -> RankedList {
    let mut fused: HashMap<(&str, &str), Fused> = HashMap::new();

    for (list_idx, list) in lists.iter().enumerate() {
        let mut seen_in_list = HashSet::new();
        for (rank, result) in list.results.iter().enumerate() {
            let key = result.key();
            if !seen_in_list.insert(key) {
                continue;
            }
            let contribution = list.weight / (k + rank as f64 + 1.0);
            let position = (rank, list_idx);

            fused
                .entry(key)
                .and_modify(|f| {
                    f.score += contribution;
                    if position < f.first_seen {
                        f.first_seen = position;
                        f.result = result.clone();
                    }
                })
                .or_insert_with(|| Fused {
                    result: result.clone(),
                    score: contribution,
                    first_seen: position,
                });
        }
    }

    let mut entries: Vec<Fused> = fused.into_values().collect();
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.first_seen.cmp(&b.first_seen))
    });

    entries
        .into_iter()
        .map(|f| SearchResult {
            score: f.score,
            ..f.result
        })
        .collect()
}
