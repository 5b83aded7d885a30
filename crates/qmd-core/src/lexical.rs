//! Lexical (BM25) retrieval adapter.
//!
//! Turns a raw user query into a backend-neutral [`FtsQuery`], runs it
//! against the store, and converts backend scores into "higher is better"
//! values in `[0, 1)`. Score direction is handled here and nowhere else:
//! everything downstream of this adapter assumes larger scores rank first.
//!
//! Each hit's snippet is replaced by the chunk of its document that
//! mentions the query terms most often, so lexical and vector results
//! carry the same kind of excerpt.

use tracing::debug;

use crate::error::{QmdError, Result};
use crate::models::{docid, Chunk, RankedList, SearchFilter, SearchResult};
use crate::store::{FtsQuery, ScoreOrder, Store};

/// Split a query into plain search terms.
///
/// Tokens without a single alphanumeric character (operators, stray
/// punctuation) are dropped. Backends quote each remaining term, so
/// characters special to their syntax lose their meaning.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(str::to_string)
        .collect()
}

/// Map a raw backend score to `[0, 1)`, larger meaning more relevant.
pub fn normalize_score(raw: f64, order: ScoreOrder) -> f64 {
    let s = match order {
        ScoreOrder::HigherIsBetter => raw,
        ScoreOrder::LowerIsBetter => -raw,
    };
    let s = s.max(0.0);
    s / (1.0 + s)
}

/// Lowercased terms with surrounding punctuation removed, for chunk scoring.
fn match_needles(query: &str) -> Vec<String> {
    query_terms(query)
        .iter()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// The chunk with the most needle occurrences; ties go to the earliest.
fn best_chunk<'c>(chunks: &'c [Chunk], needles: &[String]) -> Option<&'c Chunk> {
    let mut best: Option<(&Chunk, usize)> = None;
    for chunk in chunks {
        let text = chunk.text.to_lowercase();
        let count: usize = needles.iter().map(|n| text.matches(n.as_str()).count()).sum();
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((chunk, count));
        }
    }
    best.map(|(chunk, _)| chunk)
}

pub struct LexicalIndex<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> LexicalIndex<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// BM25 search returning one result per document, best first.
    ///
    /// If the backend rejects the term query it is retried once as a literal
    /// phrase; a phrase the backend also rejects yields no results.
    pub async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<RankedList> {
        let terms = FtsQuery::Terms(query_terms(query));
        let hits = match self.store.keyword_search(&terms, filter, limit).await {
            Ok(hits) => hits,
            Err(QmdError::InvalidQuery(reason)) => {
                debug!(%reason, query, "lexical query rejected, retrying as phrase");
                let phrase = FtsQuery::Phrase(query.trim().to_string());
                match self.store.keyword_search(&phrase, filter, limit).await {
                    Ok(hits) => hits,
                    Err(QmdError::InvalidQuery(_)) => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let order = self.store.lexical_order();
        let mut results: RankedList = hits
            .into_iter()
            .map(|h| SearchResult {
                docid: docid(&h.hash),
                collection: h.collection,
                path: h.path,
                title: h.title,
                hash: h.hash,
                score: normalize_score(h.raw_score, order),
                snippet: h.snippet,
                context: None,
            })
            .collect();

        let needles = match_needles(query);
        for result in &mut results {
            let chunks = self.store.get_chunks(&result.hash).await?;
            if let Some(chunk) = best_chunk(&chunks, &needles) {
                result.snippet = chunk.text.clone();
            }
        }

        // Stable: equal scores keep the backend's order.
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{content_hash, Content, Document};
    use crate::store::memory::InMemoryStore;

    async fn index(store: &InMemoryStore, path: &str, body: &str) {
        let d = Document {
            collection: "notes".into(),
            path: path.into(),
            title: path.into(),
            hash: content_hash(body),
            active: true,
            created_at: 0,
            modified_at: 0,
            deactivated_at: None,
        };
        store.upsert_document(&d).await.unwrap();
        store.index_document(&d, body).await.unwrap();
    }

    #[test]
    fn test_query_terms_drop_operators() {
        assert_eq!(query_terms("rust AND \"cargo\" *"), vec!["rust", "AND", "\"cargo\""]);
        assert!(query_terms("?? * -").is_empty());
    }

    #[test]
    fn test_lower_is_better_flips_sign() {
        let strong = normalize_score(-8.0, ScoreOrder::LowerIsBetter);
        let weak = normalize_score(-1.0, ScoreOrder::LowerIsBetter);
        assert!(strong > weak);
        assert!(strong < 1.0 && weak > 0.0);
    }

    #[test]
    fn test_higher_is_better_keeps_order() {
        let a = normalize_score(5.0, ScoreOrder::HigherIsBetter);
        let b = normalize_score(2.0, ScoreOrder::HigherIsBetter);
        assert!(a > b);
    }

    #[tokio::test]
    async fn test_search_ranks_by_term_frequency() {
        let store = InMemoryStore::new();
        index(&store, "a.md", "deploy once").await;
        index(&store, "b.md", "deploy deploy deploy").await;

        let results = LexicalIndex::new(&store)
            .search("deploy", &SearchFilter::all(), 10)
            .await
            .unwrap();
        assert_eq!(results[0].path, "b.md");
        assert_eq!(results[1].path, "a.md");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_best_chunk_prefers_most_mentions_then_earliest() {
        let chunk = |seq: usize, text: &str| Chunk {
            hash: "h".into(),
            seq,
            pos: 0,
            text: text.into(),
        };
        let chunks = vec![
            chunk(0, "intro without terms"),
            chunk(1, "Deploy once"),
            chunk(2, "deploy, then deploy again"),
            chunk(3, "DEPLOY deploy"),
        ];
        let needles = match_needles("\"deploy\"");
        assert_eq!(best_chunk(&chunks, &needles).map(|c| c.seq), Some(2));
        assert_eq!(best_chunk(&chunks, &[]).map(|c| c.seq), Some(0));
        assert!(best_chunk(&[], &needles).is_none());
    }

    #[tokio::test]
    async fn test_snippet_is_best_matching_chunk() {
        let store = InMemoryStore::new();
        let body = "# Setup\n\nInstall the toolchain.\n\n# Rollback\n\nRollback the deploy with one command.";
        let hash = content_hash(body);
        let chunks = vec![
            Chunk {
                hash: hash.clone(),
                seq: 0,
                pos: 0,
                text: "# Setup\n\nInstall the toolchain.".into(),
            },
            Chunk {
                hash: hash.clone(),
                seq: 1,
                pos: 33,
                text: "# Rollback\n\nRollback the deploy with one command.".into(),
            },
        ];
        let content = Content {
            hash,
            body: body.into(),
            size: body.len(),
        };
        store.insert_content(&content, &chunks).await.unwrap();
        index(&store, "ops.md", body).await;

        let results = LexicalIndex::new(&store)
            .search("rollback", &SearchFilter::all(), 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].snippet, chunks[1].text);
    }

    #[tokio::test]
    async fn test_punctuation_only_query_degrades_to_phrase() {
        let store = InMemoryStore::new();
        index(&store, "a.md", "what?? really").await;

        let results = LexicalIndex::new(&store)
            .search("??", &SearchFilter::all(), 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
