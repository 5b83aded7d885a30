//! Query expansion.
//!
//! An expander turns one query into a few alternative phrasings. Expansion
//! only improves recall: [`expand_query`] always returns the original query
//! first and falls back to it alone when the expander fails.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;

/// Upper bound on variants, the original query included.
pub const MAX_VARIANTS: usize = 5;

/// Built-in keyword table: a query word and the words that may replace it.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("how", &["how to", "guide", "tutorial"]),
    ("what", &["what is", "definition", "explanation"]),
    ("why", &["reason", "explanation", "purpose"]),
    ("config", &["configuration", "settings", "setup"]),
    ("install", &["installation", "setup", "deployment"]),
    ("error", &["error", "issue", "problem", "bug"]),
    ("api", &["api", "interface", "endpoint"]),
    ("doc", &["documentation", "docs", "guide"]),
];

#[async_trait]
pub trait QueryExpander: Send + Sync {
    fn name(&self) -> &str;

    /// Model behind the expander; defaults to [`name`](Self::name).
    fn model_name(&self) -> &str {
        self.name()
    }

    /// Alternative phrasings of `query`. May include the query itself.
    async fn expand(&self, query: &str) -> Result<Vec<String>>;
}

/// Expands whole words found in the built-in synonym table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynonymExpander;

impl SynonymExpander {
    fn variants(query: &str) -> Vec<String> {
        let words: Vec<&str> = query.split_whitespace().collect();
        let mut out = Vec::new();
        for (i, word) in words.iter().enumerate() {
            let lower = word.to_lowercase();
            let Some((_, replacements)) = SYNONYMS.iter().find(|(k, _)| *k == lower) else {
                continue;
            };
            for &replacement in replacements.iter() {
                let mut rewritten = words.clone();
                rewritten[i] = replacement;
                out.push(rewritten.join(" "));
            }
        }
        out
    }
}

#[async_trait]
impl QueryExpander for SynonymExpander {
    fn name(&self) -> &str {
        "synonyms"
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>> {
        Ok(Self::variants(query))
    }
}

/// Original query first, then expander output, case-insensitively unique,
/// at most `max_variants` entries (never fewer than one).
pub async fn expand_query(
    expander: Option<&dyn QueryExpander>,
    query: &str,
    max_variants: usize,
) -> Vec<String> {
    let mut variants = vec![query.to_string()];
    let Some(expander) = expander else {
        return variants;
    };

    let candidates = match expander.expand(query).await {
        Ok(c) => c,
        Err(e) => {
            warn!(expander = expander.name(), error = %e, "query expansion failed, using original query");
            return variants;
        }
    };

    let mut seen = vec![query.to_lowercase()];
    for candidate in candidates {
        if variants.len() >= max_variants.max(1) {
            break;
        }
        let candidate = candidate.trim();
        if candidate.is_empty() {
            continue;
        }
        let folded = candidate.to_lowercase();
        if seen.contains(&folded) {
            continue;
        }
        seen.push(folded);
        variants.push(candidate.to_string());
    }

    debug!(?variants, "expanded query");
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QmdError;

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl QueryExpander for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn expand(&self, _query: &str) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl QueryExpander for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn expand(&self, _query: &str) -> Result<Vec<String>> {
            Err(QmdError::provider("llm", "timeout"))
        }
    }

    #[tokio::test]
    async fn test_original_first_and_deduped() {
        let e = Fixed(vec!["Install Rust", "setup rust", "SETUP RUST", ""]);
        let v = expand_query(Some(&e), "install rust", MAX_VARIANTS).await;
        assert_eq!(v, vec!["install rust", "setup rust"]);
    }

    #[tokio::test]
    async fn test_capped_at_max_variants() {
        let e = Fixed(vec!["a", "b", "c", "d", "e", "f"]);
        let v = expand_query(Some(&e), "q", MAX_VARIANTS).await;
        assert_eq!(v.len(), MAX_VARIANTS);
        assert_eq!(v[0], "q");
    }

    #[tokio::test]
    async fn test_failure_degrades_to_original() {
        let v = expand_query(Some(&Broken), "why rust", MAX_VARIANTS).await;
        assert_eq!(v, vec!["why rust"]);
    }

    #[tokio::test]
    async fn test_no_expander() {
        let v = expand_query(None, "anything", MAX_VARIANTS).await;
        assert_eq!(v, vec!["anything"]);
    }

    #[tokio::test]
    async fn test_synonyms_replace_whole_words_only() {
        let v = expand_query(Some(&SynonymExpander), "install docker", MAX_VARIANTS).await;
        assert_eq!(
            v,
            vec![
                "install docker",
                "installation docker",
                "setup docker",
                "deployment docker"
            ]
        );
        let none = SynonymExpander::variants("dockerfile tips");
        assert!(none.is_empty());
    }
}
