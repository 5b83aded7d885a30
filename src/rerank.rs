//! Reranking providers.
//!
//! - `local`: a fastembed cross-encoder (Jina Reranker v1 Turbo by default).
//!   Raw logits go through a sigmoid so scores land in `[0, 1]`.
//! - `remote`: `POST {url}/rerank` with `{model, query, documents}`, reading
//!   `results[].{index, relevance_score}`.
//!
//! Blending lives in `qmd_core::rerank`; a provider only scores.

use async_trait::async_trait;
use std::time::Duration;

use qmd_core::rerank::RerankProvider;
use qmd_core::{QmdError, Result};

use crate::config::RerankConfig;

/// Map a cross-encoder logit to `(0, 1)`.
pub fn sigmoid(x: f32) -> f64 {
    1.0 / (1.0 + (-f64::from(x)).exp())
}

pub struct RemoteReranker {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl RemoteReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| QmdError::NotReady("rerank.url required for remote provider".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QmdError::provider("rerank", e.to_string()))?;

        Ok(Self {
            model: config.model.clone().unwrap_or_else(|| "default".to_string()),
            url,
            client,
        })
    }
}

/// Scores in candidate order from a `/rerank` response.
fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f64>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| QmdError::provider("rerank", "missing results array"))?;

    let mut scores = vec![None; expected];
    for item in results {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .ok_or_else(|| QmdError::provider("rerank", "result without index"))?;
        let score = item
            .get("relevance_score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| QmdError::provider("rerank", "result without relevance_score"))?;
        let slot = scores
            .get_mut(index)
            .ok_or_else(|| QmdError::provider("rerank", format!("index {index} out of range")))?;
        *slot = Some(score.clamp(0.0, 1.0));
    }

    scores
        .into_iter()
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| QmdError::provider("rerank", "missing scores for some candidates"))
}

#[async_trait]
impl RerankProvider for RemoteReranker {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": candidates,
        });
        let url = format!("{}/rerank", self.url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| QmdError::provider("rerank", format!("connection error ({url}): {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QmdError::provider("rerank", format!("API error {status}: {text}")));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QmdError::provider("rerank", format!("invalid response: {e}")))?;

        parse_rerank_response(&json, candidates.len())
    }
}

#[cfg(feature = "local-models")]
pub use local::LocalReranker;

#[cfg(feature = "local-models")]
mod local {
    use super::*;
    use std::sync::{Arc, Mutex};

    use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

    /// Cross-encoder loaded on first use.
    pub struct LocalReranker {
        model_name: String,
        model: Arc<Mutex<Option<TextRerank>>>,
    }

    impl LocalReranker {
        pub fn new(config: &RerankConfig) -> Result<Self> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "jina-reranker-v1-turbo-en".to_string());
            to_reranker_model(&model_name)?;
            Ok(Self {
                model_name,
                model: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn to_reranker_model(name: &str) -> Result<RerankerModel> {
        match name {
            "jina-reranker-v1-turbo-en" => Ok(RerankerModel::JINARerankerV1TurboEn),
            "bge-reranker-base" => Ok(RerankerModel::BGERerankerBase),
            other => Err(QmdError::NotReady(format!(
                "unknown local rerank model '{other}'"
            ))),
        }
    }

    #[async_trait]
    impl RerankProvider for LocalReranker {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f64>> {
            let model = Arc::clone(&self.model);
            let name = self.model_name.clone();
            let query = query.to_string();
            let candidates = candidates.to_vec();

            tokio::task::spawn_blocking(move || {
                let mut guard = model
                    .lock()
                    .map_err(|_| QmdError::provider("rerank", "model lock poisoned"))?;
                if guard.is_none() {
                    let options = RerankInitOptions::new(to_reranker_model(&name)?)
                        .with_show_download_progress(false);
                    let loaded = TextRerank::try_new(options).map_err(|e| {
                        QmdError::provider("rerank", format!("failed to load {name}: {e}"))
                    })?;
                    *guard = Some(loaded);
                }
                let Some(reranker) = guard.as_mut() else {
                    return Err(QmdError::provider("rerank", "model not loaded"));
                };

                let documents: Vec<&str> = candidates.iter().map(String::as_str).collect();
                let results = reranker
                    .rerank(query.as_str(), &documents, false, None)
                    .map_err(|e| QmdError::provider("rerank", e.to_string()))?;

                let mut scores = vec![0.0; documents.len()];
                for r in results {
                    if let Some(slot) = scores.get_mut(r.index) {
                        *slot = sigmoid(r.score);
                    }
                }
                Ok(scores)
            })
            .await
            .map_err(|e| QmdError::provider("rerank", e.to_string()))?
        }
    }
}

/// Build the configured reranker; `None` when reranking is disabled.
pub fn create_reranker(config: &RerankConfig) -> Result<Option<Box<dyn RerankProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "remote" => Ok(Some(Box::new(RemoteReranker::new(config)?))),
        #[cfg(feature = "local-models")]
        "local" => Ok(Some(Box::new(LocalReranker::new(config)?))),
        #[cfg(not(feature = "local-models"))]
        "local" => Err(QmdError::NotReady(
            "local rerank provider requires --features local-models".into(),
        )),
        other => Err(QmdError::NotReady(format!("unknown rerank provider: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_range() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn test_parse_rerank_response_in_candidate_order() {
        let json = serde_json::json!({
            "results": [
                { "index": 1, "relevance_score": 0.9 },
                { "index": 0, "relevance_score": 0.2 }
            ]
        });
        assert_eq!(parse_rerank_response(&json, 2).unwrap(), vec![0.2, 0.9]);
    }

    #[test]
    fn test_parse_rerank_response_missing_candidate() {
        let json = serde_json::json!({ "results": [ { "index": 0, "relevance_score": 0.5 } ] });
        assert!(parse_rerank_response(&json, 2).is_err());
    }

    #[test]
    fn test_parse_rerank_response_clamps() {
        let json = serde_json::json!({ "results": [ { "index": 0, "relevance_score": 1.7 } ] });
        assert_eq!(parse_rerank_response(&json, 1).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_remote_requires_url() {
        let config = RerankConfig {
            provider: "remote".into(),
            ..RerankConfig::default()
        };
        assert!(matches!(
            create_reranker(&config),
            Err(QmdError::NotReady(_))
        ));
    }
}
