//! Embedding provider implementations.
//!
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` on the OpenAI API or any
//!   compatible endpoint set by `embedding.url`.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed`.
//! - **[`LocalProvider`]**: fastembed models run in-process; no network after
//!   the first model download. Needs the `local-models` feature.
//!
//! # Retry Strategy
//!
//! Remote providers retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use qmd_core::embedding::EmbeddingProvider;
use qmd_core::{QmdError, Result};

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| QmdError::provider("http", e.to_string()))
}

/// POST `body` as JSON, retrying 429/5xx and network errors.
pub(crate) async fn post_json_with_retry(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(provider, attempt, ?delay, "retrying");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| QmdError::provider(provider, format!("invalid response: {e}")));
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = QmdError::provider(provider, format!("API error {status}: {body_text}"));
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(QmdError::provider(
                    provider,
                    format!("connection error ({url}): {e}"),
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| QmdError::provider(provider, "failed after retries")))
}

fn parse_vector(value: &serde_json::Value, provider: &str) -> Result<Vec<f32>> {
    let array = value
        .as_array()
        .ok_or_else(|| QmdError::provider(provider, "embedding is not an array"))?;
    array
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| QmdError::provider(provider, "embedding holds a non-number"))
        })
        .collect()
}

fn check_arity(provider: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(QmdError::provider(
            provider,
            format!("expected {expected} embeddings, got {got}"),
        ));
    }
    Ok(())
}

// ============ OpenAI ============

pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// Requires `embedding.model`, `embedding.dims` and `OPENAI_API_KEY`.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| QmdError::NotReady("embedding.model required for OpenAI provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| QmdError::NotReady("embedding.dims required for OpenAI provider".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| QmdError::NotReady("OPENAI_API_KEY environment variable not set".into()))?;

        Ok(Self {
            model,
            dims,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| QmdError::provider("openai", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| QmdError::provider("openai", "missing embedding"))?;
        indexed.push((index, parse_vector(embedding, "openai")?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let url = format!("{}/v1/embeddings", self.url.trim_end_matches('/'));
        let json = post_json_with_retry(
            &self.client,
            "openai",
            &url,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;

        let vectors = parse_openai_response(&json)?;
        check_arity("openai", texts.len(), vectors.len())?;
        Ok(vectors)
    }
}

// ============ Ollama ============

/// Requires Ollama running with the model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| QmdError::NotReady("embedding.model required for Ollama provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| QmdError::NotReady("embedding.dims required for Ollama provider".into()))?;

        Ok(Self {
            model,
            dims,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| QmdError::provider("ollama", "missing embeddings array"))?
        .iter()
        .map(|v| parse_vector(v, "ollama"))
        .collect()
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let json =
            post_json_with_retry(&self.client, "ollama", &url, None, &body, self.max_retries)
                .await?;

        let vectors = parse_ollama_response(&json)?;
        check_arity("ollama", texts.len(), vectors.len())?;
        Ok(vectors)
    }
}

// ============ Local (fastembed) ============

/// Local model name and its output dimensionality.
pub fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-models")]
pub use local::LocalProvider;

#[cfg(feature = "local-models")]
mod local {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// fastembed model, loaded on the first `embed` call.
    pub struct LocalProvider {
        model_name: String,
        dims: usize,
        batch_size: usize,
        model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalProvider {
        pub fn new(config: &EmbeddingConfig) -> Result<Self> {
            let (model_name, dims) = resolve_local_model(config);
            to_fastembed_model(&model_name)?;
            Ok(Self {
                model_name,
                dims,
                batch_size: config.batch_size,
                model: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        use fastembed::EmbeddingModel as M;
        match name {
            "all-minilm-l6-v2" => Ok(M::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(M::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(M::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(M::BGELargeENV15),
            "nomic-embed-text-v1" => Ok(M::NomicEmbedTextV1),
            "nomic-embed-text-v1.5" => Ok(M::NomicEmbedTextV15),
            "multilingual-e5-small" => Ok(M::MultilingualE5Small),
            "multilingual-e5-base" => Ok(M::MultilingualE5Base),
            "multilingual-e5-large" => Ok(M::MultilingualE5Large),
            other => Err(QmdError::NotReady(format!(
                "unknown local embedding model '{other}'"
            ))),
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LocalProvider {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let model = Arc::clone(&self.model);
            let name = self.model_name.clone();
            let batch_size = self.batch_size;
            let texts = texts.to_vec();

            tokio::task::spawn_blocking(move || {
                let mut guard = model
                    .lock()
                    .map_err(|_| QmdError::provider("local", "model lock poisoned"))?;
                if guard.is_none() {
                    let options = fastembed::InitOptions::new(to_fastembed_model(&name)?)
                        .with_show_download_progress(false);
                    let loaded = fastembed::TextEmbedding::try_new(options).map_err(|e| {
                        QmdError::provider("local", format!("failed to load {name}: {e}"))
                    })?;
                    *guard = Some(loaded);
                }
                let Some(embedder) = guard.as_mut() else {
                    return Err(QmdError::provider("local", "model not loaded"));
                };
                let vectors = embedder
                    .embed(texts, Some(batch_size))
                    .map_err(|e| QmdError::provider("local", e.to_string()))?;
                Ok(vectors)
            })
            .await
            .map_err(|e| QmdError::provider("local", e.to_string()))?
        }
    }
}

/// Model name the configured provider writes embeddings under, without
/// constructing the provider. `None` when embeddings are disabled.
pub fn active_model(config: &EmbeddingConfig) -> Option<String> {
    match config.provider.as_str() {
        "disabled" => None,
        "local" => Some(resolve_local_model(config).0),
        _ => config.model.clone(),
    }
}

/// Build the configured provider; `None` when embeddings are disabled.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Box<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Box::new(OpenAIProvider::new(config)?))),
        "ollama" => Ok(Some(Box::new(OllamaProvider::new(config)?))),
        #[cfg(feature = "local-models")]
        "local" => Ok(Some(Box::new(LocalProvider::new(config)?))),
        #[cfg(not(feature = "local-models"))]
        "local" => Err(QmdError::NotReady(
            "local embedding provider requires --features local-models".into(),
        )),
        other => Err(QmdError::NotReady(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_reorders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_missing_data() {
        let json = serde_json::json!({ "error": "nope" });
        assert!(matches!(
            parse_openai_response(&json),
            Err(QmdError::Provider { .. })
        ));
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.25]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.25]]);
        let bad = serde_json::json!({ "embeddings": [["x"]] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn test_disabled_is_none() {
        let config = EmbeddingConfig::default();
        assert!(create_provider(&config).unwrap().is_none());
    }

    #[test]
    fn test_active_model() {
        let mut config = EmbeddingConfig::default();
        assert_eq!(active_model(&config), None);
        config.provider = "local".into();
        assert_eq!(active_model(&config).as_deref(), Some("all-minilm-l6-v2"));
        config.provider = "ollama".into();
        config.model = Some("nomic-embed-text".into());
        assert_eq!(active_model(&config).as_deref(), Some("nomic-embed-text"));
    }

    #[test]
    fn test_resolve_local_model_dims() {
        let mut config = EmbeddingConfig::default();
        assert_eq!(resolve_local_model(&config), ("all-minilm-l6-v2".to_string(), 384));
        config.model = Some("bge-large-en-v1.5".into());
        assert_eq!(resolve_local_model(&config).1, 1024);
    }

    #[test]
    fn test_arity_mismatch_is_provider_error() {
        assert!(check_arity("x", 2, 1).is_err());
        assert!(check_arity("x", 2, 2).is_ok());
    }
}
