//! Query expander construction.
//!
//! `synonyms` uses the built-in table from `qmd_core::expand`; `llm` asks an
//! OpenAI-compatible chat completion endpoint for alternative phrasings, one
//! per line.

use async_trait::async_trait;
use std::time::Duration;

use qmd_core::expand::{QueryExpander, SynonymExpander};
use qmd_core::{QmdError, Result};

use crate::config::ExpansionConfig;
use crate::embedding::post_json_with_retry;

const DEFAULT_CHAT_URL: &str = "https://api.openai.com";
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

const PROMPT: &str = "Rewrite the search query below into up to four alternative \
search queries that would find the same documents. Answer with one query per \
line and nothing else.\n\nQuery: ";

pub struct LlmExpander {
    model: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmExpander {
    pub fn new(config: &ExpansionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QmdError::provider("llm", e.to_string()))?;

        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_CHAT_URL.to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            client,
        })
    }
}

/// One variant per non-empty line, with list markers stripped.
fn parse_variants(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| strip_list_marker(line.trim()).trim().trim_matches('"').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return rest;
    }
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest;
        }
    }
    line
}

#[async_trait]
impl QueryExpander for LlmExpander {
    fn name(&self) -> &str {
        "llm"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "user", "content": format!("{PROMPT}{query}") }
            ],
        });
        let url = format!("{}/v1/chat/completions", self.url.trim_end_matches('/'));
        // Expansion is optional, so a single attempt is enough.
        let json =
            post_json_with_retry(&self.client, "llm", &url, self.api_key.as_deref(), &body, 0)
                .await?;

        let content = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| QmdError::provider("llm", "missing choices[0].message.content"))?;
        Ok(parse_variants(content))
    }
}

/// Build the configured expander; `None` when expansion is disabled.
pub fn create_expander(config: &ExpansionConfig) -> Result<Option<Box<dyn QueryExpander>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "synonyms" => Ok(Some(Box::new(SynonymExpander))),
        "llm" => Ok(Some(Box::new(LlmExpander::new(config)?))),
        other => Err(QmdError::NotReady(format!(
            "unknown expansion provider: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variants_strips_markers() {
        let text = "1. rust install guide\n- \"setup rust toolchain\"\n\n* rustup usage\n";
        assert_eq!(
            parse_variants(text),
            vec!["rust install guide", "setup rust toolchain", "rustup usage"]
        );
        assert_eq!(parse_variants("2fa setup"), vec!["2fa setup"]);
    }

    #[test]
    fn test_create_expander() {
        let mut config = ExpansionConfig::default();
        assert_eq!(create_expander(&config).unwrap().unwrap().name(), "synonyms");
        config.provider = "disabled".into();
        assert!(create_expander(&config).unwrap().is_none());
    }
}
