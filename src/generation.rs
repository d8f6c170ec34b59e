//! Chat-completion generation provider.
//!
//! [`OpenAIChatProvider`] sends the packed context and the question to an
//! OpenAI-compatible `/chat/completions` endpoint. The returned text is
//! passed through untouched; only the `[n]` citation labels it mentions
//! are extracted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use standards_search_core::generation::{
    build_prompt, cited_labels, Generation, GenerationProvider, SYSTEM_PROMPT,
};
use standards_search_core::models::RetrievalResult;
use standards_search_core::ProviderError;

use crate::config::GenerationConfig;
use crate::embedding::{classify_response, network_error};

const DEFAULT_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIChatProvider {
    model: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChatProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        query: &str,
        retrieval: &RetrievalResult,
    ) -> Result<Generation, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(query, retrieval)},
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error("OpenAI", e))?;

        if !response.status().is_success() {
            return Err(classify_response("OpenAI", response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| network_error("OpenAI", e))?;
        let text = parse_chat_response(&json)?;
        let used_citations = cited_labels(&text, retrieval.citations.len());
        Ok(Generation {
            text,
            used_citations,
        })
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, ProviderError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ProviderError::Unavailable(
                "Invalid OpenAI response: missing choices[0].message.content".to_string(),
            )
        })
}

/// Create the configured generation provider, or `None` when disabled.
pub fn create_generator(config: &GenerationConfig) -> Result<Option<Arc<dyn GenerationProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAIChatProvider::new(config)?))),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "See [1]."}}]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "See [1].");
        assert!(parse_chat_response(&serde_json::json!({"choices": []})).is_err());
    }

    #[test]
    fn test_disabled_generator() {
        let config = GenerationConfig::default();
        assert!(create_generator(&config).unwrap().is_none());
    }
}
