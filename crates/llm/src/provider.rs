use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engram_config::LlmSettings;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

use crate::parse::{parse_events, parse_facts};
use crate::prompts::{
    merge_decision_input, DEFAULT_FACT_EXTRACTION_PROMPT, DEFAULT_MERGE_PROMPT,
};
use crate::{ExtractedFact, LlmClient, LlmError, MemoryEvent, NeighborMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    /// Any OpenAI-compatible endpoint (OpenAI, OpenRouter, vLLM, …).
    OpenAi,
}

/// LLM gateway speaking either the Ollama API or an OpenAI-compatible API.
///
/// Concurrency toward the provider is bounded by an internal semaphore
/// sized from `max_concurrency`, so a burst of ingestions cannot exhaust
/// provider rate limits.
#[derive(Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    provider: Provider,
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    permits: Arc<Semaphore>,
}

impl HttpLlmClient {
    pub fn from_settings(settings: &LlmSettings) -> Self {
        let provider = if settings.provider.eq_ignore_ascii_case("openai") {
            Provider::OpenAi
        } else {
            Provider::Ollama
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            http,
            provider,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            embedding_model: settings.embedding_model.clone(),
            api_key: settings.api_key.clone(),
            permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
        }
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Unavailable("llm client shut down".to_string()))?;

        let (url, body) = match self.provider {
            Provider::Ollama => (
                format!("{}/api/chat", self.base_url),
                json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                    "stream": false,
                    "format": "json",
                }),
            ),
            Provider::OpenAi => (
                format!("{}/chat/completions", self.base_url),
                json!({
                    "model": self.model,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                    "response_format": {"type": "json_object"},
                }),
            ),
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Unavailable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("provider returned {status}: {body}")));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|err| LlmError::Malformed(err.to_string()))?;

        let content = match self.provider {
            Provider::Ollama => value["message"]["content"].as_str(),
            Provider::OpenAi => value["choices"][0]["message"]["content"].as_str(),
        };
        content
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::Malformed("provider response carried no content".to_string()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn extract_facts(
        &self,
        text: &str,
        instructions: Option<&str>,
    ) -> Result<Vec<ExtractedFact>, LlmError> {
        let system = instructions.unwrap_or(DEFAULT_FACT_EXTRACTION_PROMPT);
        let content = self.chat(system, text).await?;
        let facts = parse_facts(&content)?;
        debug!(input_len = text.len(), facts = facts.len(), "extracted facts");
        Ok(facts)
    }

    async fn decide_merge(
        &self,
        fact: &str,
        fact_attachment_ids: &[Uuid],
        neighbors: &[NeighborMemory],
        prompt_override: Option<&str>,
    ) -> Result<Vec<MemoryEvent>, LlmError> {
        let system = prompt_override.unwrap_or(DEFAULT_MERGE_PROMPT);
        let input = merge_decision_input(fact, fact_attachment_ids, neighbors);
        let content = self.chat(system, &input).await?;
        let events = parse_events(&content)?;
        debug!(neighbors = neighbors.len(), events = events.len(), "merge decision");
        Ok(events)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Unavailable("llm client shut down".to_string()))?;

        let (url, body) = match self.provider {
            Provider::Ollama => (
                format!("{}/api/embeddings", self.base_url),
                json!({"model": self.embedding_model, "prompt": text}),
            ),
            Provider::OpenAi => (
                format!("{}/embeddings", self.base_url),
                json!({"model": self.embedding_model, "input": text}),
            ),
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Unavailable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("provider returned {status}: {body}")));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|err| LlmError::Malformed(err.to_string()))?;

        let embedding = match self.provider {
            Provider::Ollama => value["embedding"].as_array().cloned(),
            Provider::OpenAi => value["data"][0]["embedding"].as_array().cloned(),
        };
        let vector: Vec<f32> = embedding
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_f64)
            .map(|f| f as f32)
            .collect();
        if vector.is_empty() {
            return Err(LlmError::Malformed("provider returned an empty embedding".to_string()));
        }
        Ok(vector)
    }
}
