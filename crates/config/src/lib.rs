use std::env;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: String,
    /// Base URL for the provider API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` / `OPENAI_BASE_URL` environment variables when set.
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub embedding_dims: usize,
    pub api_key: Option<String>,
    /// Upper bound on concurrent in-flight provider calls.
    pub max_concurrency: usize,
    /// Override for the fact-extraction prompt.  `None` falls back to the
    /// built-in default.
    pub custom_instructions: Option<String>,
    /// Override for the merge-decision prompt.  `None` falls back to the
    /// built-in default.
    pub custom_update_memory_prompt: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dims: 768,
            api_key: None,
            max_concurrency: 4,
            custom_instructions: None,
            custom_update_memory_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorSettings {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            collection: "engram_memories".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDefaults {
    /// Default for the `infer` flag when a caller leaves it unset.
    pub default_infer: bool,
    pub default_extract: bool,
    pub default_deduplicate: bool,
    /// Whether search results carry `attachment_ids` when the caller does
    /// not ask for metadata explicitly.
    pub default_attachment_ids_show: bool,
    /// Neighbor count handed to the merge-decision call during deduplication.
    pub dedup_top_k: usize,
}

impl Default for MemoryDefaults {
    fn default() -> Self {
        Self {
            default_infer: true,
            default_extract: true,
            default_deduplicate: true,
            default_attachment_ids_show: false,
            dedup_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentSettings {
    /// Ceiling on attachment content, in MiB of UTF-8 bytes.  Overridden at
    /// runtime by the `ATTACHMENT_MAX_SIZE_MB` environment variable.
    pub max_size_mb: usize,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self { max_size_mb: 100 }
    }
}

impl AttachmentSettings {
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub vector: VectorSettings,
    pub memory: MemoryDefaults,
    pub attachments: AttachmentSettings,
}

impl Settings {
    /// Overlay environment variables on top of the persisted document.
    /// Applied after every load so operators can steer a deployment without
    /// touching the stored settings.
    pub fn apply_env(&mut self) {
        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                self.llm.provider = "ollama".to_string();
                self.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("OPENAI_BASE_URL") {
            if !value.is_empty() {
                self.llm.provider = "openai".to_string();
                self.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("OPENAI_API_KEY") {
            if !value.is_empty() {
                self.llm.api_key = Some(value);
            }
        }
        if let Ok(value) = env::var("QDRANT_URL") {
            if !value.is_empty() {
                self.vector.url = value;
            }
        }
        if let Ok(value) = env::var("QDRANT_API_KEY") {
            if !value.is_empty() {
                self.vector.api_key = Some(value);
            }
        }
        if let Ok(value) = env::var("ATTACHMENT_MAX_SIZE_MB") {
            if let Ok(mb) = value.parse::<usize>() {
                self.attachments.max_size_mb = mb;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_the_inference_path() {
        let settings = Settings::default();
        assert!(settings.memory.default_infer);
        assert!(settings.memory.default_extract);
        assert!(settings.memory.default_deduplicate);
        assert!(!settings.memory.default_attachment_ids_show);
    }

    #[test]
    fn attachment_ceiling_defaults_to_100_mib() {
        let settings = Settings::default();
        assert_eq!(settings.attachments.max_size_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn unknown_sections_round_trip_through_serde_defaults() {
        // A persisted document from an older build may miss whole sections;
        // every section falls back to its Default.
        let settings: Settings = serde_json::from_str(r#"{"llm": {"model": "qwen2.5:7b"}}"#)
            .expect("partial document deserializes");
        assert_eq!(settings.llm.model, "qwen2.5:7b");
        assert_eq!(settings.vector.collection, "engram_memories");
        assert_eq!(settings.memory.dedup_top_k, 5);
    }
}
