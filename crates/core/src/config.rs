use crate::error::RagError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub retry: RetryConfig,
    pub retrieval: RetrievalConfig,
    pub ingest: IngestConfig,
}

impl RagConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, RagError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, RagError> {
        let config: Self = toml::from_str(raw).map_err(|error| RagError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RagError> {
        if self.chunking.max_tokens == 0 {
            return Err(RagError::Config("chunking.max_tokens must be positive".to_string()));
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(RagError::Config(format!(
                "chunking.overlap_tokens {} must be below max_tokens {}",
                self.chunking.overlap_tokens, self.chunking.max_tokens
            )));
        }
        if self.embedding.parallelism == 0 {
            return Err(RagError::Config("embedding.parallelism must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(RagError::Config("retry.max_attempts must be positive".to_string()));
        }
        if self.retrieval.max_research_iterations == 0 {
            return Err(RagError::Config(
                "retrieval.max_research_iterations must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 350,
            overlap_tokens: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hashing`, `openai` or `ollama`.
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Name of the environment variable that holds the API key.
    pub api_key_env: Option<String>,
    pub dimension: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub token_ceiling: Option<usize>,
    pub parallelism: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: None,
            base_url: None,
            api_key_env: None,
            dimension: None,
            max_batch_size: None,
            token_ceiling: None,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// `openai` or `ollama`.
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "qwen3:8b".to_string(),
            base_url: None,
            api_key_env: None,
            temperature: 0.2,
            max_output_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            attempt_timeout_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub context_token_budget: usize,
    pub history_turns: usize,
    pub max_research_iterations: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            context_token_budget: 6_000,
            history_turns: 5,
            max_research_iterations: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_embedding_file_tokens: usize,
    pub max_context_file_tokens: usize,
    pub store_dir: PathBuf,
    pub clone_dir: PathBuf,
    /// Conversation journals, one JSON-lines file per session.
    pub session_dir: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_embedding_file_tokens: 8_192,
            max_context_file_tokens: 32_768,
            store_dir: PathBuf::from(".codebase-rag/stores"),
            clone_dir: PathBuf::from(".codebase-rag/repos"),
            session_dir: PathBuf::from(".codebase-rag/sessions"),
        }
    }
}

pub fn read_api_key(env_name: Option<&str>) -> Result<Option<String>, RagError> {
    let Some(name) = env_name else {
        return Ok(None);
    };
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(value.trim().to_string())),
        _ => Err(RagError::Config(format!("environment variable {name} is not set"))),
    }
}
