pub mod ollama;
pub mod openai;

pub use ollama::{OllamaEmbedder, OllamaGenerator};
pub use openai::{OpenAiEmbedder, OpenAiGenerator};

use crate::config::{read_api_key, EmbeddingConfig, GenerationConfig};
use crate::embeddings::{EmbeddingProvider, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
use crate::error::{ProviderError, ProviderErrorKind, RagError};
use crate::generation::GenerationProvider;
use reqwest::header::RETRY_AFTER;
use reqwest::Response;
use std::sync::Arc;
use std::time::Duration;

pub fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, RagError> {
    match config.provider.as_str() {
        "hashing" => {
            let mut embedder = HashingEmbedder::new(config.dimension.unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS));
            if let Some(ceiling) = config.token_ceiling {
                embedder = embedder.with_token_ceiling(ceiling);
            }
            if let Some(batch) = config.max_batch_size {
                embedder = embedder.with_max_batch_size(batch);
            }
            Ok(Arc::new(embedder))
        }
        "openai" => {
            let api_key = read_api_key(Some(config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY")))?;
            Ok(Arc::new(OpenAiEmbedder::new(config, api_key)?))
        }
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => Err(RagError::Config(format!("unknown embedding provider: {other}"))),
    }
}

pub fn create_generation_provider(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>, RagError> {
    match config.provider.as_str() {
        "openai" => {
            let api_key = read_api_key(Some(config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY")))?;
            Ok(Arc::new(OpenAiGenerator::new(config, api_key)?))
        }
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => Err(RagError::Config(format!("unknown generation provider: {other}"))),
    }
}

pub(crate) fn parse_base_url(raw: &str) -> Result<String, RagError> {
    let parsed = url::Url::parse(raw).map_err(|error| RagError::Config(format!("invalid base url {raw}: {error}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RagError::Config(format!("base url must be http(s): {raw}")));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Turns a non-success response into the shared taxonomy; the body is sanitized by `ProviderError::new`.
pub(crate) async fn status_error(provider: &str, response: Response) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    ProviderError::new(
        ProviderErrorKind::from_status(status.as_u16()),
        provider,
        format!("{status}: {body}"),
    )
    .with_retry_after(retry_after)
}

pub(crate) fn malformed(provider: &str, details: impl AsRef<str>) -> ProviderError {
    ProviderError::new(
        ProviderErrorKind::BadRequest,
        provider,
        format!("malformed response: {}", details.as_ref()),
    )
}

/// Splits a byte stream into complete lines, keeping any trailing partial line for the next push.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=position).collect();
            let text = String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string();
            lines.push(text);
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_joins_split_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.push(b":1}\r\ndata: [DO"), vec!["data: {\"a\":1}".to_string()]);
        assert_eq!(buffer.push(b"NE]\n"), vec!["data: [DONE]".to_string()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn base_urls_are_validated_and_trimmed() {
        assert_eq!(
            parse_base_url("http://localhost:11434/").ok().as_deref(),
            Some("http://localhost:11434")
        );
        assert!(parse_base_url("ftp://example.com").is_err());
        assert!(parse_base_url("not a url").is_err());
    }

    #[test]
    fn unknown_providers_are_config_errors() {
        let config = EmbeddingConfig {
            provider: "mystery".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(create_embedding_provider(&config), Err(RagError::Config(_))));
    }

    #[test]
    fn hashing_provider_honours_configured_capabilities() -> Result<(), Box<dyn std::error::Error>> {
        let config = EmbeddingConfig {
            dimension: Some(16),
            token_ceiling: Some(100),
            max_batch_size: Some(1),
            ..EmbeddingConfig::default()
        };
        let provider = create_embedding_provider(&config)?;
        let capabilities = provider.capabilities();
        assert_eq!(capabilities.dimension, 16);
        assert_eq!(capabilities.token_ceiling, 100);
        assert!(!capabilities.supports_batch());
        Ok(())
    }
}
