use super::{malformed, parse_base_url, status_error, LineBuffer};
use crate::config::{EmbeddingConfig, GenerationConfig};
use crate::embeddings::{EmbeddingProvider, ProviderCapabilities};
use crate::error::{ProviderError, RagError};
use crate::generation::{Generation, GenerationOptions, GenerationProvider, Prompt, TextStream};
use crate::tokenizer::TokenizerKind;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_DIMENSION: usize = 1_536;
const DEFAULT_BATCH: usize = 64;
const DEFAULT_TOKEN_CEILING: usize = 8_191;

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    capabilities: ProviderCapabilities,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: Option<String>) -> Result<Self, RagError> {
        let base = parse_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let model = config.model.clone().unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());
        let dimension = config.dimension.unwrap_or(DEFAULT_DIMENSION);
        Ok(Self {
            client: Client::new(),
            endpoint: format!("{base}/v1/embeddings"),
            capabilities: ProviderCapabilities {
                provider_id: format!("{PROVIDER}:{model}:{dimension}"),
                max_batch_size: config.max_batch_size.unwrap_or(DEFAULT_BATCH).max(1),
                dimension,
                token_ceiling: config.token_ceiling.unwrap_or(DEFAULT_TOKEN_CEILING),
                tokenizer: TokenizerKind::CharEstimate { chars_per_token: 4 },
            },
            model,
            api_key,
        })
    }

    async fn request(&self, input: Value) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "model": self.model,
            "input": input,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| ProviderError::from_reqwest(PROVIDER, error))?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| malformed(PROVIDER, error.to_string()))?;
        let mut data = parsed.data;
        data.sort_by_key(|item| item.index);
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.request(json!(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| malformed(PROVIDER, "empty embedding list"))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        debug!(count = texts.len(), model = %self.model, "openai embedding batch");
        self.request(json!(texts)).await
    }
}

pub struct OpenAiGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    provider_id: String,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig, api_key: Option<String>) -> Result<Self, RagError> {
        let base = parse_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        Ok(Self {
            client: Client::new(),
            endpoint: format!("{base}/v1/chat/completions"),
            provider_id: format!("{PROVIDER}:{}", config.model),
            model: config.model.clone(),
            api_key,
        })
    }

    fn body(&self, prompt: &Prompt, options: &GenerationOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "temperature": options.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = options.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if options.structured && !stream {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|error| ProviderError::from_reqwest(PROVIDER, error))?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn generate(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<Generation, ProviderError> {
        let response = self.send(&self.body(prompt, options, false)).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|error| malformed(PROVIDER, error.to_string()))?;
        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(PROVIDER, "missing choices[0].message.content"))?;
        Ok(Generation::from_text(content))
    }

    async fn stream(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<TextStream, ProviderError> {
        let mut response = self.send(&self.body(prompt, options, true)).await?;
        Ok(TextStream::spawn(None, |sender| async move {
            let mut lines = LineBuffer::default();
            loop {
                let bytes = match response.chunk().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(error) => {
                        sender.send(Err(ProviderError::from_reqwest(PROVIDER, error))).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    match parse_sse_line(&line) {
                        SseLine::Done => return,
                        SseLine::Skip => {}
                        SseLine::Fragment(fragment) => {
                            if !sender.send(fragment).await {
                                return;
                            }
                        }
                    }
                }
            }
        }))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(Result<String, ProviderError>),
    Skip,
    Done,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => match value.pointer("/choices/0/delta/content").and_then(Value::as_str) {
            Some(content) if !content.is_empty() => SseLine::Fragment(Ok(content.to_string())),
            _ => SseLine::Skip,
        },
        Err(error) => SseLine::Fragment(Err(malformed(PROVIDER, error.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_are_classified() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseLine::Fragment(Ok("Hi".to_string()))
        );
        assert_eq!(parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert!(matches!(parse_sse_line("data: {oops"), SseLine::Fragment(Err(_))));
    }

    #[test]
    fn capabilities_follow_config() -> Result<(), Box<dyn std::error::Error>> {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            model: Some("text-embedding-3-large".to_string()),
            dimension: Some(3_072),
            max_batch_size: Some(16),
            ..EmbeddingConfig::default()
        };
        let embedder = OpenAiEmbedder::new(&config, None)?;
        let capabilities = embedder.capabilities();
        assert_eq!(capabilities.dimension, 3_072);
        assert_eq!(capabilities.max_batch_size, 16);
        assert_eq!(capabilities.provider_id, "openai:text-embedding-3-large:3072");
        Ok(())
    }

    #[test]
    fn structured_requests_ask_for_json_objects() -> Result<(), Box<dyn std::error::Error>> {
        let generator = OpenAiGenerator::new(&GenerationConfig::default(), None)?;
        let prompt = Prompt {
            system: "sys".to_string(),
            user: "question".to_string(),
        };
        let options = GenerationOptions {
            structured: true,
            max_output_tokens: Some(256),
            ..GenerationOptions::default()
        };
        let body = generator.body(&prompt, &options, false);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][1]["content"], "question");
        Ok(())
    }
}
