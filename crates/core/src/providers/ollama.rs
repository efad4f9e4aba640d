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

const PROVIDER: &str = "ollama";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
const DEFAULT_DIMENSION: usize = 768;
const DEFAULT_TOKEN_CEILING: usize = 8_192;

/// Single-input embedder; `/api/embeddings` takes one prompt per request.
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    capabilities: ProviderCapabilities,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, RagError> {
        let base = parse_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let model = config.model.clone().unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());
        let dimension = config.dimension.unwrap_or(DEFAULT_DIMENSION);
        Ok(Self {
            client: Client::new(),
            endpoint: format!("{base}/api/embeddings"),
            capabilities: ProviderCapabilities {
                provider_id: format!("{PROVIDER}:{model}:{dimension}"),
                max_batch_size: 1,
                dimension,
                token_ceiling: config.token_ceiling.unwrap_or(DEFAULT_TOKEN_CEILING),
                tokenizer: TokenizerKind::Lexical,
            },
            model,
        })
    }
}

#[derive(Deserialize)]
struct OllamaEmbedding {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|error| ProviderError::from_reqwest(PROVIDER, error))?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }
        let parsed: OllamaEmbedding = response
            .json()
            .await
            .map_err(|error| malformed(PROVIDER, error.to_string()))?;
        if parsed.embedding.is_empty() {
            return Err(malformed(PROVIDER, "empty embedding"));
        }
        Ok(parsed.embedding)
    }
}

pub struct OllamaGenerator {
    client: Client,
    endpoint: String,
    model: String,
    provider_id: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, RagError> {
        let base = parse_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        Ok(Self {
            client: Client::new(),
            endpoint: format!("{base}/api/chat"),
            provider_id: format!("{PROVIDER}:{}", config.model),
            model: config.model.clone(),
        })
    }

    fn body(&self, prompt: &Prompt, options: &GenerationOptions, stream: bool) -> Value {
        let mut model_options = json!({ "temperature": options.temperature });
        if let Some(max_tokens) = options.max_output_tokens {
            model_options["num_predict"] = json!(max_tokens);
        }
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "stream": stream,
            "options": model_options,
        });
        if options.structured && !stream {
            body["format"] = json!("json");
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(body)
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
impl GenerationProvider for OllamaGenerator {
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
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(PROVIDER, "missing message.content"))?;
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
                    match parse_ndjson_line(&line) {
                        NdjsonLine::Done => return,
                        NdjsonLine::Skip => {}
                        NdjsonLine::Fragment(fragment) => {
                            if !sender.send(fragment).await {
                                return;
                            }
                        }
                    }
                }
            }
            if let Some(rest) = lines.finish() {
                if let NdjsonLine::Fragment(fragment) = parse_ndjson_line(&rest) {
                    sender.send(fragment).await;
                }
            }
        }))
    }
}

#[derive(Debug, PartialEq)]
enum NdjsonLine {
    Fragment(Result<String, ProviderError>),
    Skip,
    Done,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

fn parse_ndjson_line(line: &str) -> NdjsonLine {
    let line = line.trim();
    if line.is_empty() {
        return NdjsonLine::Skip;
    }
    match serde_json::from_str::<ChatChunk>(line) {
        Ok(chunk) => {
            let content = chunk.message.map(|message| message.content).unwrap_or_default();
            if !content.is_empty() {
                NdjsonLine::Fragment(Ok(content))
            } else if chunk.done {
                NdjsonLine::Done
            } else {
                NdjsonLine::Skip
            }
        }
        Err(error) => NdjsonLine::Fragment(Err(malformed(PROVIDER, error.to_string()))),
    }
}
