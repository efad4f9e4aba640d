use crate::cancel::CancellationToken;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use tokio::sync::mpsc;

pub const STREAM_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    /// Ask for a `{"rationale", "answer"}` JSON object instead of free text.
    pub structured: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_output_tokens: None,
            structured: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Structured { rationale: String, answer: String },
    Text(String),
}

#[derive(Deserialize)]
struct StructuredReply {
    #[serde(default)]
    rationale: String,
    answer: String,
}

impl Generation {
    /// Recognizes a structured reply, optionally wrapped in a json code fence; anything else is text.
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        let unfenced = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|rest| rest.strip_suffix("```"))
            .map(str::trim)
            .unwrap_or(trimmed);

        if unfenced.starts_with('{') {
            if let Ok(reply) = serde_json::from_str::<StructuredReply>(unfenced) {
                return Self::Structured {
                    rationale: reply.rationale,
                    answer: reply.answer,
                };
            }
        }
        Self::Text(raw.to_string())
    }

    pub fn answer(&self) -> &str {
        match self {
            Self::Structured { answer, .. } => answer,
            Self::Text(text) => text,
        }
    }

    pub fn rationale(&self) -> Option<&str> {
        match self {
            Self::Structured { rationale, .. } if !rationale.is_empty() => Some(rationale),
            _ => None,
        }
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn generate(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<Generation, ProviderError>;

    /// Fragments of the reply as they arrive. The default delivers the whole reply as one fragment.
    async fn stream(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<TextStream, ProviderError> {
        let generation = self.generate(prompt, options).await?;
        let (sender, stream) = TextStream::channel(1);
        sender.send(Ok(generation.answer().to_string())).await;
        Ok(stream)
    }
}

#[derive(Debug, Clone)]
pub struct StreamSender {
    sender: mpsc::Sender<Result<String, ProviderError>>,
}

impl StreamSender {
    /// Returns false once the consumer is gone; producers stop on false.
    pub async fn send(&self, fragment: Result<String, ProviderError>) -> bool {
        self.sender.send(fragment).await.is_ok()
    }
}

/// Bounded fragment stream. Dropping it or calling `cancel` stops the producing task.
#[derive(Debug)]
pub struct TextStream {
    receiver: mpsc::Receiver<Result<String, ProviderError>>,
    cancel: CancellationToken,
}

impl TextStream {
    pub fn channel(capacity: usize) -> (StreamSender, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            StreamSender { sender },
            Self {
                receiver,
                cancel: CancellationToken::new(),
            },
        )
    }

    /// Runs `producer` on its own task; it is aborted when this stream is cancelled or dropped,
    /// or when `parent` fires.
    pub fn spawn<F, Fut>(parent: Option<CancellationToken>, producer: F) -> Self
    where
        F: FnOnce(StreamSender) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, stream) = Self::channel(STREAM_BUFFER);
        let own = stream.cancel.clone();
        let parent = parent.unwrap_or_default();
        tokio::spawn(async move {
            tokio::select! {
                _ = own.cancelled() => {}
                _ = parent.cancelled() => {}
                _ = producer(sender) => {}
            }
        });
        stream
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next(&mut self) -> Option<Result<String, ProviderError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            fragment = self.receiver.recv() => fragment,
        }
    }

    pub async fn collect_text(mut self) -> Result<String, ProviderError> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
