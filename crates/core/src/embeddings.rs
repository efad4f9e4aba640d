use crate::error::{ProviderError, ProviderErrorKind};
use crate::tokenizer::TokenizerKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;
pub const DEFAULT_TOKEN_CEILING: usize = 8_192;

/// Static facts about a provider, selected by configuration rather than by inspecting responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub provider_id: String,
    /// 1 when the vendor has no batch endpoint.
    pub max_batch_size: usize,
    pub dimension: usize,
    pub token_ceiling: usize,
    pub tokenizer: TokenizerKind,
}

impl ProviderCapabilities {
    pub fn supports_batch(&self) -> bool {
        self.max_batch_size > 1
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn capabilities(&self) -> &ProviderCapabilities;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let _ = texts;
        Err(ProviderError::new(
            ProviderErrorKind::BadRequest,
            &self.capabilities().provider_id,
            "batch embedding not supported",
        ))
    }
}

/// Offline provider: hashed character trigrams, L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    capabilities: ProviderCapabilities,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            capabilities: ProviderCapabilities {
                provider_id: format!("hashing-{}", dimension.max(1)),
                max_batch_size: 64,
                dimension: dimension.max(1),
                token_ceiling: DEFAULT_TOKEN_CEILING,
                tokenizer: TokenizerKind::Lexical,
            },
        }
    }

    pub fn with_token_ceiling(mut self, token_ceiling: usize) -> Self {
        self.capabilities.token_ceiling = token_ceiling;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.capabilities.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.capabilities.dimension];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        let mut bump = |token: &[char]| {
            let mut hash = 1469598103934665603u64;
            for character in token {
                let mut buffer = [0u8; 4];
                for byte in character.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        };

        if chars.len() < 3 {
            bump(&chars);
        } else {
            for window in chars.windows(3) {
                bump(window);
            }
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_text(text))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm < f32::EPSILON || right_norm < f32::EPSILON {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}
