use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Code,
    Doc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub path: String,
    pub raw_text: String,
    pub kind: DocumentKind,
    pub token_count: usize,
}

impl Document {
    pub fn new(repository_id: &str, path: &str, raw_text: String, kind: DocumentKind, token_count: usize) -> Self {
        Self {
            id: document_id(repository_id, path),
            path: path.to_string(),
            raw_text,
            kind,
            token_count,
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            path: self.path.clone(),
            kind: self.kind,
            token_count: self.token_count,
        }
    }
}

/// What the store keeps about a document once its raw text is gone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: String,
    pub path: String,
    pub kind: DocumentKind,
    pub token_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub document_id: String,
    pub path: String,
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmbedFailure {
    Skipped,
    Capacity { tokens: usize, ceiling: usize },
    Invalid(String),
    Provider(crate::ProviderError),
    Cancelled,
}

impl std::fmt::Display for EmbedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped => f.write_str("empty input skipped"),
            Self::Capacity { tokens, ceiling } => {
                write!(f, "input has {tokens} tokens, ceiling is {ceiling}")
            }
            Self::Invalid(reason) => write!(f, "invalid input: {reason}"),
            Self::Provider(error) => write!(f, "{error}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatchResult {
    pub input_index: usize,
    pub outcome: Result<Vec<f32>, EmbedFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialogTurn {
    pub id: u64,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

/// Points at a stored chunk by its ingestion position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRef {
    pub position: usize,
    pub document_id: String,
    pub path: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub chunk_ref: ChunkRef,
    pub score: f32,
    pub text: String,
    pub token_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchIteration {
    pub index: usize,
    pub plan: String,
    pub findings: String,
    pub is_final: bool,
}

pub fn document_id(repository_id: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn text_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_stable_per_repository_and_path() {
        let first = document_id("repo-a", "src/lib.rs");
        assert_eq!(first, document_id("repo-a", "src/lib.rs"));
        assert_ne!(first, document_id("repo-b", "src/lib.rs"));
        assert_ne!(first, document_id("repo-a", "src/main.rs"));
    }

    #[test]
    fn document_kind_serializes_lowercase() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(serde_json::to_string(&DocumentKind::Code)?, "\"code\"");
        Ok(())
    }
}
