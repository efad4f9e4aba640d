pub mod batch;
pub mod cancel;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod repository;
pub mod retry;
pub mod service;
pub mod store;
pub mod tokenizer;
pub mod wiki;

pub use batch::BatchEmbedder;
pub use cancel::CancellationToken;
pub use chunking::Chunker;
pub use config::{
    ChunkingConfig, EmbeddingConfig, GenerationConfig, IngestConfig, RagConfig, RetrievalConfig, RetryConfig,
};
pub use embeddings::{EmbeddingProvider, HashingEmbedder, ProviderCapabilities, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{ProviderError, ProviderErrorKind, RagError, RepositoryError};
pub use generation::{Generation, GenerationOptions, GenerationProvider, Prompt, TextStream};
pub use ingest::{FilterConfig, IngestionPipeline, IngestionReport, SkippedFile};
pub use memory::{ConversationMemory, SessionContext};
pub use models::{Chunk, DialogTurn, Document, DocumentKind, ResearchIteration, RetrievalResult};
pub use orchestrator::{Answer, AnswerOptions, AnswerState, AnswerStream, RagOrchestrator, SourceRef};
pub use repository::{GitRepository, LocalRepository, RepoHost, RepoLocation, RepositorySource};
pub use retry::RetryPolicy;
pub use service::{IngestStatus, RagService};
pub use store::{StoreHandle, VectorStore};
pub use tokenizer::{Tokenizer, TokenizerKind};
pub use wiki::{WikiDepth, WikiGenerator, WikiReport, WikiRequest, WikiStructure};
