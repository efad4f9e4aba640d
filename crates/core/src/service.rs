use crate::batch::BatchEmbedder;
use crate::cancel::CancellationToken;
use crate::config::RagConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::RagError;
use crate::generation::{GenerationOptions, GenerationProvider};
use crate::ingest::{FilterConfig, IngestionPipeline, IngestionReport};
use crate::memory::{journal_path, ConversationMemory, SessionContext};
use crate::models::DialogTurn;
use crate::orchestrator::{Answer, AnswerOptions, AnswerStream, RagOrchestrator};
use crate::providers::{create_embedding_provider, create_generation_provider};
use crate::repository::{GitRepository, RepoLocation, RepositorySource};
use crate::retry::RetryPolicy;
use crate::store::{StoreHandle, VectorStore};
use crate::wiki::{WikiGenerator, WikiReport, WikiRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub repository: String,
    pub repository_id: String,
    pub report: IngestionReport,
}

#[derive(Debug, Clone)]
struct ActiveRepository {
    location: RepoLocation,
    root: PathBuf,
}

/// Entry point for callers: owns the providers, the current store and the open sessions.
pub struct RagService {
    config: RagConfig,
    source: Arc<dyn RepositorySource>,
    pipeline: IngestionPipeline,
    orchestrator: RagOrchestrator,
    store: StoreHandle,
    active: RwLock<Option<ActiveRepository>>,
    sessions: Mutex<HashMap<String, SessionContext>>,
    persist_sessions: bool,
}

impl RagService {
    /// Builds providers from config and clones remotes with `git`.
    pub fn from_config(config: RagConfig) -> Result<Self, RagError> {
        let embedding = create_embedding_provider(&config.embedding)?;
        let generation = create_generation_provider(&config.generation)?;
        let source = Arc::new(GitRepository::new(config.ingest.clone_dir.clone()));
        Self::new(config, embedding, generation, source)
    }

    pub fn new(
        config: RagConfig,
        embedding: Arc<dyn EmbeddingProvider>,
        generation: Arc<dyn GenerationProvider>,
        source: Arc<dyn RepositorySource>,
    ) -> Result<Self, RagError> {
        config.validate()?;
        let policy = RetryPolicy::from(config.retry);
        let embedder = Arc::new(BatchEmbedder::new(embedding, policy, config.embedding.parallelism)?);
        let pipeline = IngestionPipeline::new(
            embedder.clone(),
            config.chunking,
            config.ingest.clone(),
            config.embedding.parallelism,
        )?;
        let orchestrator = RagOrchestrator::new(
            embedder,
            generation,
            policy,
            config.retrieval,
            GenerationOptions {
                temperature: config.generation.temperature,
                max_output_tokens: config.generation.max_output_tokens,
                structured: true,
            },
        );

        Ok(Self {
            config,
            source,
            pipeline,
            orchestrator,
            store: StoreHandle::default(),
            active: RwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
            persist_sessions: false,
        })
    }

    /// Sessions journal their turns under `ingest.session_dir` and survive restarts.
    pub fn with_persistent_sessions(mut self, enabled: bool) -> Self {
        self.persist_sessions = enabled;
        self
    }

    /// Ingests `location` and makes it the store every later question reads.
    pub async fn ingest(
        &self,
        location: &RepoLocation,
        filter: &FilterConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<IngestStatus, RagError> {
        let outcome = self
            .pipeline
            .ingest(self.source.as_ref(), location, filter, cancel)
            .await?;

        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(ActiveRepository {
            location: location.clone(),
            root: outcome.tree.root.clone(),
        });
        let store = self.store.replace(outcome.store);
        info!(repository = %location, chunks = store.len(), "store swapped in");

        Ok(IngestStatus {
            repository: location.to_string(),
            repository_id: location.repository_id(),
            report: outcome.report,
        })
    }

    pub async fn answer(&self, question: &str, session_id: &str, options: &AnswerOptions) -> Result<Answer, RagError> {
        let session = self.session(session_id).await?;
        let store = self.current_store()?;
        self.orchestrator.answer(&store, &session, question, options).await
    }

    pub async fn answer_stream(
        &self,
        question: &str,
        session_id: &str,
        options: &AnswerOptions,
    ) -> Result<AnswerStream, RagError> {
        let session = self.session(session_id).await?;
        let store = self.current_store()?;
        self.orchestrator.answer_stream(&store, &session, question, options).await
    }

    /// Turns of a session, oldest first. Unknown sessions have no history.
    pub async fn history(&self, session_id: &str) -> Result<Vec<DialogTurn>, RagError> {
        let session_id = non_empty_session(session_id)?;
        if let Some(session) = self.sessions.lock().await.get(session_id) {
            return Ok(session.memory.history());
        }
        if !self.persist_sessions {
            return Ok(Vec::new());
        }

        let path = journal_path(&self.config.ingest.session_dir, session_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        Ok(ConversationMemory::open(path).await?.history())
    }

    /// Forgets an open session; a persisted journal stays on disk.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let closed = self.sessions.lock().await.remove(session_id.trim()).is_some();
        debug!(session = %session_id, closed, "session closed");
        closed
    }

    /// Session for `session_id`, opened on first use.
    pub async fn session(&self, session_id: &str) -> Result<SessionContext, RagError> {
        let session_id = non_empty_session(session_id)?;
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(session_id) {
            return Ok(session.clone());
        }

        let session = if self.persist_sessions {
            SessionContext::open(session_id, &self.config.ingest.session_dir).await?
        } else {
            SessionContext::new(session_id)?
        };
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn current_store(&self) -> Result<Arc<VectorStore>, RagError> {
        self.store
            .snapshot()
            .ok_or_else(|| RagError::State("no repository has been ingested yet".to_string()))
    }

    /// Whole file from the ingested repository, bounded by the context ceiling.
    pub async fn read_file(&self, path: &str) -> Result<String, RagError> {
        let active = self.active_repository()?;
        self.pipeline.read_for_context(&active.root, path).await
    }

    /// Writes a Markdown wiki for the ingested repository.
    pub async fn generate_wiki(&self, request: &WikiRequest) -> Result<WikiReport, RagError> {
        let active = self.active_repository()?;
        let store = self.current_store()?;

        let readme_path = store
            .documents()
            .iter()
            .map(|document| document.path.as_str())
            .filter(|path| !path.contains('/'))
            .find(|path| path.to_ascii_lowercase().starts_with("readme"))
            .map(str::to_string);
        let readme = match readme_path {
            Some(path) => match self.read_file(&path).await {
                Ok(text) => Some(text),
                Err(error) => {
                    warn!(path = %path, %error, "readme not used for wiki planning");
                    None
                }
            },
            None => None,
        };

        WikiGenerator::new(&self.orchestrator, &store, &active.location)
            .generate(readme.as_deref(), request)
            .await
    }

    fn active_repository(&self) -> Result<ActiveRepository, RagError> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RagError::State("no repository has been ingested yet".to_string()))
    }
}

fn non_empty_session(session_id: &str) -> Result<&str, RagError> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(RagError::State("session id must not be empty".to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::error::ProviderError;
    use crate::generation::{Generation, Prompt};
    use crate::repository::LocalRepository;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct NumberedGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationProvider for NumberedGenerator {
        fn provider_id(&self) -> &str {
            "numbered"
        }

        async fn generate(&self, _prompt: &Prompt, _options: &GenerationOptions) -> Result<Generation, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Generation::Text(format!("answer {call}")))
        }
    }

    fn repository(root: &Path) -> Result<RepoLocation, std::io::Error> {
        std::fs::create_dir_all(root.join("src"))?;
        std::fs::write(root.join("README.md"), "# Demo\n\nA demo service that stores vectors.")?;
        std::fs::write(root.join("src/lib.rs"), "pub fn store_vectors() -> usize { 3 }")?;
        Ok(RepoLocation::Local(root.to_path_buf()))
    }

    fn service(work: &Path) -> Result<RagService, RagError> {
        let mut config = RagConfig::default();
        config.ingest.store_dir = work.join("stores");
        config.ingest.session_dir = work.join("sessions");
        RagService::new(
            config,
            Arc::new(HashingEmbedder::new(32)),
            Arc::new(NumberedGenerator::default()),
            Arc::new(LocalRepository),
        )
    }

    #[tokio::test]
    async fn answering_needs_a_session_and_an_ingested_repository() -> Result<(), Box<dyn std::error::Error>> {
        let work = tempdir()?;
        let service = service(work.path())?;
        let options = AnswerOptions::default();

        assert!(matches!(service.answer("q", "  ", &options).await, Err(RagError::State(_))));
        assert!(matches!(service.answer("q", "s1", &options).await, Err(RagError::State(_))));
        assert!(matches!(service.history("").await, Err(RagError::State(_))));
        Ok(())
    }

    #[tokio::test]
    async fn sessions_keep_separate_histories() -> Result<(), Box<dyn std::error::Error>> {
        let work = tempdir()?;
        let location = repository(&work.path().join("repo"))?;
        let service = service(work.path())?;

        let status = service.ingest(&location, &FilterConfig::default(), None).await?;
        assert_eq!(status.report.documents, 2);
        assert_eq!(status.repository_id, location.repository_id());

        let first = service.answer("what stores vectors?", "alice", &AnswerOptions::default()).await?;
        service.answer("and the readme?", "alice", &AnswerOptions::default()).await?;
        service.answer("hello", "bob", &AnswerOptions::default()).await?;

        assert_eq!(first.text, "answer 1");
        assert_eq!(service.history("alice").await?.len(), 2);
        assert_eq!(service.history("bob").await?.len(), 1);
        assert!(service.history("carol").await?.is_empty());

        assert!(service.close_session("alice").await);
        assert!(!service.close_session("alice").await);
        assert!(service.history("alice").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn persistent_sessions_survive_close() -> Result<(), Box<dyn std::error::Error>> {
        let work = tempdir()?;
        let location = repository(&work.path().join("repo"))?;
        let service = service(work.path())?.with_persistent_sessions(true);
        service.ingest(&location, &FilterConfig::default(), None).await?;

        service.answer("what stores vectors?", "alice", &AnswerOptions::default()).await?;
        service.close_session("alice").await;

        let history = service.history("alice").await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].answer, "answer 1");

        service.answer("again", "alice", &AnswerOptions::default()).await?;
        let reopened = service.history("alice").await?;
        assert_eq!(reopened.iter().map(|turn| turn.id).collect::<Vec<_>>(), vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn lookalike_session_ids_never_share_history() -> Result<(), Box<dyn std::error::Error>> {
        let work = tempdir()?;
        let location = repository(&work.path().join("repo"))?;
        let service = service(work.path())?.with_persistent_sessions(true);
        service.ingest(&location, &FilterConfig::default(), None).await?;

        service
            .answer("alice secret question", "team/alice", &AnswerOptions::default())
            .await?;
        service.close_session("team/alice").await;

        assert!(service.history("team_alice").await?.is_empty());
        assert!(service.history("team:alice").await?.is_empty());
        assert_eq!(service.history("team/alice").await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn file_reads_are_confined_to_the_repository() -> Result<(), Box<dyn std::error::Error>> {
        let work = tempdir()?;
        let location = repository(&work.path().join("repo"))?;
        std::fs::write(work.path().join("secret.txt"), "TOP SECRET")?;
        let service = service(work.path())?;
        service.ingest(&location, &FilterConfig::default(), None).await?;

        assert!(service.read_file("src/lib.rs").await?.contains("store_vectors"));
        assert!(matches!(service.read_file("../secret.txt").await, Err(RagError::Input(_))));
        let absolute = work.path().join("secret.txt");
        assert!(matches!(
            service.read_file(&absolute.to_string_lossy()).await,
            Err(RagError::Input(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn reingest_swaps_the_store_without_breaking_readers() -> Result<(), Box<dyn std::error::Error>> {
        let work = tempdir()?;
        let first = repository(&work.path().join("one"))?;
        let second_root = work.path().join("two");
        std::fs::create_dir_all(&second_root)?;
        std::fs::write(second_root.join("main.py"), "print('only file')")?;
        let second = RepoLocation::Local(second_root);
        let service = service(work.path())?;

        service.ingest(&first, &FilterConfig::default(), None).await?;
        let held = service.current_store()?;
        service.ingest(&second, &FilterConfig::default(), None).await?;

        assert_eq!(held.documents().len(), 2);
        assert_eq!(service.current_store()?.documents().len(), 1);
        assert_eq!(service.read_file("main.py").await?, "print('only file')");
        Ok(())
    }
}
