use crate::batch::BatchEmbedder;
use crate::cancel::CancellationToken;
use crate::chunking::Chunker;
use crate::config::{ChunkingConfig, IngestConfig};
use crate::error::RagError;
use crate::models::{Document, DocumentKind, DocumentSummary, EmbedFailure};
use crate::repository::{RepoLocation, RepositorySource, RepositoryTree};
use crate::store::{StoreLoad, StoredChunk, VectorStore};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".bzr",
    "node_modules",
    "bower_components",
    "jspm_packages",
    ".venv",
    "venv",
    "env",
    "virtualenv",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".tox",
    ".eggs",
    "target",
    "dist",
    "build",
    "out",
    "bin",
    "obj",
    ".next",
    ".nuxt",
    ".idea",
    ".vscode",
    "coverage",
    "htmlcov",
    "lib-cov",
    ".cache",
    "logs",
];

pub const DEFAULT_EXCLUDED_FILES: &[&str] = &[
    "yarn.lock",
    "pnpm-lock.yaml",
    "npm-shrinkwrap.json",
    "poetry.lock",
    "Pipfile.lock",
    "Cargo.lock",
    "composer.lock",
    "Gemfile.lock",
    "package-lock.json",
    "*.lock",
    "*.min.js",
    "*.min.css",
    "*.bundle.js",
    "*.map",
    ".DS_Store",
    "Thumbs.db",
    ".env",
    "*.log",
    "*.pyc",
    "*.pyo",
    "*.class",
    "*.o",
    "*.a",
    "*.so",
    "*.dll",
    "*.dylib",
    "*.exe",
    "*.bin",
    "*.jar",
    "*.war",
    "*.zip",
    "*.tar",
    "*.gz",
    "*.tgz",
    "*.rar",
    "*.7z",
    "*.png",
    "*.jpg",
    "*.jpeg",
    "*.gif",
    "*.bmp",
    "*.ico",
    "*.svg",
    "*.webp",
    "*.pdf",
    "*.mp3",
    "*.mp4",
    "*.mov",
    "*.wav",
    "*.woff",
    "*.woff2",
    "*.ttf",
    "*.eot",
    "*.sqlite",
    "*.db",
    "*.pkl",
    "*.npy",
];

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "kts", "scala", "c", "h", "cc", "cpp", "hpp",
    "cs", "rb", "php", "swift", "m", "mm", "lua", "r", "sh", "bash", "zsh", "ps1", "sql", "vue", "svelte",
    "dart", "ex", "exs", "erl", "hs", "ml", "clj", "zig", "nim", "proto", "graphql",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMode {
    /// Default exclusions plus the extra entries.
    Exclude {
        extra_dirs: Vec<String>,
        extra_files: Vec<String>,
    },
    /// Only files under `dirs` or matching `files`.
    IncludeOnly { dirs: Vec<String>, files: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    pub mode: FilterMode,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::Exclude {
                extra_dirs: Vec::new(),
                extra_files: Vec::new(),
            },
        }
    }
}

impl FilterConfig {
    /// Include lists win when both kinds are given.
    pub fn new(
        excluded_dirs: Vec<String>,
        excluded_files: Vec<String>,
        included_dirs: Vec<String>,
        included_files: Vec<String>,
    ) -> Self {
        let included_dirs = clean_entries(included_dirs);
        let included_files = clean_entries(included_files);
        if !included_dirs.is_empty() || !included_files.is_empty() {
            if !excluded_dirs.is_empty() || !excluded_files.is_empty() {
                debug!("include filters given, ignoring exclude filters");
            }
            return Self {
                mode: FilterMode::IncludeOnly {
                    dirs: included_dirs,
                    files: included_files,
                },
            };
        }
        Self {
            mode: FilterMode::Exclude {
                extra_dirs: clean_entries(excluded_dirs),
                extra_files: clean_entries(excluded_files),
            },
        }
    }

    /// Stable digest of the effective filter; entry order does not matter.
    pub fn fingerprint(&self) -> String {
        let (mode, dirs, files) = match &self.mode {
            FilterMode::Exclude {
                extra_dirs,
                extra_files,
            } => ("exclude", extra_dirs, extra_files),
            FilterMode::IncludeOnly { dirs, files } => ("include", dirs, files),
        };
        let mut hasher = Sha256::new();
        hasher.update(mode.as_bytes());
        for list in [dirs, files] {
            let mut sorted: Vec<&str> = list.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            hasher.update([0xff]);
            for entry in sorted {
                hasher.update(entry.as_bytes());
                hasher.update([0]);
            }
        }
        hasher
            .finalize()
            .iter()
            .take(8)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    pub fn compile(&self) -> Result<PathFilter, RagError> {
        match &self.mode {
            FilterMode::Exclude {
                extra_dirs,
                extra_files,
            } => {
                let mut dirs: Vec<String> = DEFAULT_EXCLUDED_DIRS.iter().map(|dir| dir.to_string()).collect();
                dirs.extend(extra_dirs.iter().cloned());
                let mut files: Vec<String> = DEFAULT_EXCLUDED_FILES.iter().map(|file| file.to_string()).collect();
                files.extend(extra_files.iter().cloned());
                Ok(PathFilter {
                    include: false,
                    dirs,
                    files: build_globset(&files)?,
                    has_file_patterns: true,
                })
            }
            FilterMode::IncludeOnly { dirs, files } => Ok(PathFilter {
                include: true,
                dirs: dirs.clone(),
                files: build_globset(files)?,
                has_file_patterns: !files.is_empty(),
            }),
        }
    }
}

fn clean_entries(entries: Vec<String>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| {
            entry
                .trim()
                .trim_start_matches("./")
                .trim_matches('/')
                .to_string()
        })
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, RagError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|error| RagError::Config(format!("invalid file pattern {pattern}: {error}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|error| RagError::Config(format!("invalid file patterns: {error}")))
}

#[derive(Debug, Clone)]
pub struct PathFilter {
    include: bool,
    dirs: Vec<String>,
    files: GlobSet,
    has_file_patterns: bool,
}

impl PathFilter {
    pub fn accepts(&self, path: &str) -> bool {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let in_dir = self.dirs.iter().any(|dir| under_dir(path, dir));
        let file_match = self.has_file_patterns && (self.files.is_match(file_name) || self.files.is_match(path));
        if self.include {
            in_dir || file_match
        } else {
            !in_dir && !file_match
        }
    }
}

/// True when `dir` names one of the path's directories, or is a leading multi-segment prefix.
fn under_dir(path: &str, dir: &str) -> bool {
    let Some((directories, _file)) = path.rsplit_once('/') else {
        return false;
    };
    if dir.contains('/') {
        return directories == dir || directories.starts_with(&format!("{dir}/"));
    }
    directories.split('/').any(|segment| segment == dir)
}

pub fn document_kind(path: &str) -> DocumentKind {
    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, extension)| extension.to_ascii_lowercase());
    match extension {
        Some(extension) if CODE_EXTENSIONS.contains(&extension.as_str()) => DocumentKind::Code,
        _ => DocumentKind::Doc,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    pub repository_id: String,
    pub documents: usize,
    pub chunks_indexed: usize,
    /// Chunks dropped inside otherwise indexed files.
    pub chunks_failed: usize,
    pub skipped: Vec<SkippedFile>,
    pub reused_existing: bool,
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub store: VectorStore,
    pub tree: RepositoryTree,
    pub report: IngestionReport,
}

enum FileOutcome {
    Indexed {
        summary: DocumentSummary,
        chunks: Vec<StoredChunk>,
        failed: usize,
    },
    Skipped(String),
    Cancelled,
}

struct FileContext {
    embedder: Arc<BatchEmbedder>,
    chunker: Chunker,
    root: PathBuf,
    repository_id: String,
    max_file_tokens: usize,
    cancel: Option<CancellationToken>,
}

pub struct IngestionPipeline {
    embedder: Arc<BatchEmbedder>,
    chunker: Chunker,
    config: IngestConfig,
    parallelism: usize,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<BatchEmbedder>,
        chunking: ChunkingConfig,
        config: IngestConfig,
        parallelism: usize,
    ) -> Result<Self, RagError> {
        let chunker = Chunker::new(chunking, embedder.tokenizer().clone())?;
        Ok(Self {
            embedder,
            chunker,
            config,
            parallelism: parallelism.max(1),
        })
    }

    /// Builds the store for `location`, or reuses a compatible persisted one without calling the provider.
    pub async fn ingest(
        &self,
        source: &dyn RepositorySource,
        location: &RepoLocation,
        filter: &FilterConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<IngestOutcome, RagError> {
        let repository_id = location.repository_id();
        let filter_id = filter.fingerprint();
        let capabilities = self.embedder.capabilities().clone();
        let tree = source.fetch(location).await?;

        match VectorStore::load(
            &self.config.store_dir,
            &repository_id,
            &capabilities.provider_id,
            &filter_id,
            capabilities.dimension,
        )
        .await?
        {
            StoreLoad::Loaded(store) => {
                info!(
                    repository = %location,
                    chunks = store.len(),
                    documents = store.documents().len(),
                    "reusing persisted vector store"
                );
                let report = IngestionReport {
                    repository_id,
                    documents: store.documents().len(),
                    chunks_indexed: store.len(),
                    chunks_failed: 0,
                    skipped: Vec::new(),
                    reused_existing: true,
                };
                return Ok(IngestOutcome { store, tree, report });
            }
            StoreLoad::Incompatible(reason) => {
                info!(repository = %location, %reason, "persisted store is stale, re-ingesting");
            }
            StoreLoad::Missing => debug!(repository = %location, "no persisted store"),
        }

        let path_filter = filter.compile()?;
        let selected: Vec<String> = tree
            .paths
            .iter()
            .filter(|path| path_filter.accepts(path))
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(RagError::Input(format!("no ingestible files in {location}")));
        }
        info!(
            repository = %location,
            files = selected.len(),
            listed = tree.paths.len(),
            "ingesting repository"
        );

        let context = Arc::new(FileContext {
            embedder: self.embedder.clone(),
            chunker: self.chunker.clone(),
            root: tree.root.clone(),
            repository_id: repository_id.clone(),
            max_file_tokens: self.config.max_embedding_file_tokens,
            cancel: cancel.cloned(),
        });
        let permits = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();
        for (index, path) in selected.iter().enumerate() {
            let context = context.clone();
            let permits = permits.clone();
            let path = path.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, process_file(&context, &path).await)
            });
        }

        let mut outcomes: Vec<Option<FileOutcome>> = (0..selected.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(error) => warn!(%error, "ingestion task aborted"),
            }
        }

        let mut store =
            VectorStore::new(repository_id.clone(), capabilities.provider_id.clone()).with_filter_id(filter_id);
        let mut skipped = Vec::new();
        let mut chunks_failed = 0;

        for (path, outcome) in selected.iter().zip(outcomes) {
            match outcome {
                Some(FileOutcome::Indexed {
                    summary,
                    chunks,
                    failed,
                }) => {
                    chunks_failed += failed;
                    let mut accepted = 0;
                    for chunk in chunks {
                        match store.add(chunk) {
                            Ok(_) => accepted += 1,
                            Err(_) => chunks_failed += 1,
                        }
                    }
                    if accepted > 0 {
                        store.register_document(summary);
                    } else {
                        record_skip(&mut skipped, path, "no chunk matched the store dimension".to_string());
                    }
                }
                Some(FileOutcome::Skipped(reason)) => record_skip(&mut skipped, path, reason),
                Some(FileOutcome::Cancelled) => return Err(RagError::Cancelled),
                None => record_skip(&mut skipped, path, "ingestion task aborted".to_string()),
            }
        }

        if let Err(error) = store.save(&self.config.store_dir).await {
            warn!(%error, "could not persist vector store, continuing in memory");
        }

        let report = IngestionReport {
            repository_id,
            documents: store.documents().len(),
            chunks_indexed: store.len(),
            chunks_failed,
            skipped,
            reused_existing: false,
        };
        info!(
            documents = report.documents,
            chunks = report.chunks_indexed,
            skipped = report.skipped.len(),
            "ingestion finished"
        );
        Ok(IngestOutcome { store, tree, report })
    }

    /// Whole-file text for prompts, bounded by the context ceiling rather than the embedding one.
    /// Only relative paths that resolve inside `root` are served.
    pub async fn read_for_context(&self, root: &Path, path: &str) -> Result<String, RagError> {
        let resolved = contained_path(root, path).await?;
        let bytes = tokio::fs::read(resolved).await?;
        let text =
            String::from_utf8(bytes).map_err(|_| RagError::Input(format!("{path} is not valid UTF-8 text")))?;
        let tokens = self.embedder.tokenizer().count(&text)?;
        if tokens > self.config.max_context_file_tokens {
            return Err(RagError::Capacity {
                tokens,
                ceiling: self.config.max_context_file_tokens,
            });
        }
        Ok(text)
    }
}

async fn contained_path(root: &Path, path: &str) -> Result<PathBuf, RagError> {
    let outside = || RagError::Input(format!("{path} is not a file inside the repository"));
    let relative = Path::new(path);
    let plain = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if path.trim().is_empty() || !plain {
        return Err(outside());
    }

    // Symlinks inside the checkout may still point elsewhere.
    let root = tokio::fs::canonicalize(root).await?;
    let resolved = tokio::fs::canonicalize(root.join(relative)).await?;
    if !resolved.starts_with(&root) {
        return Err(outside());
    }
    Ok(resolved)
}

fn record_skip(skipped: &mut Vec<SkippedFile>, path: &str, reason: String) {
    warn!(path = %path, %reason, "skipping file");
    skipped.push(SkippedFile {
        path: path.to_string(),
        reason,
    });
}

async fn process_file(context: &FileContext, path: &str) -> FileOutcome {
    if context.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
        return FileOutcome::Cancelled;
    }

    let bytes = match tokio::fs::read(context.root.join(path)).await {
        Ok(bytes) => bytes,
        Err(error) => return FileOutcome::Skipped(format!("unreadable: {error}")),
    };
    let Ok(raw_text) = String::from_utf8(bytes) else {
        return FileOutcome::Skipped("not valid UTF-8 text".to_string());
    };
    if raw_text.trim().is_empty() {
        return FileOutcome::Skipped("empty file".to_string());
    }

    let token_count = match context.chunker.tokenizer().count(&raw_text) {
        Ok(count) => count,
        Err(error) => return FileOutcome::Skipped(error.to_string()),
    };
    if token_count > context.max_file_tokens {
        return FileOutcome::Skipped(format!(
            "{token_count} tokens exceeds the per-file ceiling of {}",
            context.max_file_tokens
        ));
    }

    let document = Document::new(
        &context.repository_id,
        path,
        raw_text,
        document_kind(path),
        token_count,
    );
    let chunks = match context.chunker.split(&document) {
        Ok(chunks) if chunks.is_empty() => return FileOutcome::Skipped("no tokens".to_string()),
        Ok(chunks) => chunks,
        Err(error) => return FileOutcome::Skipped(error.to_string()),
    };

    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let results = context.embedder.embed_batch(&texts, context.cancel.as_ref()).await;

    let mut stored = Vec::with_capacity(chunks.len());
    let mut first_failure = None;
    let mut failed = 0;
    for (chunk, result) in chunks.into_iter().zip(results) {
        match result.outcome {
            Ok(vector) => stored.push(StoredChunk::from_chunk(chunk, vector)),
            Err(EmbedFailure::Cancelled) => return FileOutcome::Cancelled,
            Err(failure) => {
                debug!(path = %path, ordinal = chunk.ordinal, %failure, "chunk not embedded");
                failed += 1;
                first_failure.get_or_insert(failure);
            }
        }
    }

    if stored.is_empty() {
        let reason = first_failure
            .map(|failure| format!("embedding failed: {failure}"))
            .unwrap_or_else(|| "no chunks embedded".to_string());
        return FileOutcome::Skipped(reason);
    }

    FileOutcome::Indexed {
        summary: document.summary(),
        chunks: stored,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingProvider, HashingEmbedder, ProviderCapabilities};
    use crate::error::{ProviderError, ProviderErrorKind};
    use crate::repository::LocalRepository;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Hashing embedder that counts provider calls.
    struct CountingProvider {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: HashingEmbedder::new(16),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn capabilities(&self) -> &ProviderCapabilities {
            self.inner.capabilities()
        }

        async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_one(text).await
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|text| text.contains("reject_me")) {
                return Err(ProviderError::new(ProviderErrorKind::BadRequest, "counting", "rejected"));
            }
            self.inner.embed_many(texts).await
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn pipeline(provider: Arc<CountingProvider>, store_dir: &Path) -> Result<IngestionPipeline, RagError> {
        let embedder = Arc::new(BatchEmbedder::new(provider, policy(), 2)?);
        IngestionPipeline::new(
            embedder,
            ChunkingConfig {
                max_tokens: 64,
                overlap_tokens: 8,
            },
            IngestConfig {
                max_embedding_file_tokens: 8_192,
                max_context_file_tokens: 100,
                store_dir: store_dir.to_path_buf(),
                clone_dir: store_dir.join("clones"),
                session_dir: store_dir.join("sessions"),
            },
            3,
        )
    }

    fn words(count: usize) -> String {
        (0..count).map(|index| format!("w{index}")).collect::<Vec<_>>().join(" ")
    }

    fn repository() -> Result<TempDir, std::io::Error> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("src"))?;
        fs::create_dir_all(dir.path().join("node_modules/pkg"))?;
        fs::write(dir.path().join("src/small.rs"), words(10))?;
        fs::write(dir.path().join("src/medium.py"), words(50))?;
        fs::write(dir.path().join("huge.md"), words(9_000))?;
        fs::write(dir.path().join("node_modules/pkg/index.js"), words(5))?;
        fs::write(dir.path().join("Cargo.lock"), words(5))?;
        Ok(dir)
    }

    #[tokio::test]
    async fn oversized_files_are_skipped_with_a_reason() -> Result<(), Box<dyn std::error::Error>> {
        let repo = repository()?;
        let stores = tempdir()?;
        let provider = Arc::new(CountingProvider::new());
        let pipeline = pipeline(provider, stores.path())?;
        let location = RepoLocation::Local(repo.path().to_path_buf());

        let outcome = pipeline
            .ingest(&LocalRepository, &location, &FilterConfig::default(), None)
            .await?;

        assert_eq!(outcome.report.documents, 2);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].path, "huge.md");
        assert!(outcome.report.skipped[0].reason.contains("8192"));
        let paths: Vec<&str> = outcome.store.documents().iter().map(|doc| doc.path.as_str()).collect();
        assert_eq!(paths, vec!["src/medium.py", "src/small.rs"]);
        assert!(!outcome.report.reused_existing);
        Ok(())
    }

    #[tokio::test]
    async fn reingesting_an_unchanged_repository_makes_no_provider_calls() -> Result<(), Box<dyn std::error::Error>>
    {
        let repo = repository()?;
        let stores = tempdir()?;
        let location = RepoLocation::Local(repo.path().to_path_buf());

        let first_provider = Arc::new(CountingProvider::new());
        let first = pipeline(first_provider.clone(), stores.path())?
            .ingest(&LocalRepository, &location, &FilterConfig::default(), None)
            .await?;
        assert!(first_provider.calls.load(Ordering::SeqCst) > 0);

        let second_provider = Arc::new(CountingProvider::new());
        let second = pipeline(second_provider.clone(), stores.path())?
            .ingest(&LocalRepository, &location, &FilterConfig::default(), None)
            .await?;

        assert_eq!(second_provider.calls.load(Ordering::SeqCst), 0);
        assert!(second.report.reused_existing);
        assert_eq!(second.store.documents(), first.store.documents());
        assert_eq!(second.store.len(), first.store.len());
        Ok(())
    }

    #[tokio::test]
    async fn provider_rejections_skip_only_that_file() -> Result<(), Box<dyn std::error::Error>> {
        let repo = tempdir()?;
        fs::write(repo.path().join("good.rs"), "fn good() {}")?;
        fs::write(repo.path().join("bad.rs"), "fn reject_me() {}")?;
        let stores = tempdir()?;
        let pipeline = pipeline(Arc::new(CountingProvider::new()), stores.path())?;

        let outcome = pipeline
            .ingest(
                &LocalRepository,
                &RepoLocation::Local(repo.path().to_path_buf()),
                &FilterConfig::default(),
                None,
            )
            .await?;

        assert_eq!(outcome.report.documents, 1);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].path, "bad.rs");
        assert!(outcome.report.skipped[0].reason.starts_with("embedding failed"));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_ingestion_returns_cancelled() -> Result<(), Box<dyn std::error::Error>> {
        let repo = repository()?;
        let stores = tempdir()?;
        let pipeline = pipeline(Arc::new(CountingProvider::new()), stores.path())?;
        let token = CancellationToken::new();
        token.cancel();

        let result = pipeline
            .ingest(
                &LocalRepository,
                &RepoLocation::Local(repo.path().to_path_buf()),
                &FilterConfig::default(),
                Some(&token),
            )
            .await;
        assert!(matches!(result, Err(RagError::Cancelled)));
        Ok(())
    }

    #[test]
    fn default_filter_drops_vendored_and_lock_files() -> Result<(), Box<dyn std::error::Error>> {
        let filter = FilterConfig::default().compile()?;
        assert!(filter.accepts("src/lib.rs"));
        assert!(filter.accepts("README.md"));
        assert!(!filter.accepts("node_modules/pkg/index.js"));
        assert!(!filter.accepts("web/node_modules/pkg/index.js"));
        assert!(!filter.accepts("Cargo.lock"));
        assert!(!filter.accepts("static/app.min.js"));
        assert!(!filter.accepts("docs/logo.png"));
        Ok(())
    }

    #[test]
    fn include_lists_win_over_exclude_lists() -> Result<(), Box<dyn std::error::Error>> {
        let config = FilterConfig::new(
            vec!["src".to_string()],
            Vec::new(),
            vec!["./src/".to_string()],
            vec!["*.md".to_string()],
        );
        assert!(matches!(config.mode, FilterMode::IncludeOnly { .. }));

        let filter = config.compile()?;
        assert!(filter.accepts("src/lib.rs"));
        assert!(filter.accepts("docs/guide.md"));
        assert!(!filter.accepts("tests/it.rs"));
        Ok(())
    }

    #[test]
    fn custom_exclusions_extend_the_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let filter = FilterConfig::new(
            vec!["crates/generated".to_string()],
            vec!["*.snap".to_string()],
            Vec::new(),
            Vec::new(),
        )
        .compile()?;
        assert!(!filter.accepts("crates/generated/api.rs"));
        assert!(filter.accepts("crates/core/api.rs"));
        assert!(!filter.accepts("tests/snapshots/output.snap"));
        assert!(!filter.accepts("target/debug/build.rs"));
        Ok(())
    }

    #[test]
    fn kinds_follow_extensions() {
        assert_eq!(document_kind("src/lib.rs"), DocumentKind::Code);
        assert_eq!(document_kind("web/App.TSX"), DocumentKind::Code);
        assert_eq!(document_kind("README.md"), DocumentKind::Doc);
        assert_eq!(document_kind("Makefile"), DocumentKind::Doc);
    }

    #[tokio::test]
    async fn context_reads_use_their_own_ceiling() -> Result<(), Box<dyn std::error::Error>> {
        let repo = repository()?;
        let stores = tempdir()?;
        let pipeline = pipeline(Arc::new(CountingProvider::new()), stores.path())?;

        assert!(pipeline.read_for_context(repo.path(), "src/medium.py").await?.starts_with("w0 "));
        assert!(matches!(
            pipeline.read_for_context(repo.path(), "huge.md").await,
            Err(RagError::Capacity { ceiling: 100, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn context_reads_stay_inside_the_repository() -> Result<(), Box<dyn std::error::Error>> {
        let outer = tempdir()?;
        let root = outer.path().join("repo");
        fs::create_dir_all(root.join("src"))?;
        fs::write(root.join("src/lib.rs"), "pub fn inside() {}")?;
        fs::write(outer.path().join("secret.txt"), "TOP SECRET")?;
        let stores = tempdir()?;
        let pipeline = pipeline(Arc::new(CountingProvider::new()), stores.path())?;

        assert_eq!(pipeline.read_for_context(&root, "./src/lib.rs").await?, "pub fn inside() {}");
        let absolute = outer.path().join("secret.txt");
        for escape in ["../secret.txt", "src/../../secret.txt", "", absolute.to_string_lossy().as_ref()] {
            assert!(
                matches!(pipeline.read_for_context(&root, escape).await, Err(RagError::Input(_))),
                "{escape} was served"
            );
        }
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn context_reads_do_not_follow_links_out_of_the_repository() -> Result<(), Box<dyn std::error::Error>> {
        let outer = tempdir()?;
        let root = outer.path().join("repo");
        fs::create_dir_all(&root)?;
        fs::write(outer.path().join("secret.txt"), "TOP SECRET")?;
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("link.txt"))?;
        let stores = tempdir()?;
        let pipeline = pipeline(Arc::new(CountingProvider::new()), stores.path())?;

        assert!(matches!(
            pipeline.read_for_context(&root, "link.txt").await,
            Err(RagError::Input(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn changing_the_filter_rebuilds_the_store() -> Result<(), Box<dyn std::error::Error>> {
        let repo = repository()?;
        fs::create_dir_all(repo.path().join("docs"))?;
        fs::write(repo.path().join("docs/guide.md"), words(20))?;
        let stores = tempdir()?;
        let location = RepoLocation::Local(repo.path().to_path_buf());
        let pipeline = pipeline(Arc::new(CountingProvider::new()), stores.path())?;

        let first = pipeline
            .ingest(&LocalRepository, &location, &FilterConfig::default(), None)
            .await?;
        assert_eq!(first.report.documents, 3);

        let docs_only = FilterConfig::new(Vec::new(), Vec::new(), vec!["docs".to_string()], Vec::new());
        let second = pipeline.ingest(&LocalRepository, &location, &docs_only, None).await?;
        assert!(!second.report.reused_existing);
        let paths: Vec<&str> = second.store.documents().iter().map(|doc| doc.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/guide.md"]);

        let again = pipeline.ingest(&LocalRepository, &location, &docs_only, None).await?;
        assert!(again.report.reused_existing);
        Ok(())
    }

    #[test]
    fn filter_fingerprints_ignore_entry_order() {
        let first = FilterConfig::new(vec!["a".into(), "b".into()], Vec::new(), Vec::new(), Vec::new());
        let second = FilterConfig::new(vec!["b".into(), "a".into()], Vec::new(), Vec::new(), Vec::new());
        let include = FilterConfig::new(Vec::new(), Vec::new(), vec!["a".into(), "b".into()], Vec::new());
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_ne!(first.fingerprint(), include.fingerprint());
        assert_ne!(first.fingerprint(), FilterConfig::default().fingerprint());
    }
}
