use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use codebase_rag_core::memory::new_session_id;
use codebase_rag_core::wiki::default_output_dir;
use codebase_rag_core::{
    AnswerOptions, CancellationToken, FilterConfig, RagConfig, RagError, RagService, RepoHost, RepoLocation,
    WikiDepth, WikiRequest,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "codebase-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file; defaults apply when omitted.
    #[arg(long, env = "CODEBASE_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Embedding provider: hashing, openai or ollama.
    #[arg(long, env = "CODEBASE_RAG_EMBEDDING_PROVIDER")]
    embedding_provider: Option<String>,

    /// Generation provider: openai or ollama.
    #[arg(long, env = "CODEBASE_RAG_GENERATION_PROVIDER")]
    generation_provider: Option<String>,

    /// Generation model name.
    #[arg(long, env = "CODEBASE_RAG_MODEL")]
    model: Option<String>,

    /// Directory for persisted stores.
    #[arg(long, env = "CODEBASE_RAG_STORE_DIR")]
    store_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RepoArgs {
    /// Local path or http(s)/git@ url of the repository.
    repo: String,

    /// Token for private remotes. Never written to logs.
    #[arg(long, env = "CODEBASE_RAG_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Hosting service for file links: github, gitlab or bitbucket. Guessed from the url when omitted.
    #[arg(long)]
    repo_type: Option<RepoHost>,

    /// Extra directory to exclude (repeatable).
    #[arg(long = "exclude-dir")]
    exclude_dirs: Vec<String>,

    /// Extra file name or glob to exclude (repeatable).
    #[arg(long = "exclude-file")]
    exclude_files: Vec<String>,

    /// Only index these directories (repeatable); overrides exclusions.
    #[arg(long = "include-dir")]
    include_dirs: Vec<String>,

    /// Only index these file names or globs (repeatable); overrides exclusions.
    #[arg(long = "include-file")]
    include_files: Vec<String>,
}

impl RepoArgs {
    fn location(&self) -> RepoLocation {
        let location = RepoLocation::parse(&self.repo, self.access_token.clone());
        match self.repo_type {
            Some(host) => location.with_host(host),
            None => location,
        }
    }

    fn filter(&self) -> FilterConfig {
        FilterConfig::new(
            self.exclude_dirs.clone(),
            self.exclude_files.clone(),
            self.include_dirs.clone(),
            self.include_files.clone(),
        )
    }
}

#[derive(Subcommand)]
enum Command {
    /// Index a repository, reusing a compatible persisted store.
    Ingest {
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Ask a question about a repository.
    Ask {
        #[command(flatten)]
        repo: RepoArgs,
        /// The question.
        question: String,
        /// Conversation to continue; a new one is started when omitted.
        #[arg(long)]
        session: Option<String>,
        /// Iterate retrieval and generation until the model reports a final answer.
        #[arg(long, default_value_t = false)]
        deep_research: bool,
        /// Print the answer as it is generated.
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Print the turns of a conversation.
    History {
        #[arg(long)]
        session: String,
    },
    /// Generate a Markdown wiki for a repository.
    Wiki {
        #[command(flatten)]
        repo: RepoArgs,
        /// Output directory; defaults to `<name>-wiki` in the current directory.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Plan 4-6 pages instead of 8-12 with sections.
        #[arg(long, default_value_t = false)]
        concise: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let service = RagService::from_config(config)
        .map_err(|error| anyhow::anyhow!(error.user_message()))?
        .with_persistent_sessions(true);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "codebase-rag boot"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Ingest { repo } => {
            let status = service
                .ingest(&repo.location(), &repo.filter(), Some(&cancel))
                .await
                .map_err(user_error)?;
            let report = &status.report;

            if report.reused_existing {
                println!("reused persisted store for {}", status.repository);
            }
            println!(
                "{} documents, {} chunks indexed, {} chunks failed, {} files skipped (repository_id={})",
                report.documents,
                report.chunks_indexed,
                report.chunks_failed,
                report.skipped.len(),
                status.repository_id
            );
            for skipped in &report.skipped {
                println!("  skipped {}: {}", skipped.path, skipped.reason);
            }
        }
        Command::Ask {
            repo,
            question,
            session,
            deep_research,
            stream,
        } => {
            service
                .ingest(&repo.location(), &repo.filter(), Some(&cancel))
                .await
                .map_err(user_error)?;

            let session = session.unwrap_or_else(new_session_id);
            let options = AnswerOptions {
                deep_research,
                cancel: Some(cancel.clone()),
            };

            if stream {
                let mut answer = service
                    .answer_stream(&question, &session, &options)
                    .await
                    .map_err(user_error)?;
                let mut stdout = std::io::stdout();
                while let Some(fragment) = answer.next().await {
                    let fragment = fragment.map_err(|error| user_error(error.into()))?;
                    write!(stdout, "{fragment}")?;
                    stdout.flush()?;
                }
                println!();
                if cancel.is_cancelled() {
                    anyhow::bail!("cancelled before the answer completed");
                }
                print_sources(answer.sources.iter().map(|source| (&source.path, source.ordinal, source.score)));
            } else {
                let answer = service
                    .answer(&question, &session, &options)
                    .await
                    .map_err(user_error)?;
                println!("{}", answer.text);
                if !answer.complete {
                    println!("\n(research stopped before a final answer)");
                }
                for iteration in &answer.iterations {
                    info!(iteration = iteration.index, is_final = iteration.is_final, "research iteration");
                }
                print_sources(answer.sources.iter().map(|source| (&source.path, source.ordinal, source.score)));
            }
            println!("session={session}");
        }
        Command::History { session } => {
            let turns = service.history(&session).await.map_err(user_error)?;
            if turns.is_empty() {
                println!("no turns recorded for session {session}");
            }
            for turn in turns {
                println!("[{}] {}", turn.id, turn.created_at.to_rfc3339());
                println!("Q: {}", turn.question);
                println!("A: {}\n", turn.answer);
            }
        }
        Command::Wiki { repo, output, concise } => {
            let location = repo.location();
            service
                .ingest(&location, &repo.filter(), Some(&cancel))
                .await
                .map_err(user_error)?;

            let output_dir = match output {
                Some(dir) => dir,
                None => default_output_dir(&std::env::current_dir()?, &location),
            };
            let request = WikiRequest {
                depth: if concise { WikiDepth::Concise } else { WikiDepth::Comprehensive },
                output_dir,
                cancel: Some(cancel.clone()),
            };
            let report = service.generate_wiki(&request).await.map_err(user_error)?;

            println!("{}: {} pages written", report.title, report.pages_written.len());
            for path in &report.pages_written {
                println!("  {}", path.display());
            }
            for title in &report.skipped {
                println!("  skipped {title}: empty content");
            }
            println!("index: {}", report.index.display());
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<RagConfig> {
    let mut config = match &cli.config {
        Some(path) => RagConfig::from_toml_file(path).map_err(|error| anyhow::anyhow!(error.user_message()))?,
        None => RagConfig::default(),
    };
    if let Some(provider) = &cli.embedding_provider {
        config.embedding.provider = provider.clone();
    }
    if let Some(provider) = &cli.generation_provider {
        config.generation.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.generation.model = model.clone();
    }
    if let Some(store_dir) = &cli.store_dir {
        config.ingest.store_dir = store_dir.clone();
    }
    Ok(config)
}

fn user_error(error: RagError) -> anyhow::Error {
    anyhow::anyhow!(error.user_message())
}

fn print_sources<'a>(sources: impl Iterator<Item = (&'a String, usize, f32)>) {
    let mut any = false;
    for (path, ordinal, score) in sources {
        if !any {
            println!("\nsources:");
            any = true;
        }
        println!("  {path} (part {}) score={score:.4}", ordinal + 1);
    }
}
