use crate::batch::BatchEmbedder;
use crate::cancel::CancellationToken;
use crate::config::RetrievalConfig;
use crate::error::{ProviderError, RagError};
use crate::generation::{Generation, GenerationOptions, GenerationProvider, Prompt, TextStream};
use crate::memory::SessionContext;
use crate::models::{DialogTurn, ResearchIteration, RetrievalResult};
use crate::retry::RetryPolicy;
use crate::store::VectorStore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const FINAL_MARKER: &str = "[FINAL]";

const CONTEXT_SEPARATOR: &str = "\n\n----------\n\n";
const MAX_PLAN_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are an expert on the code repository the user is asking about. \
Answer using the repository excerpts and the conversation history provided. \
Cite file paths when you rely on an excerpt. If the excerpts do not contain the answer, say so plainly \
instead of guessing.";

const STRUCTURED_INSTRUCTIONS: &str = "Reply with a JSON object with two string fields: \
\"rationale\" (how the excerpts support the answer) and \"answer\" (the answer in Markdown).";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerState {
    Retrieving,
    ContextAssembly,
    Generating,
    Researching { iteration: usize },
    Completed,
    Failed,
}

impl fmt::Display for AnswerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retrieving => f.write_str("retrieving"),
            Self::ContextAssembly => f.write_str("context-assembly"),
            Self::Generating => f.write_str("generating"),
            Self::Researching { iteration } => write!(f, "researching({iteration})"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

fn transition(state: AnswerState) {
    debug!(state = %state, "answer state");
}

#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    pub deep_research: bool,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub path: String,
    pub ordinal: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub rationale: Option<String>,
    pub sources: Vec<SourceRef>,
    pub iterations: Vec<ResearchIteration>,
    /// False when deep research stopped at its ceiling or on a late provider failure.
    pub complete: bool,
}

/// Streamed answer. The turn is recorded only once the whole reply has been produced.
#[derive(Debug)]
pub struct AnswerStream {
    pub sources: Vec<SourceRef>,
    pub complete: bool,
    stream: TextStream,
}

impl AnswerStream {
    pub async fn next(&mut self) -> Option<Result<String, ProviderError>> {
        self.stream.next().await
    }

    pub fn cancel(&self) {
        self.stream.cancel();
    }

    pub async fn collect_text(self) -> Result<String, ProviderError> {
        self.stream.collect_text().await
    }
}

struct AssembledContext {
    text: String,
    sources: Vec<SourceRef>,
}

struct ResearchStage<'a> {
    index: usize,
    ceiling: usize,
    log: &'a [ResearchIteration],
}

pub struct RagOrchestrator {
    embedder: Arc<BatchEmbedder>,
    generator: Arc<dyn GenerationProvider>,
    policy: RetryPolicy,
    retrieval: RetrievalConfig,
    options: GenerationOptions,
}

impl RagOrchestrator {
    pub fn new(
        embedder: Arc<BatchEmbedder>,
        generator: Arc<dyn GenerationProvider>,
        policy: RetryPolicy,
        retrieval: RetrievalConfig,
        options: GenerationOptions,
    ) -> Self {
        Self {
            embedder,
            generator,
            policy,
            retrieval,
            options: GenerationOptions {
                structured: true,
                ..options
            },
        }
    }

    pub async fn retrieve(
        &self,
        store: &VectorStore,
        query: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        self.retrieve_top(store, query, self.retrieval.top_k, cancel).await
    }

    /// Nearest `k` chunks for `query`. Provider or dimension problems degrade to no context.
    pub async fn retrieve_top(
        &self,
        store: &VectorStore,
        query: &str,
        k: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        transition(AnswerState::Retrieving);
        if store.is_empty() {
            return Ok(Vec::new());
        }

        let vector = match self.embedder.embed_query(query, cancel).await {
            Ok(vector) => vector,
            Err(RagError::Cancelled) => return Err(RagError::Cancelled),
            Err(error) => {
                warn!(%error, "query embedding failed, answering without context");
                return Ok(Vec::new());
            }
        };

        match store.query(&vector, k) {
            Ok(results) => Ok(results),
            Err(error) => {
                warn!(%error, "store query failed, answering without context");
                Ok(Vec::new())
            }
        }
    }

    pub async fn answer(
        &self,
        store: &VectorStore,
        session: &SessionContext,
        question: &str,
        options: &AnswerOptions,
    ) -> Result<Answer, RagError> {
        let question = checked_question(question)?;
        let cancel = options.cancel.as_ref();
        let history = session.memory.last_n(self.retrieval.history_turns);

        let outcome = if options.deep_research {
            self.research(store, question, &history, cancel).await
        } else {
            self.single_pass(store, question, &history, cancel).await
        };

        let answer = match outcome {
            Ok(answer) if !cancel.is_some_and(CancellationToken::is_cancelled) => answer,
            Ok(_) => {
                transition(AnswerState::Failed);
                return Err(RagError::Cancelled);
            }
            Err(error) => {
                transition(AnswerState::Failed);
                return Err(error);
            }
        };

        session.memory.append(question, &answer.text).await?;
        transition(AnswerState::Completed);
        info!(
            session = %session.session_id,
            sources = answer.sources.len(),
            iterations = answer.iterations.len(),
            complete = answer.complete,
            "question answered"
        );
        Ok(answer)
    }

    /// Deep research is not streamed token by token; its final answer arrives as one fragment.
    pub async fn answer_stream(
        &self,
        store: &VectorStore,
        session: &SessionContext,
        question: &str,
        options: &AnswerOptions,
    ) -> Result<AnswerStream, RagError> {
        if options.deep_research {
            let answer = self.answer(store, session, question, options).await?;
            let (sender, stream) = TextStream::channel(1);
            sender.send(Ok(answer.text)).await;
            return Ok(AnswerStream {
                sources: answer.sources,
                complete: answer.complete,
                stream,
            });
        }

        let question = checked_question(question)?.to_string();
        let cancel = options.cancel.clone();
        let history = session.memory.last_n(self.retrieval.history_turns);

        let results = self.retrieve(store, &question, cancel.as_ref()).await?;
        transition(AnswerState::ContextAssembly);
        let context = self.assemble(&results);
        transition(AnswerState::Generating);
        let prompt = build_prompt(&question, &context.text, &history, None, false);
        let stream_options = GenerationOptions {
            structured: false,
            ..self.options.clone()
        };

        let mut upstream = self
            .policy
            .run("stream", self.generator.provider_id(), cancel.as_ref(), |_| {
                self.generator.stream(&prompt, &stream_options)
            })
            .await?;

        let memory = session.memory.clone();
        let session_id = session.session_id.clone();
        let finished = cancel.clone();
        let stream = TextStream::spawn(cancel, move |sender| async move {
            let mut text = String::new();
            while let Some(fragment) = upstream.next().await {
                match fragment {
                    Ok(fragment) => {
                        text.push_str(&fragment);
                        if !sender.send(Ok(fragment)).await {
                            return;
                        }
                    }
                    Err(error) => {
                        transition(AnswerState::Failed);
                        sender.send(Err(error)).await;
                        return;
                    }
                }
            }
            if finished.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return;
            }

            // The producer can be aborted at any await; the append runs on its own task so a
            // turn is either fully recorded or not at all. The consumer sees the end of the
            // stream only once the sender is dropped after recording.
            let recorder = tokio::spawn(async move {
                let recorded = memory.append(question, text).await;
                drop(sender);
                recorded
            });
            match recorder.await {
                Ok(Ok(_)) => transition(AnswerState::Completed),
                Ok(Err(error)) => warn!(session = %session_id, %error, "streamed turn not recorded"),
                Err(error) => warn!(session = %session_id, %error, "streamed turn recorder failed"),
            }
        });

        Ok(AnswerStream {
            sources: context.sources,
            complete: true,
            stream,
        })
    }

    /// Free-text completion under the shared retry policy, for callers outside the answer flow.
    pub async fn complete(&self, prompt: &Prompt, cancel: Option<&CancellationToken>) -> Result<String, RagError> {
        let options = GenerationOptions {
            structured: false,
            ..self.options.clone()
        };
        let generation = self
            .policy
            .run("complete", self.generator.provider_id(), cancel, |_| {
                self.generator.generate(prompt, &options)
            })
            .await?;
        Ok(generation.answer().to_string())
    }

    async fn single_pass(
        &self,
        store: &VectorStore,
        question: &str,
        history: &[DialogTurn],
        cancel: Option<&CancellationToken>,
    ) -> Result<Answer, RagError> {
        let results = self.retrieve(store, question, cancel).await?;
        transition(AnswerState::ContextAssembly);
        let context = self.assemble(&results);

        transition(AnswerState::Generating);
        let prompt = build_prompt(question, &context.text, history, None, true);
        let generation = self.generate(&prompt, cancel).await?;
        let (text, _) = strip_final_marker(generation.answer());

        Ok(Answer {
            text,
            rationale: generation.rationale().map(str::to_string),
            sources: context.sources,
            iterations: Vec::new(),
            complete: true,
        })
    }

    async fn research(
        &self,
        store: &VectorStore,
        question: &str,
        history: &[DialogTurn],
        cancel: Option<&CancellationToken>,
    ) -> Result<Answer, RagError> {
        let ceiling = self.retrieval.max_research_iterations.max(1);
        let mut iterations: Vec<ResearchIteration> = Vec::new();
        let mut sources: Vec<SourceRef> = Vec::new();
        let mut latest: (String, Option<String>) = (String::new(), None);

        for index in 1..=ceiling {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(RagError::Cancelled);
            }
            transition(AnswerState::Researching { iteration: index });
            let plan = research_query(question, iterations.last());
            let results = self.retrieve(store, &plan, cancel).await?;
            let context = self.assemble(&results);
            merge_sources(&mut sources, context.sources);

            let stage = ResearchStage {
                index,
                ceiling,
                log: &iterations,
            };
            let prompt = build_prompt(question, &context.text, history, Some(&stage), true);
            let generation = match self.generate(&prompt, cancel).await {
                Ok(generation) => generation,
                Err(RagError::Provider(error)) if error.is_transient() && !iterations.is_empty() => {
                    warn!(iteration = index, %error, "research stopped early, returning the last answer");
                    let (text, rationale) = latest;
                    return Ok(Answer {
                        text,
                        rationale,
                        sources,
                        iterations,
                        complete: false,
                    });
                }
                Err(error) => return Err(error),
            };

            let (findings, is_final) = strip_final_marker(generation.answer());
            debug!(iteration = index, is_final, "research iteration finished");
            latest = (findings.clone(), generation.rationale().map(str::to_string));
            iterations.push(ResearchIteration {
                index,
                plan,
                findings,
                is_final,
            });

            if is_final {
                let (text, rationale) = latest;
                return Ok(Answer {
                    text,
                    rationale,
                    sources,
                    iterations,
                    complete: true,
                });
            }
        }

        warn!(ceiling, "research ceiling reached without a final answer");
        let (text, rationale) = latest;
        Ok(Answer {
            text,
            rationale,
            sources,
            iterations,
            complete: false,
        })
    }

    async fn generate(&self, prompt: &Prompt, cancel: Option<&CancellationToken>) -> Result<Generation, RagError> {
        self.policy
            .run("generate", self.generator.provider_id(), cancel, |_| {
                self.generator.generate(prompt, &self.options)
            })
            .await
    }

    /// Highest-ranked chunks that fit the token budget, in rank order.
    fn assemble(&self, results: &[RetrievalResult]) -> AssembledContext {
        let budget = self.retrieval.context_token_budget;
        let mut used = 0;
        let mut parts = Vec::new();
        let mut sources = Vec::new();

        for result in results {
            if used + result.token_count > budget {
                break;
            }
            used += result.token_count;
            parts.push(format!(
                "## File Path: {} (part {})\n\n{}",
                result.chunk_ref.path,
                result.chunk_ref.ordinal + 1,
                result.text
            ));
            sources.push(SourceRef {
                path: result.chunk_ref.path.clone(),
                ordinal: result.chunk_ref.ordinal,
                score: result.score,
            });
        }

        AssembledContext {
            text: parts.join(CONTEXT_SEPARATOR),
            sources,
        }
    }
}

fn checked_question(question: &str) -> Result<&str, RagError> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(RagError::Input("question is empty".to_string()));
    }
    Ok(trimmed)
}

fn merge_sources(target: &mut Vec<SourceRef>, incoming: Vec<SourceRef>) {
    for source in incoming {
        let seen = target
            .iter()
            .any(|existing| existing.path == source.path && existing.ordinal == source.ordinal);
        if !seen {
            target.push(source);
        }
    }
}

/// First iteration searches for the question; later ones add the opening of the previous findings.
fn research_query(question: &str, previous: Option<&ResearchIteration>) -> String {
    match previous {
        None => question.to_string(),
        Some(iteration) => {
            let lead: String = iteration
                .findings
                .split("\n\n")
                .next()
                .unwrap_or_default()
                .chars()
                .take(MAX_PLAN_CHARS)
                .collect();
            format!("{question}\n{lead}")
        }
    }
}

/// Removes every case-insensitive `[FINAL]` marker and reports whether one was present.
pub fn strip_final_marker(text: &str) -> (String, bool) {
    let marker = FINAL_MARKER.to_ascii_lowercase();
    let lowered = text.to_ascii_lowercase();
    let mut stripped = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut found = false;
    while let Some(offset) = lowered[cursor..].find(&marker) {
        let start = cursor + offset;
        stripped.push_str(&text[cursor..start]);
        cursor = start + marker.len();
        found = true;
    }
    stripped.push_str(&text[cursor..]);
    (stripped.trim().to_string(), found)
}

fn build_prompt(
    question: &str,
    context: &str,
    history: &[DialogTurn],
    research: Option<&ResearchStage<'_>>,
    structured: bool,
) -> Prompt {
    let mut system = SYSTEM_PROMPT.to_string();
    if let Some(stage) = research {
        system.push_str(&format!(
            "\n\nYou are in a multi-step investigation, step {} of at most {}. Build on the research log. \
If your answer is complete, end it with {FINAL_MARKER}. Otherwise report what you found and what \
still needs to be examined.",
            stage.index, stage.ceiling
        ));
    }
    if structured {
        system.push_str("\n\n");
        system.push_str(STRUCTURED_INSTRUCTIONS);
    }

    let mut user = String::new();
    if !history.is_empty() {
        user.push_str("<conversation_history>\n");
        for turn in history {
            user.push_str(&format!(
                "<turn>\n<user>{}</user>\n<assistant>{}</assistant>\n</turn>\n",
                turn.question, turn.answer
            ));
        }
        user.push_str("</conversation_history>\n\n");
    }
    if let Some(stage) = research {
        if !stage.log.is_empty() {
            user.push_str("<research_log>\n");
            for iteration in stage.log {
                user.push_str(&format!(
                    "<iteration index=\"{}\">\n{}\n</iteration>\n",
                    iteration.index, iteration.findings
                ));
            }
            user.push_str("</research_log>\n\n");
        }
    }
    user.push_str("<context>\n");
    user.push_str(context);
    user.push_str("\n</context>\n\n<query>\n");
    user.push_str(question);
    user.push_str("\n</query>");

    Prompt { system, user }
}
