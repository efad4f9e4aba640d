use crate::cancel::CancellationToken;
use crate::embeddings::{EmbeddingProvider, ProviderCapabilities};
use crate::error::{ProviderError, ProviderErrorKind, RagError};
use crate::models::{text_digest, EmbedFailure, EmbeddingBatchResult};
use crate::retry::RetryPolicy;
use crate::tokenizer::Tokenizer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

type GroupOutcome = Result<Vec<Vec<f32>>, EmbedFailure>;

struct PendingText {
    digest: String,
    text: String,
    indices: Vec<usize>,
}

/// Uniform "embed many" over any provider: per-input outcomes in input order, retries, and a
/// content-addressed cache that lives as long as the embedder.
pub struct BatchEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    tokenizer: Tokenizer,
    policy: RetryPolicy,
    cache: Mutex<HashMap<String, Vec<f32>>>,
    permits: Arc<Semaphore>,
}

impl BatchEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, policy: RetryPolicy, parallelism: usize) -> Result<Self, RagError> {
        let tokenizer = Tokenizer::new(provider.capabilities().tokenizer)?;
        Ok(Self {
            provider,
            tokenizer,
            policy,
            cache: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
        })
    }

    pub fn capabilities(&self) -> &ProviderCapabilities {
        self.provider.capabilities()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or_default()
    }

    pub async fn embed_batch(&self, texts: &[String], cancel: Option<&CancellationToken>) -> Vec<EmbeddingBatchResult> {
        let mut outcomes: Vec<Option<Result<Vec<f32>, EmbedFailure>>> = vec![None; texts.len()];
        let pending = self.triage(texts, &mut outcomes);

        if !pending.is_empty() {
            let group_size = self.capabilities().max_batch_size.max(1);
            let groups: Vec<&[PendingText]> = pending.chunks(group_size).collect();
            debug!(
                inputs = texts.len(),
                unique = pending.len(),
                groups = groups.len(),
                provider = %self.capabilities().provider_id,
                "embedding batch"
            );

            let mut tasks = JoinSet::new();
            for (group_index, group) in groups.iter().enumerate() {
                let group_texts: Vec<String> = group.iter().map(|item| item.text.clone()).collect();
                let provider = self.provider.clone();
                let permits = self.permits.clone();
                let policy = self.policy;
                let cancel = cancel.cloned();
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let outcome = embed_group(provider.as_ref(), policy, &group_texts, cancel.as_ref()).await;
                    (group_index, outcome)
                });
            }

            let mut group_outcomes: Vec<Option<GroupOutcome>> = vec![None; groups.len()];
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((group_index, outcome)) => group_outcomes[group_index] = Some(outcome),
                    Err(error) => warn!(%error, "embedding task aborted"),
                }
            }

            for (group, outcome) in groups.iter().zip(group_outcomes) {
                let outcome =
                    outcome.unwrap_or_else(|| Err(EmbedFailure::Invalid("embedding task aborted".to_string())));
                match outcome {
                    Ok(vectors) => {
                        for (item, vector) in group.iter().zip(vectors) {
                            self.remember(&item.digest, &vector);
                            for &index in &item.indices {
                                outcomes[index] = Some(Ok(vector.clone()));
                            }
                        }
                    }
                    Err(failure) => {
                        for item in group.iter() {
                            for &index in &item.indices {
                                outcomes[index] = Some(Err(failure.clone()));
                            }
                        }
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .enumerate()
            .map(|(input_index, outcome)| EmbeddingBatchResult {
                input_index,
                outcome: outcome.unwrap_or(Err(EmbedFailure::Cancelled)),
            })
            .collect()
    }

    pub async fn embed_query(&self, text: &str, cancel: Option<&CancellationToken>) -> Result<Vec<f32>, RagError> {
        let results = self.embed_batch(&[text.to_string()], cancel).await;
        let outcome = results
            .into_iter()
            .next()
            .map(|result| result.outcome)
            .unwrap_or(Err(EmbedFailure::Cancelled));
        outcome.map_err(|failure| match failure {
            EmbedFailure::Skipped => RagError::Input("query is empty".to_string()),
            EmbedFailure::Capacity { tokens, ceiling } => RagError::Capacity { tokens, ceiling },
            EmbedFailure::Invalid(reason) => RagError::Input(reason),
            EmbedFailure::Provider(error) => RagError::Provider(error),
            EmbedFailure::Cancelled => RagError::Cancelled,
        })
    }

    /// Settles empty, oversized, untokenizable and cached inputs; returns the rest deduplicated by content.
    fn triage(&self, texts: &[String], outcomes: &mut [Option<Result<Vec<f32>, EmbedFailure>>]) -> Vec<PendingText> {
        let ceiling = self.capabilities().token_ceiling;
        let mut pending: Vec<PendingText> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (index, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                outcomes[index] = Some(Err(EmbedFailure::Skipped));
                continue;
            }

            match self.tokenizer.count(text) {
                Ok(tokens) if tokens > ceiling => {
                    outcomes[index] = Some(Err(EmbedFailure::Capacity { tokens, ceiling }));
                    continue;
                }
                Ok(_) => {}
                Err(error) => {
                    outcomes[index] = Some(Err(EmbedFailure::Invalid(error.to_string())));
                    continue;
                }
            }

            let digest = text_digest(text);
            if let Some(vector) = self.cached(&digest) {
                outcomes[index] = Some(Ok(vector));
                continue;
            }

            match positions.get(&digest) {
                Some(&position) => pending[position].indices.push(index),
                None => {
                    positions.insert(digest.clone(), pending.len());
                    pending.push(PendingText {
                        digest,
                        text: text.clone(),
                        indices: vec![index],
                    });
                }
            }
        }

        pending
    }

    fn cached(&self, digest: &str) -> Option<Vec<f32>> {
        self.cache.lock().ok().and_then(|cache| cache.get(digest).cloned())
    }

    fn remember(&self, digest: &str, vector: &[f32]) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(digest.to_string(), vector.to_vec());
        }
    }
}

async fn embed_group(
    provider: &dyn EmbeddingProvider,
    policy: RetryPolicy,
    texts: &[String],
    cancel: Option<&CancellationToken>,
) -> GroupOutcome {
    let provider_id = provider.capabilities().provider_id.clone();
    let result = if provider.capabilities().supports_batch() {
        policy
            .run("embed_many", &provider_id, cancel, |_| provider.embed_many(texts))
            .await
    } else {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let vector = policy
                .run("embed_one", &provider_id, cancel, |_| provider.embed_one(text))
                .await;
            match vector {
                Ok(vector) => vectors.push(vector),
                Err(error) => return Err(failure_from(error)),
            }
        }
        Ok(vectors)
    };

    match result {
        Ok(vectors) if vectors.len() == texts.len() => Ok(vectors),
        Ok(vectors) => Err(EmbedFailure::Provider(ProviderError::new(
            ProviderErrorKind::BadRequest,
            provider_id,
            format!("provider returned {} vectors for {} inputs", vectors.len(), texts.len()),
        ))),
        Err(error) => Err(failure_from(error)),
    }
}

fn failure_from(error: RagError) -> EmbedFailure {
    match error {
        RagError::Provider(error) => EmbedFailure::Provider(error),
        RagError::Cancelled => EmbedFailure::Cancelled,
        other => EmbedFailure::Invalid(other.to_string()),
    }
}
