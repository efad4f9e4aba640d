use crate::embeddings::cosine_similarity;
use crate::error::RagError;
use crate::models::{Chunk, ChunkRef, DocumentSummary, RetrievalResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredChunk {
    pub document_id: String,
    pub path: String,
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    pub vector: Vec<f32>,
}

impl StoredChunk {
    pub fn from_chunk(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self {
            document_id: chunk.document_id,
            path: chunk.path,
            ordinal: chunk.ordinal,
            text: chunk.text,
            token_count: chunk.token_count,
            vector,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreBlob {
    schema_version: u32,
    repository_id: String,
    provider_id: String,
    filter_id: String,
    dimension: Option<usize>,
    documents: Vec<DocumentSummary>,
    chunks: Vec<StoredChunk>,
}

#[derive(Debug)]
pub enum StoreLoad {
    Loaded(VectorStore),
    Missing,
    /// The blob exists but cannot be reused; the reason is logged and ingestion starts over.
    Incompatible(String),
}

/// In-memory cosine index for one repository. The first accepted vector fixes the dimension.
#[derive(Debug, Clone)]
pub struct VectorStore {
    repository_id: String,
    provider_id: String,
    filter_id: String,
    dimension: Option<usize>,
    documents: Vec<DocumentSummary>,
    chunks: Vec<StoredChunk>,
}

impl VectorStore {
    pub fn new(repository_id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            provider_id: provider_id.into(),
            filter_id: String::new(),
            dimension: None,
            documents: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Records which path filter selected the documents, so a store built under one filter is
    /// never reused under another.
    pub fn with_filter_id(mut self, filter_id: impl Into<String>) -> Self {
        self.filter_id = filter_id.into();
        self
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn filter_id(&self) -> &str {
        &self.filter_id
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn documents(&self) -> &[DocumentSummary] {
        &self.documents
    }

    pub fn register_document(&mut self, summary: DocumentSummary) {
        match self.documents.iter_mut().find(|existing| existing.id == summary.id) {
            Some(existing) => *existing = summary,
            None => self.documents.push(summary),
        }
    }

    /// Accepts the chunk or rejects only this chunk; a rejected add never changes the dimension.
    pub fn add(&mut self, chunk: StoredChunk) -> Result<usize, RagError> {
        let actual = chunk.vector.len();
        if actual == 0 {
            warn!(path = %chunk.path, ordinal = chunk.ordinal, "dropping chunk with empty vector");
            return Err(RagError::Consistency {
                expected: self.dimension.unwrap_or_default(),
                actual,
            });
        }
        if !is_finite(&chunk.vector) {
            warn!(path = %chunk.path, ordinal = chunk.ordinal, "dropping chunk with non-finite vector");
            return Err(RagError::Input(format!(
                "non-finite vector for {} part {}",
                chunk.path,
                chunk.ordinal + 1
            )));
        }

        match self.dimension {
            Some(expected) if expected != actual => {
                warn!(
                    path = %chunk.path,
                    ordinal = chunk.ordinal,
                    expected,
                    actual,
                    "dropping chunk with mismatched dimension"
                );
                return Err(RagError::Consistency { expected, actual });
            }
            Some(_) => {}
            None => self.dimension = Some(actual),
        }

        self.chunks.push(chunk);
        Ok(self.chunks.len() - 1)
    }

    /// Top `k` chunks by cosine similarity; equal scores keep ingestion order.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RetrievalResult>, RagError> {
        let Some(expected) = self.dimension else {
            return Ok(Vec::new());
        };
        if vector.len() != expected {
            return Err(RagError::Consistency {
                expected,
                actual: vector.len(),
            });
        }
        if !is_finite(vector) {
            return Err(RagError::Input("query vector has non-finite components".to_string()));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(position, chunk)| (position, cosine_similarity(vector, &chunk.vector)))
            .collect();
        scored.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(position, score)| {
                let chunk = &self.chunks[position];
                RetrievalResult {
                    chunk_ref: ChunkRef {
                        position,
                        document_id: chunk.document_id.clone(),
                        path: chunk.path.clone(),
                        ordinal: chunk.ordinal,
                    },
                    score,
                    text: chunk.text.clone(),
                    token_count: chunk.token_count,
                }
            })
            .collect())
    }

    pub fn path_for(dir: &Path, repository_id: &str) -> PathBuf {
        dir.join(format!("{repository_id}.json"))
    }

    /// Writes the blob next to its final name and renames it into place.
    pub async fn save(&self, dir: &Path) -> Result<PathBuf, RagError> {
        tokio::fs::create_dir_all(dir).await?;
        let target = Self::path_for(dir, &self.repository_id);
        let staging = dir.join(format!("{}.json.tmp", self.repository_id));

        let blob = StoreBlob {
            schema_version: SCHEMA_VERSION,
            repository_id: self.repository_id.clone(),
            provider_id: self.provider_id.clone(),
            filter_id: self.filter_id.clone(),
            dimension: self.dimension,
            documents: self.documents.clone(),
            chunks: self.chunks.clone(),
        };
        let bytes = serde_json::to_vec(&blob)?;
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &target).await?;

        info!(
            path = %target.display(),
            chunks = self.chunks.len(),
            documents = self.documents.len(),
            "vector store saved"
        );
        Ok(target)
    }

    pub async fn load(
        dir: &Path,
        repository_id: &str,
        provider_id: &str,
        filter_id: &str,
        dimension: usize,
    ) -> Result<StoreLoad, RagError> {
        let path = Self::path_for(dir, repository_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(StoreLoad::Missing),
            Err(error) => return Err(error.into()),
        };

        let blob: StoreBlob = match serde_json::from_slice(&bytes) {
            Ok(blob) => blob,
            Err(error) => return Ok(StoreLoad::Incompatible(format!("unreadable store: {error}"))),
        };

        if let Some(reason) = incompatibility(&blob, repository_id, provider_id, filter_id, dimension) {
            debug!(path = %path.display(), %reason, "persisted store rejected");
            return Ok(StoreLoad::Incompatible(reason));
        }

        Ok(StoreLoad::Loaded(Self {
            repository_id: blob.repository_id,
            provider_id: blob.provider_id,
            filter_id: blob.filter_id,
            dimension: blob.dimension,
            documents: blob.documents,
            chunks: blob.chunks,
        }))
    }
}

fn incompatibility(
    blob: &StoreBlob,
    repository_id: &str,
    provider_id: &str,
    filter_id: &str,
    dimension: usize,
) -> Option<String> {
    if blob.schema_version != SCHEMA_VERSION {
        return Some(format!(
            "schema version {} (expected {SCHEMA_VERSION})",
            blob.schema_version
        ));
    }
    if blob.repository_id != repository_id {
        return Some(format!("store belongs to repository {}", blob.repository_id));
    }
    if blob.provider_id != provider_id {
        return Some(format!(
            "embedded by {} (configured {provider_id})",
            blob.provider_id
        ));
    }
    if blob.filter_id != filter_id {
        return Some("built with different path filters".to_string());
    }
    match blob.dimension {
        Some(stored) if stored != dimension => {
            return Some(format!("dimension {stored} (provider emits {dimension})"));
        }
        None if !blob.chunks.is_empty() => return Some("chunks without a dimension".to_string()),
        _ => {}
    }
    if blob
        .chunks
        .iter()
        .any(|chunk| chunk.vector.len() != dimension || !is_finite(&chunk.vector))
    {
        return Some("degenerate vectors".to_string());
    }
    None
}

fn is_finite(vector: &[f32]) -> bool {
    vector.iter().all(|component| component.is_finite())
}

/// Shared snapshot of the current store. Readers hold an `Arc` of a fully-built store;
/// ingestion publishes a replacement in one swap.
#[derive(Debug, Clone, Default)]
pub struct StoreHandle {
    current: Arc<RwLock<Option<Arc<VectorStore>>>>,
}

impl StoreHandle {
    pub fn snapshot(&self) -> Option<Arc<VectorStore>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, store: VectorStore) -> Arc<VectorStore> {
        let published = Arc::new(store);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(published.clone());
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentKind;
    use tempfile::tempdir;

    fn chunk(path: &str, ordinal: usize, vector: Vec<f32>) -> StoredChunk {
        StoredChunk {
            document_id: format!("doc-{path}"),
            path: path.to_string(),
            ordinal,
            text: format!("{path}#{ordinal}"),
            token_count: 1,
            vector,
        }
    }

    fn populated() -> Result<VectorStore, RagError> {
        let mut store = VectorStore::new("repo", "hashing-3");
        store.register_document(DocumentSummary {
            id: "doc-a.rs".to_string(),
            path: "a.rs".to_string(),
            kind: DocumentKind::Code,
            token_count: 3,
        });
        store.add(chunk("a.rs", 0, vec![1.0, 0.0, 0.0]))?;
        store.add(chunk("a.rs", 1, vec![0.0, 1.0, 0.0]))?;
        store.add(chunk("b.md", 0, vec![1.0, 0.0, 0.0]))?;
        Ok(store)
    }

    #[test]
    fn mismatched_dimension_is_rejected_and_never_returned() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = populated()?;
        let rejected = store.add(chunk("c.rs", 0, vec![1.0, 0.0]));
        assert!(matches!(
            rejected,
            Err(RagError::Consistency {
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(store.dimension(), Some(3));
        assert_eq!(store.len(), 3);

        let results = store.query(&[1.0, 0.0, 0.0], 10)?;
        assert!(results.iter().all(|result| result.chunk_ref.path != "c.rs"));
        Ok(())
    }

    #[test]
    fn ties_keep_ingestion_order() -> Result<(), Box<dyn std::error::Error>> {
        let store = populated()?;
        let results = store.query(&[1.0, 0.0, 0.0], 2)?;
        let order: Vec<usize> = results.iter().map(|result| result.chunk_ref.position).collect();
        assert_eq!(order, vec![0, 2]);
        assert!(results[0].score >= results[1].score);
        Ok(())
    }

    #[test]
    fn empty_and_small_stores_return_what_they_have() -> Result<(), Box<dyn std::error::Error>> {
        let empty = VectorStore::new("repo", "hashing-3");
        assert!(empty.query(&[1.0, 0.0, 0.0], 5)?.is_empty());

        let store = populated()?;
        assert_eq!(store.query(&[0.0, 0.0, 1.0], 50)?.len(), 3);
        Ok(())
    }

    #[test]
    fn query_with_wrong_dimension_is_a_consistency_error() -> Result<(), Box<dyn std::error::Error>> {
        let store = populated()?;
        assert!(matches!(store.query(&[1.0], 1), Err(RagError::Consistency { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn save_then_load_round_trips() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = populated()?;
        let probe = [0.6, 0.8, 0.0];
        let before = store.query(&probe, 2)?;
        store.save(dir.path()).await?;

        let StoreLoad::Loaded(loaded) = VectorStore::load(dir.path(), "repo", "hashing-3", "", 3).await? else {
            return Err("store did not load".into());
        };
        assert_eq!(loaded.query(&probe, 2)?, before);
        assert_eq!(loaded.documents(), store.documents());
        Ok(())
    }

    #[tokio::test]
    async fn empty_store_round_trips_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        VectorStore::new("repo", "hashing-3").save(dir.path()).await?;
        let loaded = VectorStore::load(dir.path(), "repo", "hashing-3", "", 3).await?;
        assert!(matches!(loaded, StoreLoad::Loaded(store) if store.is_empty()));
        Ok(())
    }

    #[tokio::test]
    async fn provider_or_dimension_changes_force_reingestion() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        populated()?.save(dir.path()).await?;

        let other_provider = VectorStore::load(dir.path(), "repo", "openai:x:3", "", 3).await?;
        assert!(matches!(other_provider, StoreLoad::Incompatible(_)));
        let other_dimension = VectorStore::load(dir.path(), "repo", "hashing-3", "", 8).await?;
        assert!(matches!(other_dimension, StoreLoad::Incompatible(_)));
        let missing = VectorStore::load(dir.path(), "elsewhere", "hashing-3", "", 3).await?;
        assert!(matches!(missing, StoreLoad::Missing));
        Ok(())
    }

    #[tokio::test]
    async fn stores_built_under_other_filters_are_not_reused() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        populated()?.with_filter_id("docs-only").save(dir.path()).await?;

        let unfiltered = VectorStore::load(dir.path(), "repo", "hashing-3", "", 3).await?;
        assert!(matches!(unfiltered, StoreLoad::Incompatible(reason) if reason.contains("filters")));
        let same = VectorStore::load(dir.path(), "repo", "hashing-3", "docs-only", 3).await?;
        assert!(matches!(same, StoreLoad::Loaded(store) if store.filter_id() == "docs-only"));
        Ok(())
    }

    #[test]
    fn non_finite_vectors_are_rejected_and_queries_stay_ordered() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = VectorStore::new("repo", "hashing-2");
        for index in 0..40 {
            let vector = if index % 3 == 0 {
                vec![f32::NAN, 1.0]
            } else {
                vec![1.0, index as f32 / 40.0]
            };
            let added = store.add(chunk("a.rs", index, vector));
            assert_eq!(added.is_err(), index % 3 == 0);
        }
        assert_eq!(store.len(), 26);

        let results = store.query(&[1.0, 0.5], 5)?;
        assert_eq!(results.len(), 5);
        assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
        assert!(results.iter().all(|result| result.score.is_finite()));
        assert!(matches!(store.query(&[f32::NAN, 0.0], 5), Err(RagError::Input(_))));
        Ok(())
    }

    #[tokio::test]
    async fn persisted_non_finite_vectors_are_incompatible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        populated()?.save(dir.path()).await?;
        let path = VectorStore::path_for(dir.path(), "repo");
        let raw = std::fs::read_to_string(&path)?;
        std::fs::write(&path, raw.replacen("[1.0,0.0,0.0]", "[1.0,null,0.0]", 1))?;

        let loaded = VectorStore::load(dir.path(), "repo", "hashing-3", "", 3).await?;
        assert!(matches!(loaded, StoreLoad::Incompatible(_)));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_blobs_are_incompatible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        std::fs::write(VectorStore::path_for(dir.path(), "repo"), b"{not json")?;
        let loaded = VectorStore::load(dir.path(), "repo", "hashing-3", "", 3).await?;
        assert!(matches!(loaded, StoreLoad::Incompatible(_)));
        Ok(())
    }

    #[test]
    fn handle_swaps_whole_snapshots() -> Result<(), Box<dyn std::error::Error>> {
        let handle = StoreHandle::default();
        assert!(handle.snapshot().is_none());

        let first = handle.replace(populated()?);
        let reader = handle.snapshot().ok_or("missing snapshot")?;
        handle.replace(VectorStore::new("repo", "hashing-3"));

        assert_eq!(reader.len(), first.len());
        assert_eq!(handle.snapshot().map(|store| store.len()), Some(0));
        Ok(())
    }
}
