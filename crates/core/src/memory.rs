use crate::error::RagError;
use crate::models::DialogTurn;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Append-only turn log for one session. Appends are serialized; readers always get a
/// consistent snapshot and never an error.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    turns: RwLock<Vec<DialogTurn>>,
    journal: Mutex<Option<tokio::fs::File>>,
    journal_path: Option<PathBuf>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays a JSON-lines journal and keeps appending to it. Unparseable lines, such as a
    /// torn final write, are dropped.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RagError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut turns = Vec::new();
        let mut torn_tail = false;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                torn_tail = !raw.is_empty() && !raw.ends_with('\n');
                for (line_number, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<DialogTurn>(line) {
                        Ok(turn) => turns.push(turn),
                        Err(error) => {
                            warn!(path = %path.display(), line = line_number + 1, %error, "ignoring journal line")
                        }
                    }
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if torn_tail {
            file.write_all(b"\n").await?;
        }
        debug!(path = %path.display(), turns = turns.len(), "conversation journal opened");

        Ok(Self {
            turns: RwLock::new(turns),
            journal: Mutex::new(Some(file)),
            journal_path: Some(path),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    /// The turn becomes visible to readers only after it is durable in the journal.
    pub async fn append(&self, question: impl Into<String>, answer: impl Into<String>) -> Result<DialogTurn, RagError> {
        let mut journal = self.journal.lock().await;

        let id = self
            .read()
            .last()
            .map(|turn| turn.id + 1)
            .unwrap_or(1);
        let turn = DialogTurn {
            id,
            question: question.into(),
            answer: answer.into(),
            created_at: Utc::now(),
        };

        if let Some(file) = journal.as_mut() {
            let mut line = serde_json::to_vec(&turn)?;
            line.push(b'\n');
            let committed = file.metadata().await?.len();
            if let Err(error) = write_line(file, &line).await {
                // A partial line would swallow the next append on replay.
                if let Err(truncate_error) = file.set_len(committed).await {
                    warn!(%truncate_error, "could not roll back a failed journal write");
                }
                return Err(error.into());
            }
        }

        self.turns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(turn.clone());
        Ok(turn)
    }

    pub fn history(&self) -> Vec<DialogTurn> {
        self.read().clone()
    }

    /// Up to `n` most recent turns, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<DialogTurn> {
        let turns = self.read();
        let start = turns.len().saturating_sub(n);
        turns[start..].to_vec()
    }

    pub fn get(&self, index: usize) -> Option<DialogTurn> {
        self.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<DialogTurn>> {
        self.turns.read().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_line(file: &mut tokio::fs::File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.sync_data().await
}

/// Caller-owned conversation scope. Each session gets its own memory.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub memory: Arc<ConversationMemory>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Result<Self, RagError> {
        let session_id = validate_session_id(session_id.into())?;
        Ok(Self {
            session_id,
            memory: Arc::new(ConversationMemory::new()),
        })
    }

    /// Session backed by `<journal_dir>/<session id>.jsonl`.
    pub async fn open(session_id: impl Into<String>, journal_dir: &Path) -> Result<Self, RagError> {
        let session_id = validate_session_id(session_id.into())?;
        let memory = ConversationMemory::open(journal_path(journal_dir, &session_id)).await?;
        Ok(Self {
            session_id,
            memory: Arc::new(memory),
        })
    }
}

/// Fresh random session id for callers that do not bring their own.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Ids made of ASCII letters, digits and `-` keep their own name. Anything else is stored
/// under `_<sha256 of the id>`, which no plain id can spell, so distinct sessions never share a
/// journal.
pub fn journal_path(journal_dir: &Path, session_id: &str) -> PathBuf {
    let plain = session_id.len() <= MAX_PLAIN_STEM
        && session_id
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '-');
    let file_stem = if plain {
        session_id.to_string()
    } else {
        format!("_{}", hex_digest(session_id.as_bytes()))
    };
    journal_dir.join(format!("{file_stem}.jsonl"))
}

const MAX_PLAIN_STEM: usize = 128;

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn validate_session_id(session_id: String) -> Result<String, RagError> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(RagError::State("session id must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}
