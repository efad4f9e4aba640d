use crate::error::RagError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;

const LEXICAL_PATTERN: &str = r"\w+|[^\w\s]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TokenizerKind {
    /// Word runs and individual punctuation marks.
    Lexical,
    /// Fixed character windows, for vendors that only publish a chars-per-token ratio.
    CharEstimate { chars_per_token: usize },
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    kind: TokenizerKind,
    pattern: Regex,
}

impl Tokenizer {
    pub fn new(kind: TokenizerKind) -> Result<Self, RagError> {
        if let TokenizerKind::CharEstimate { chars_per_token: 0 } = kind {
            return Err(RagError::Config("chars_per_token must be positive".to_string()));
        }
        Ok(Self {
            kind,
            pattern: Regex::new(LEXICAL_PATTERN)?,
        })
    }

    /// Byte ranges of every token, in order.
    pub fn spans(&self, text: &str) -> Result<Vec<Range<usize>>, RagError> {
        if text.contains('\0') {
            return Err(RagError::Input("text contains NUL bytes and cannot be tokenized".to_string()));
        }

        match self.kind {
            TokenizerKind::Lexical => Ok(self.pattern.find_iter(text).map(|m| m.range()).collect()),
            TokenizerKind::CharEstimate { chars_per_token } => {
                let mut spans = Vec::new();
                let mut start = None;
                let mut taken = 0;
                for (offset, character) in text.char_indices() {
                    if start.is_none() {
                        if character.is_whitespace() {
                            continue;
                        }
                        start = Some(offset);
                    }
                    taken += 1;
                    if taken == chars_per_token {
                        let end = offset + character.len_utf8();
                        spans.push(start.unwrap_or(offset)..end);
                        start = None;
                        taken = 0;
                    }
                }
                if let Some(begin) = start {
                    let end = text.trim_end().len().max(begin);
                    if end > begin {
                        spans.push(begin..end);
                    }
                }
                Ok(spans)
            }
        }
    }

    pub fn count(&self, text: &str) -> Result<usize, RagError> {
        if text.contains('\0') {
            return Err(RagError::Input("text contains NUL bytes and cannot be tokenized".to_string()));
        }
        match self.kind {
            TokenizerKind::Lexical => Ok(self.pattern.find_iter(text).count()),
            TokenizerKind::CharEstimate { .. } => Ok(self.spans(text)?.len()),
        }
    }
}
