use crate::config::ChunkingConfig;
use crate::error::RagError;
use crate::models::{Chunk, Document};
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    tokenizer: Tokenizer,
}

impl Chunker {
    pub fn new(config: ChunkingConfig, tokenizer: Tokenizer) -> Result<Self, RagError> {
        if config.max_tokens == 0 {
            return Err(RagError::Input("chunk max_tokens must be positive".to_string()));
        }
        if config.overlap_tokens >= config.max_tokens {
            return Err(RagError::Input(format!(
                "chunk overlap {} must be smaller than max_tokens {}",
                config.overlap_tokens, config.max_tokens
            )));
        }
        Ok(Self { config, tokenizer })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Overlapping token windows over the document; each chunk is an exact slice of the source text.
    pub fn split(&self, document: &Document) -> Result<Vec<Chunk>, RagError> {
        let spans = self.tokenizer.spans(&document.raw_text)?;
        if spans.is_empty() {
            return Ok(Vec::new());
        }

        let stride = self.config.max_tokens - self.config.overlap_tokens;
        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let end = (start + self.config.max_tokens).min(spans.len());
            let byte_start = spans[start].start;
            let byte_end = spans[end - 1].end;

            chunks.push(Chunk {
                document_id: document.id.clone(),
                path: document.path.clone(),
                ordinal: chunks.len(),
                text: document.raw_text[byte_start..byte_end].to_string(),
                token_count: end - start,
                vector: None,
            });

            if end == spans.len() {
                break;
            }
            start += stride;
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentKind;
    use crate::tokenizer::TokenizerKind;

    fn chunker(max_tokens: usize, overlap_tokens: usize) -> Chunker {
        let tokenizer = Tokenizer::new(TokenizerKind::Lexical).expect("pattern compiles");
        Chunker::new(
            ChunkingConfig {
                max_tokens,
                overlap_tokens,
            },
            tokenizer,
        )
        .expect("valid config")
    }

    fn document(text: &str) -> Document {
        Document::new("repo", "src/lib.rs", text.to_string(), DocumentKind::Code, 0)
    }

    fn numbered_words(count: usize) -> String {
        (0..count).map(|index| format!("w{index}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn windows_respect_max_tokens_and_overlap() -> Result<(), Box<dyn std::error::Error>> {
        let chunker = chunker(10, 3);
        let chunks = chunker.split(&document(&numbered_words(24)))?;

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 10 && chunk.token_count > 0));
        assert!(chunks[0].text.starts_with("w0 "));
        assert!(chunks[1].text.starts_with("w7 "));
        assert!(chunks[0].text.ends_with("w9"));
        assert!(chunks[2].text.ends_with("w23"));
        assert_eq!(
            chunks.iter().map(|chunk| chunk.ordinal).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        Ok(())
    }

    #[test]
    fn split_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
        let chunker = chunker(16, 4);
        let doc = document("pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\n// tail comment here");
        assert_eq!(chunker.split(&doc)?, chunker.split(&doc)?);
        Ok(())
    }

    #[test]
    fn chunk_token_count_matches_retokenized_text() -> Result<(), Box<dyn std::error::Error>> {
        let chunker = chunker(7, 2);
        let doc = document("let x = vec![1, 2, 3];\nprintln!(\"{:?}\", x);");
        for chunk in chunker.split(&doc)? {
            assert_eq!(chunker.tokenizer().count(&chunk.text)?, chunk.token_count);
        }
        Ok(())
    }

    #[test]
    fn whitespace_only_document_has_no_chunks() -> Result<(), Box<dyn std::error::Error>> {
        assert!(chunker(10, 2).split(&document("   \n\t  "))?.is_empty());
        Ok(())
    }

    #[test]
    fn untokenizable_document_is_input_error() {
        let result = chunker(10, 2).split(&document("binary\0blob"));
        assert!(matches!(result, Err(RagError::Input(_))));
    }

    #[test]
    fn overlap_must_be_smaller_than_window() -> Result<(), Box<dyn std::error::Error>> {
        let tokenizer = Tokenizer::new(TokenizerKind::Lexical)?;
        let result = Chunker::new(
            ChunkingConfig {
                max_tokens: 4,
                overlap_tokens: 4,
            },
            tokenizer,
        );
        assert!(result.is_err());
        Ok(())
    }
}
