use crate::error::{PipelineError, Result};
use crate::models::TextChunk;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1_200,
            overlap_chars: 120,
            min_chars: 40,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(PipelineError::ChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(PipelineError::ChunkConfig(format!(
                "overlap_chars {} must be below max_chars {}",
                self.overlap_chars, self.max_chars
            )));
        }
        if self.min_chars > self.max_chars {
            return Err(PipelineError::ChunkConfig(format!(
                "min_chars {} must not exceed max_chars {}",
                self.min_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Greedily packs paragraphs up to `max_chars`, then splits any oversize
/// chunk on character boundaries with overlap.
pub fn chunk_by_paragraph(text: &str, config: ChunkingConfig) -> Vec<String> {
    let paragraphs = text
        .split("\n\n")
        .map(normalize_whitespace)
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>();

    let mut packed = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        if current.is_empty() {
            current.push_str(&paragraph);
            continue;
        }
        if current.len() + paragraph.len() + 2 <= config.max_chars {
            current.push_str("\n\n");
            current.push_str(&paragraph);
        } else {
            if current.len() >= config.min_chars {
                packed.push(current.clone());
            }
            current.clear();
            current.push_str(&paragraph);
        }
    }
    if current.len() >= config.min_chars {
        packed.push(current);
    }
    if packed.is_empty() && !text.trim().is_empty() {
        packed.push(normalize_whitespace(text));
    }

    let mut split = Vec::new();
    for chunk in packed {
        if chunk.len() <= config.max_chars {
            split.push(chunk);
            continue;
        }
        let chars: Vec<char> = chunk.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let end = (start + config.max_chars).min(chars.len());
            split.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start = start.saturating_add(config.max_chars.saturating_sub(config.overlap_chars));
        }
    }
    split
}

/// Chunks per-page text into indexed retrieval slices. Page numbers are
/// one-based; the chunk index is global across pages.
pub fn build_chunks(per_page: &[String], config: ChunkingConfig) -> Result<Vec<TextChunk>> {
    config.validate()?;

    let mut chunks = Vec::new();
    let mut cursor: u64 = 0;

    for (page_index, page_text) in per_page.iter().enumerate() {
        for text in chunk_by_paragraph(page_text, config) {
            if text.trim().len() < config.min_chars {
                continue;
            }
            chunks.push(TextChunk {
                index: cursor,
                page: page_index as u32 + 1,
                text,
            });
            cursor = cursor.saturating_add(1);
        }
    }
    Ok(chunks)
}
