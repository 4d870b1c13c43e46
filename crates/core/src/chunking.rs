use crate::error::IngestError;
use crate::models::{DocumentPage, Passage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
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
            min_chars: 1,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_chars {} must be smaller than max_chars {}",
                self.overlap_chars, self.max_chars
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

/// Groups paragraphs up to `max_chars`, then splits anything still too long
/// into overlapping windows. Lengths are counted in characters.
pub fn chunk_by_paragraph(text: &str, config: ChunkingConfig) -> Vec<String> {
    let paragraphs = text
        .split("\n\n")
        .map(normalize_whitespace)
        .filter(|paragraph| !paragraph.is_empty());

    group_paragraphs(paragraphs, config)
        .into_iter()
        .flat_map(|group| window(group, config))
        .collect()
}

fn group_paragraphs(paragraphs: impl Iterator<Item = String>, config: ChunkingConfig) -> Vec<String> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;

    for paragraph in paragraphs {
        let paragraph_chars = paragraph.chars().count();
        if !current.is_empty() && current_chars + 2 + paragraph_chars <= config.max_chars {
            current.push_str("\n\n");
            current.push_str(&paragraph);
            current_chars += 2 + paragraph_chars;
            continue;
        }

        if !current.is_empty() && current_chars >= config.min_chars {
            groups.push(std::mem::take(&mut current));
        }
        current = paragraph;
        current_chars = paragraph_chars;
    }

    if !current.is_empty() && current_chars >= config.min_chars {
        groups.push(current);
    }
    groups
}

fn window(group: String, config: ChunkingConfig) -> Vec<String> {
    let chars = group.chars().collect::<Vec<_>>();
    if chars.len() <= config.max_chars {
        return vec![group];
    }

    let step = config.max_chars.saturating_sub(config.overlap_chars).max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + config.max_chars).min(chars.len());
        pieces.push(chars[start..end].iter().collect());
        if end == chars.len() {
            return pieces;
        }
        start += step;
    }
}

/// Splits one page into passages. A blank page yields none but still owns its
/// page index.
pub fn split_page(page: &DocumentPage, config: ChunkingConfig) -> Vec<Passage> {
    chunk_by_paragraph(&page.text, config)
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| {
            let chunk_index = ordinal as u32;
            Passage {
                node_id: make_node_id(&page.source_path, page.page_index, chunk_index, &text),
                source_path: page.source_path.clone(),
                page_index: page.page_index,
                chunk_index,
                text,
            }
        })
        .collect()
}

fn make_node_id(source_path: &str, page: u32, index: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(text: &str) -> DocumentPage {
        DocumentPage {
            source_path: "/tmp/manual.pdf".to_string(),
            page_index: 4,
            text: text.to_string(),
        }
    }

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        let normalized = normalize_whitespace(input);
        assert_eq!(normalized, "A lot of spacing");
    }

    #[test]
    fn short_page_becomes_one_passage() {
        let passages = split_page(&page("Torque the bolts\nto 40 Nm."), ChunkingConfig::default());
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].text, "Torque the bolts to 40 Nm.");
        assert_eq!(passages[0].page_index, 4);
        assert_eq!(passages[0].chunk_index, 0);
    }

    #[test]
    fn blank_page_yields_no_passages() {
        assert!(split_page(&page("  \n\n \t"), ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn long_paragraph_is_windowed_with_overlap() {
        let config = ChunkingConfig {
            max_chars: 10,
            overlap_chars: 4,
            min_chars: 1,
        };
        let chunks = chunk_by_paragraph("abcdefghijklmnop", config);
        assert_eq!(chunks, vec!["abcdefghij", "ghijklmnop"]);
    }

    #[test]
    fn paragraphs_are_grouped_until_full() {
        let config = ChunkingConfig {
            max_chars: 12,
            overlap_chars: 2,
            min_chars: 1,
        };
        let chunks = chunk_by_paragraph("one\n\ntwo\n\nthree four", config);
        assert_eq!(chunks, vec!["one\n\ntwo", "three four"]);
    }

    #[test]
    fn node_ids_differ_per_chunk() {
        let config = ChunkingConfig {
            max_chars: 8,
            overlap_chars: 0,
            min_chars: 1,
        };
        let passages = split_page(&page("alpha beta\n\ngamma delta"), config);
        assert!(passages.len() >= 2);
        assert_ne!(passages[0].node_id, passages[1].node_id);
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let config = ChunkingConfig {
            max_chars: 10,
            overlap_chars: 10,
            min_chars: 1,
        };
        assert!(config.validate().is_err());
        assert!(ChunkingConfig::default().validate().is_ok());
    }
}
