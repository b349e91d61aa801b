//! Overlapping chunk emission over sentence-aligned boundaries

use serde::{Deserialize, Serialize};

use crate::chunking::sentence::split_sentences;

/// Chunker tunables, in approximate word-tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Target chunk size
    pub target_tokens: usize,
    /// Tokens of the prior chunk repeated at the head of the next
    pub overlap_tokens: usize,
    /// Chunks never end up smaller than this unless the source is
    pub min_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 512,
            overlap_tokens: 50,
            min_tokens: 100,
        }
    }
}

/// A contiguous span of the source document with positional metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub chunk_index: usize,
    pub document_id: String,
    pub word_count: usize,
    pub total_chunks: usize,
}

/// Splits documents into overlapping, sentence-aligned chunks
pub struct DocumentChunker {
    config: ChunkerConfig,
}

impl DocumentChunker {
    /// Create a chunker with the given configuration
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunk `text`, attributing every chunk to `document_id`
    pub fn chunk(&self, document_id: &str, text: &str) -> Vec<DocumentChunk> {
        let words = word_spans(text);
        if words.is_empty() {
            return Vec::new();
        }

        if words.len() <= self.config.min_tokens {
            return vec![self.materialize(document_id, text, &words, 0, words.len(), 0, 1)];
        }

        // Word indices at which a sentence ends; chunk cuts prefer these.
        let boundaries = sentence_word_boundaries(text, &words);

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut start = 0usize;
        loop {
            let ideal_end = start + self.config.target_tokens;
            if ideal_end >= words.len() {
                ranges.push((start, words.len()));
                break;
            }

            // Largest sentence end inside the window that still leaves a
            // full-size chunk, else a hard cut.
            let end = boundaries
                .iter()
                .copied()
                .filter(|&b| b >= start + self.config.min_tokens && b <= ideal_end)
                .max()
                .unwrap_or(ideal_end);
            ranges.push((start, end));

            if end >= words.len() {
                break;
            }
            let next = end.saturating_sub(self.config.overlap_tokens);
            start = if next > start { next } else { end };
        }

        // A runt tail folds into its predecessor.
        if ranges.len() > 1 {
            let last = ranges[ranges.len() - 1];
            if last.1 - last.0 < self.config.min_tokens {
                ranges.pop();
                let prev = ranges.last_mut().expect("at least one range remains");
                prev.1 = words.len();
            }
        }

        let total = ranges.len();
        ranges
            .into_iter()
            .enumerate()
            .map(|(index, (from, to))| {
                self.materialize(document_id, text, &words, from, to, index, total)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn materialize(
        &self,
        document_id: &str,
        text: &str,
        words: &[(usize, usize)],
        from: usize,
        to: usize,
        chunk_index: usize,
        total_chunks: usize,
    ) -> DocumentChunk {
        let start_offset = words[from].0;
        let end_offset = words[to - 1].1;
        DocumentChunk {
            text: text[start_offset..end_offset].to_string(),
            start_offset,
            end_offset,
            chunk_index,
            document_id: document_id.to_string(),
            word_count: to - from,
            total_chunks,
        }
    }
}

impl Default for DocumentChunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

/// Byte spans of whitespace-delimited words
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        spans.push((start, i));
    }
    spans
}

/// For each sentence, the index one past its final word
fn sentence_word_boundaries(text: &str, words: &[(usize, usize)]) -> Vec<usize> {
    let mut boundaries = Vec::new();
    for sentence in split_sentences(text) {
        let count_before_end = words.partition_point(|&(start, _)| start < sentence.end);
        if count_before_end > 0 {
            boundaries.push(count_before_end);
        }
    }
    boundaries.dedup();
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legal_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| {
                format!(
                    "Clause {} obligates the supplier to deliver goods within thirty days \
                     of written notice under the master agreement.",
                    i
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_short_input_single_chunk() {
        let chunker = DocumentChunker::default();
        let chunks = chunker.chunk("doc-1", "A short filing.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].word_count, 3);
    }

    #[test]
    fn test_empty_input_no_chunks() {
        let chunker = DocumentChunker::default();
        assert!(chunker.chunk("doc-1", "").is_empty());
    }

    #[test]
    fn test_chunks_meet_minimum_size() {
        let chunker = DocumentChunker::default();
        let text = legal_text(200);
        let chunks = chunker.chunk("doc-1", &text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                chunk.word_count >= 100,
                "chunk {} has only {} words",
                chunk.chunk_index,
                chunk.word_count
            );
        }
    }

    #[test]
    fn test_chunk_metadata_consistent() {
        let chunker = DocumentChunker::default();
        let text = legal_text(150);
        let chunks = chunker.chunk("agreement-7", &text);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.total_chunks, total);
            assert_eq!(chunk.document_id, "agreement-7");
            assert_eq!(chunk.text, &text[chunk.start_offset..chunk.end_offset]);
        }
    }

    #[test]
    fn test_overlap_repeats_prior_words() {
        let config = ChunkerConfig {
            target_tokens: 40,
            overlap_tokens: 10,
            min_tokens: 10,
        };
        let chunker = DocumentChunker::new(config);
        let text = legal_text(20);
        let chunks = chunker.chunk("doc-1", &text);
        assert!(chunks.len() > 1);

        for pair in chunks.windows(2) {
            // Each chunk starts at or before the previous chunk's end.
            assert!(pair[1].start_offset < pair[0].end_offset);
        }
    }

    #[test]
    fn test_coverage_reconstructs_source() {
        let config = ChunkerConfig {
            target_tokens: 50,
            overlap_tokens: 10,
            min_tokens: 10,
        };
        let chunker = DocumentChunker::new(config);
        let text = legal_text(30);
        let chunks = chunker.chunk("doc-1", &text);

        // Rebuild the word sequence, skipping each chunk's words that the
        // previous chunk already emitted via the overlap region.
        let mut rebuilt: Vec<&str> = Vec::new();
        let mut covered_end = 0usize;
        for chunk in &chunks {
            let duplicated = if chunk.start_offset < covered_end {
                text[chunk.start_offset..covered_end]
                    .split_whitespace()
                    .count()
            } else {
                0
            };
            rebuilt.extend(chunk.text.split_whitespace().skip(duplicated));
            covered_end = chunk.end_offset;
        }

        let expected: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rebuilt, expected);
    }

    use proptest::prelude::*;

    proptest! {
        /// Every input splits into chunks that jointly cover the source
        /// and individually respect the minimum size.
        #[test]
        fn prop_chunking_covers_any_input(sentences in 1usize..120) {
            let chunker = DocumentChunker::new(ChunkerConfig {
                target_tokens: 60,
                overlap_tokens: 12,
                min_tokens: 15,
            });
            let text = legal_text(sentences);
            let chunks = chunker.chunk("doc", &text);
            let total_words = text.split_whitespace().count();

            let mut rebuilt: Vec<&str> = Vec::new();
            let mut covered_end = 0usize;
            for chunk in &chunks {
                let duplicated = if chunk.start_offset < covered_end {
                    text[chunk.start_offset..covered_end].split_whitespace().count()
                } else {
                    0
                };
                rebuilt.extend(chunk.text.split_whitespace().skip(duplicated));
                covered_end = chunk.end_offset;

                prop_assert!(
                    chunk.word_count >= 15 || total_words <= 15,
                    "undersized chunk {}", chunk.chunk_index
                );
            }
            prop_assert_eq!(rebuilt.len(), total_words);
        }
    }

    #[test]
    fn test_sentences_not_split_mid_citation() {
        let config = ChunkerConfig {
            target_tokens: 12,
            overlap_tokens: 2,
            min_tokens: 4,
        };
        let chunker = DocumentChunker::new(config);
        let text = "The court relied on Marbury v. Madison throughout the opinion. \
                    The dissent cited United Co. precedent instead and was unmoved. \
                    A later panel distinguished both holdings on the facts presented.";
        let chunks = chunker.chunk("doc-1", text);
        for chunk in &chunks {
            // A chunk ending exactly on "v." would mean the citation broke.
            assert!(!chunk.text.trim_end().ends_with(" v."));
        }
    }
}
