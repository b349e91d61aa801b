//! Sentence-aware document chunking
//!
//! This module provides:
//! - Splitting of source text into overlapping, sentence-aligned chunks
//! - Citation-safe sentence boundary detection for legal text
//! - Positional metadata (offsets, word counts, totals) on every chunk

pub mod chunker;
pub mod sentence;

pub use chunker::{ChunkerConfig, DocumentChunk, DocumentChunker};
pub use sentence::split_sentences;
