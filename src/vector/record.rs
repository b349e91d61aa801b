//! Record and search-hit types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filterable metadata value: the closed set of primitives that exact-match
/// filters understand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered metadata map attached to a record
pub type Metadata = BTreeMap<String, MetaValue>;

/// Input to an insert: everything but the derived fields
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub content: String,
    pub metadata: Metadata,
    pub document_id: Option<String>,
    pub chunk_index: Option<u32>,
}

impl NewRecord {
    /// Minimal record with just an id, embedding, and content
    pub fn new(id: impl Into<String>, embedding: Vec<f32>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            embedding,
            content: content.into(),
            metadata: Metadata::new(),
            document_id: None,
            chunk_index: None,
        }
    }

    /// Attach a metadata pair
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attribute the record to a document chunk
    pub fn with_chunk(mut self, document_id: impl Into<String>, chunk_index: u32) -> Self {
        self.document_id = Some(document_id.into());
        self.chunk_index = Some(chunk_index);
        self
    }
}

/// A stored record as returned by `get`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
    pub document_id: Option<String>,
    pub chunk_index: Option<u32>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// One search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Normalized similarity in [0, 1], higher is closer
    pub score: f32,
    /// Populated only when the caller asked for embeddings back
    pub embedding: Option<Vec<f32>>,
}

/// True when every pair in `filter` matches `metadata` exactly
pub fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}
