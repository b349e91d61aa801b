//! On-disk layout for the vector store
//!
//! - `vectors.db` — sled record table plus secondary index trees
//! - `embeddings.bin` — raw row-major f32 matrix
//! - `embeddings.bin.bak` — prior matrix, used when the primary fails to load
//! - `index_<backend>.bin` — serialized index structure (absent for flat)
//! - `metadata.json` — index type, version, and rebuild bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::vector::backend::IndexKind;
use crate::vector::record::Metadata;
use crate::vector::store::{VectorStoreError, VectorStoreResult};

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

const SEPARATOR: u8 = 0;

/// A record row as stored in the sled table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Row index into the embedding matrix
    pub row: usize,
    pub document_id: Option<String>,
    pub chunk_index: Option<u32>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Sidecar metadata describing the index files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub version: u32,
    pub index_type: String,
    pub total_vectors: usize,
    pub last_rebuild_ms: i64,
    pub dimension: usize,
}

/// Handle over every file the store persists
#[derive(Debug)]
pub struct VectorFiles {
    records: sled::Tree,
    by_doc: sled::Tree,
    by_chunk: sled::Tree,
    by_hash: sled::Tree,
    _db: sled::Db,
    dir: PathBuf,
}

fn storage_err(err: impl std::fmt::Display) -> VectorStoreError {
    VectorStoreError::Storage(err.to_string())
}

fn compound_key(prefix: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + id.len());
    key.extend_from_slice(prefix.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

impl VectorFiles {
    /// Open (creating if needed) the persistence directory
    pub fn open(dir: impl AsRef<Path>) -> VectorStoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(storage_err)?;
        let db = sled::open(dir.join("vectors.db")).map_err(storage_err)?;
        Ok(Self {
            records: db.open_tree("records").map_err(storage_err)?,
            by_doc: db.open_tree("by_doc").map_err(storage_err)?,
            by_chunk: db.open_tree("by_chunk").map_err(storage_err)?,
            by_hash: db.open_tree("by_hash").map_err(storage_err)?,
            _db: db,
            dir,
        })
    }

    fn embeddings_path(&self) -> PathBuf {
        self.dir.join("embeddings.bin")
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join("embeddings.bin.bak")
    }

    fn index_path(&self, kind: IndexKind) -> PathBuf {
        self.dir.join(format!("index_{}.bin", kind.name()))
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    /// Insert or replace a record row and its secondary index entries
    pub fn put_record(&self, record: &StoredRecord) -> VectorStoreResult<()> {
        let encoded = serde_json::to_vec(record)
            .map_err(|e| VectorStoreError::Serialization(e.to_string()))?;
        self.records
            .insert(record.id.as_bytes(), encoded)
            .map_err(storage_err)?;

        if let Some(doc) = &record.document_id {
            self.by_doc
                .insert(compound_key(doc, &record.id), record.id.as_bytes())
                .map_err(storage_err)?;
            if let Some(chunk) = record.chunk_index {
                let key = compound_key(&format!("{}\u{0}{:08}", doc, chunk), &record.id);
                self.by_chunk
                    .insert(key, record.id.as_bytes())
                    .map_err(storage_err)?;
            }
        }
        self.by_hash
            .insert(
                compound_key(&record.content_hash, &record.id),
                record.id.as_bytes(),
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// Remove a record row and its secondary index entries
    pub fn delete_record(&self, record: &StoredRecord) -> VectorStoreResult<()> {
        self.records
            .remove(record.id.as_bytes())
            .map_err(storage_err)?;
        if let Some(doc) = &record.document_id {
            self.by_doc
                .remove(compound_key(doc, &record.id))
                .map_err(storage_err)?;
            if let Some(chunk) = record.chunk_index {
                let key = compound_key(&format!("{}\u{0}{:08}", doc, chunk), &record.id);
                self.by_chunk.remove(key).map_err(storage_err)?;
            }
        }
        self.by_hash
            .remove(compound_key(&record.content_hash, &record.id))
            .map_err(storage_err)?;
        Ok(())
    }

    /// All stored record rows
    pub fn load_records(&self) -> VectorStoreResult<Vec<StoredRecord>> {
        let mut out = Vec::new();
        for item in self.records.iter() {
            let (_, value) = item.map_err(storage_err)?;
            let record: StoredRecord = serde_json::from_slice(&value)
                .map_err(|e| VectorStoreError::Corrupt(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    /// Record ids sharing a content hash
    pub fn find_by_hash(&self, hash: &str) -> VectorStoreResult<Vec<String>> {
        let mut prefix = hash.as_bytes().to_vec();
        prefix.push(SEPARATOR);
        let mut out = Vec::new();
        for item in self.by_hash.scan_prefix(prefix) {
            let (_, value) = item.map_err(storage_err)?;
            out.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(out)
    }

    /// Record ids belonging to a document
    pub fn find_by_document(&self, document_id: &str) -> VectorStoreResult<Vec<String>> {
        let mut prefix = document_id.as_bytes().to_vec();
        prefix.push(SEPARATOR);
        let mut out = Vec::new();
        for item in self.by_doc.scan_prefix(prefix) {
            let (_, value) = item.map_err(storage_err)?;
            out.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(out)
    }

    /// Write the embedding matrix, rotating the current file to `.bak`
    pub fn write_embeddings(&self, data: &[f32]) -> VectorStoreResult<()> {
        let primary = self.embeddings_path();
        if primary.exists() {
            fs::copy(&primary, self.backup_path()).map_err(storage_err)?;
        }

        let mut bytes = Vec::with_capacity(data.len() * 4);
        for value in data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let tmp = self.dir.join("embeddings.bin.tmp");
        fs::write(&tmp, &bytes).map_err(storage_err)?;
        fs::rename(&tmp, &primary).map_err(storage_err)?;
        Ok(())
    }

    /// Load the embedding matrix, falling back to the backup copy
    pub fn load_embeddings(&self, dimension: usize) -> VectorStoreResult<Vec<f32>> {
        match Self::read_matrix(&self.embeddings_path(), dimension) {
            Ok(data) => Ok(data),
            Err(primary_err) => {
                tracing::warn!(
                    error = %primary_err,
                    "embedding file unreadable, recovering from backup"
                );
                Self::read_matrix(&self.backup_path(), dimension)
            }
        }
    }

    fn read_matrix(path: &Path, dimension: usize) -> VectorStoreResult<Vec<f32>> {
        let bytes = fs::read(path).map_err(storage_err)?;
        if bytes.len() % 4 != 0 {
            return Err(VectorStoreError::Corrupt(format!(
                "embedding file length {} not a multiple of 4",
                bytes.len()
            )));
        }
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if dimension > 0 && floats.len() % dimension != 0 {
            return Err(VectorStoreError::Corrupt(format!(
                "embedding count {} not a multiple of dimension {}",
                floats.len(),
                dimension
            )));
        }
        Ok(floats)
    }

    /// Whether an embedding file (primary or backup) exists
    pub fn has_embeddings(&self) -> bool {
        self.embeddings_path().exists() || self.backup_path().exists()
    }

    /// Persist the serialized index structure
    pub fn write_index(&self, kind: IndexKind, bytes: &[u8]) -> VectorStoreResult<()> {
        fs::write(self.index_path(kind), bytes).map_err(storage_err)
    }

    /// Load the serialized index structure, if present
    pub fn load_index(&self, kind: IndexKind) -> Option<Vec<u8>> {
        fs::read(self.index_path(kind)).ok()
    }

    /// Write the sidecar metadata file
    pub fn write_metadata(&self, meta: &IndexMetadata) -> VectorStoreResult<()> {
        let encoded = serde_json::to_vec_pretty(meta)
            .map_err(|e| VectorStoreError::Serialization(e.to_string()))?;
        fs::write(self.metadata_path(), encoded).map_err(storage_err)
    }

    /// Load the sidecar metadata file, if present
    pub fn load_metadata(&self) -> VectorStoreResult<Option<IndexMetadata>> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(storage_err)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VectorStoreError::Corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::record::MetaValue;

    fn record(id: &str, row: usize) -> StoredRecord {
        let mut metadata = Metadata::new();
        metadata.insert("doc".into(), MetaValue::Str("1".into()));
        StoredRecord {
            id: id.to_string(),
            content: format!("content of {}", id),
            metadata,
            row,
            document_id: Some("doc-1".into()),
            chunk_index: Some(row as u32),
            content_hash: format!("hash-{}", id),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = VectorFiles::open(dir.path()).unwrap();

        files.put_record(&record("a", 0)).unwrap();
        files.put_record(&record("b", 1)).unwrap();

        let mut loaded = files.load_records().unwrap();
        loaded.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[0].row, 0);
        assert_eq!(
            loaded[0].metadata.get("doc"),
            Some(&MetaValue::Str("1".into()))
        );
    }

    #[test]
    fn test_secondary_indices() {
        let dir = tempfile::tempdir().unwrap();
        let files = VectorFiles::open(dir.path()).unwrap();

        files.put_record(&record("a", 0)).unwrap();
        files.put_record(&record("b", 1)).unwrap();

        assert_eq!(files.find_by_document("doc-1").unwrap().len(), 2);
        assert_eq!(files.find_by_hash("hash-a").unwrap(), vec!["a".to_string()]);

        files.delete_record(&record("a", 0)).unwrap();
        assert_eq!(files.find_by_document("doc-1").unwrap().len(), 1);
        assert!(files.find_by_hash("hash-a").unwrap().is_empty());
    }

    #[test]
    fn test_embeddings_round_trip_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let files = VectorFiles::open(dir.path()).unwrap();

        files.write_embeddings(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(
            files.load_embeddings(2).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );

        // A second write rotates the first matrix into the backup slot.
        files.write_embeddings(&[5.0, 6.0]).unwrap();
        assert_eq!(files.load_embeddings(2).unwrap(), vec![5.0, 6.0]);

        // Corrupt the primary: load falls back to the backup.
        fs::write(dir.path().join("embeddings.bin"), [1, 2, 3]).unwrap();
        assert_eq!(
            files.load_embeddings(2).unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_metadata_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let files = VectorFiles::open(dir.path()).unwrap();
        assert!(files.load_metadata().unwrap().is_none());

        let meta = IndexMetadata {
            version: FORMAT_VERSION,
            index_type: "hnsw".into(),
            total_vectors: 42,
            last_rebuild_ms: 1_700_000_000_000,
            dimension: 384,
        };
        files.write_metadata(&meta).unwrap();
        let loaded = files.load_metadata().unwrap().unwrap();
        assert_eq!(loaded.index_type, "hnsw");
        assert_eq!(loaded.total_vectors, 42);
        assert_eq!(loaded.dimension, 384);
    }
}
