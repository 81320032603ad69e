//! Vector storage contract and the record shapes that cross it.
//!
//! The retrieval engine is store-agnostic: everything it needs from a vector
//! database is behind [`VectorStore`] — insert-with-metadata, similarity
//! search by vector, filtered fetch, and delete-by-document. Distances are
//! L2-style: non-negative, lower means more similar, and every backend must
//! keep that convention so score fusion can invert them consistently.
//!
//! # Backends
//!
//! - [`memory::InMemoryVectorStore`] — exact scan, used as the default and as
//!   the test double.
//! - [`sqlite::SqliteVectorStore`] — SQLite with vector search via
//!   `sqlite-vec`.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hierarchy::{Chunk, ChunkType};
use crate::types::{ChunkId, KbError};

pub use memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

/// Persisted form of a chunk: the fields every backend stores per row.
///
/// `metadata` is a JSON blob that always carries `children_ids`, so the
/// hierarchy survives round-trips through stores that only keep scalar
/// columns plus one blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub content: String,
    /// Content modality: `"text"` or `"image"`.
    pub content_type: String,
    pub chunk_type: ChunkType,
    pub level: u32,
    pub parent_id: Option<ChunkId>,
    pub file_path: String,
    /// Pre-order position of the chunk within its document.
    pub chunk_index: usize,
    pub metadata: serde_json::Value,
}

impl ChunkRecord {
    /// Build the persisted record for a chunk, folding `children_ids` and the
    /// chunk's own metadata into the stored blob.
    pub fn from_chunk(chunk: &Chunk, file_path: &str, chunk_index: usize) -> Self {
        let mut metadata = chunk.metadata.clone();
        metadata.insert(
            "children_ids".into(),
            serde_json::to_value(&chunk.children_ids).unwrap_or_default(),
        );
        Self {
            id: chunk.id,
            content: chunk.content.clone(),
            content_type: "text".into(),
            chunk_type: chunk.chunk_type,
            level: chunk.level,
            parent_id: chunk.parent_id,
            file_path: file_path.to_string(),
            chunk_index,
            metadata: serde_json::Value::Object(metadata),
        }
    }

    /// Child ids recovered from the metadata blob. Missing or malformed
    /// entries yield an empty list rather than an error.
    pub fn children_ids(&self) -> Vec<ChunkId> {
        self.metadata
            .get("children_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// One similarity-search hit: the stored row plus its distance to the query.
#[derive(Clone, Debug)]
pub struct VectorHit {
    pub id: ChunkId,
    /// Non-negative; lower is more similar.
    pub distance: f32,
    pub record: ChunkRecord,
}

/// Boolean predicate over the scalar stored fields, evaluated natively by
/// each backend (compiled to SQL for sqlite, applied in the scan for the
/// memory store). Supported fields: `file_path`, `chunk_type`,
/// `content_type`, `level`, `parent_id`, `chunk_index`.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    Eq {
        field: String,
        value: serde_json::Value,
    },
    And(Vec<FilterExpr>),
}

impl FilterExpr {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        FilterExpr::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn and(exprs: impl IntoIterator<Item = FilterExpr>) -> Self {
        FilterExpr::And(exprs.into_iter().collect())
    }

    /// Evaluate against a record. Unknown fields never match.
    pub(crate) fn matches(&self, record: &ChunkRecord) -> bool {
        match self {
            FilterExpr::And(exprs) => exprs.iter().all(|e| e.matches(record)),
            FilterExpr::Eq { field, value } => match field.as_str() {
                "file_path" => value.as_str() == Some(record.file_path.as_str()),
                "chunk_type" => value.as_str() == Some(record.chunk_type.as_str()),
                "content_type" => value.as_str() == Some(record.content_type.as_str()),
                "level" => value.as_u64() == Some(u64::from(record.level)),
                "parent_id" => value.as_u64() == record.parent_id.map(|p| p.0),
                "chunk_index" => value.as_u64() == Some(record.chunk_index as u64),
                _ => false,
            },
        }
    }
}

/// The search primitive the retrieval engine is built on.
///
/// Implementations surface connectivity loss as
/// [`KbError::StoreUnavailable`] without retrying; retry policy belongs to
/// the caller. The first insert fixes the corpus embedding dimension and
/// later mismatches are [`KbError::Embedding`].
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert records with their embeddings. Idempotent by chunk id:
    /// re-insertion with the same id overwrites the stored row.
    async fn insert(&self, records: Vec<(ChunkRecord, Vec<f32>)>) -> Result<(), KbError>;

    /// Similarity search, ascending by distance, truncated to `top_k`.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<VectorHit>, KbError>;

    /// Fetch one stored row by chunk id.
    async fn fetch(&self, id: ChunkId) -> Result<Option<ChunkRecord>, KbError>;

    /// All rows for one source document, ordered by `chunk_index`.
    async fn fetch_by_path(&self, file_path: &str) -> Result<Vec<ChunkRecord>, KbError>;

    /// Delete every row for one source document; returns the deleted ids.
    async fn delete_by_path(&self, file_path: &str) -> Result<Vec<ChunkId>, KbError>;

    /// Total number of stored chunks.
    async fn count(&self) -> Result<usize, KbError>;

    /// Distinct source documents in the store.
    async fn list_paths(&self) -> Result<Vec<String>, KbError>;
}

/// One entry of a query's final ranked list.
///
/// Produced fresh per query and never cached. Context chunks appended by
/// hierarchical expansion carry the originating hit's fused score and
/// `is_context = true` so consumers can tell primary relevance from
/// structural padding.
#[derive(Clone, Debug, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: ChunkId,
    pub content: String,
    pub chunk_type: ChunkType,
    pub level: u32,
    pub parent_id: Option<ChunkId>,
    pub children_ids: Vec<ChunkId>,
    pub file_path: String,
    pub chunk_index: usize,
    pub metadata: serde_json::Value,
    pub lexical_score: f32,
    pub vector_score: f32,
    pub fused_score: f32,
    pub is_context: bool,
}

impl RetrievalResult {
    pub(crate) fn primary(
        record: ChunkRecord,
        vector_score: f32,
        lexical_score: f32,
        fused_score: f32,
    ) -> Self {
        Self::from_record(record, vector_score, lexical_score, fused_score, false)
    }

    pub(crate) fn context(record: ChunkRecord, inherited_score: f32) -> Self {
        Self::from_record(record, 0.0, 0.0, inherited_score, true)
    }

    fn from_record(
        record: ChunkRecord,
        vector_score: f32,
        lexical_score: f32,
        fused_score: f32,
        is_context: bool,
    ) -> Self {
        let children_ids = record.children_ids();
        Self {
            chunk_id: record.id,
            content: record.content,
            chunk_type: record.chunk_type,
            level: record.level,
            parent_id: record.parent_id,
            children_ids,
            file_path: record.file_path,
            chunk_index: record.chunk_index,
            metadata: record.metadata,
            lexical_score,
            vector_score,
            fused_score,
            is_context,
        }
    }
}
