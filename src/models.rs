//! Core data models used throughout finrag.
//!
//! These types represent the parent documents, chunks, retrieval hits and
//! operation responses that flow through the indexing and retrieval pipeline.

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

/// Caller-supplied metadata for a document being indexed.
///
/// `advisor_id`, `client_id`, `doc_type` and `file_version` form the identity
/// tuple and must be non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocMetadata {
    pub advisor_id: String,
    pub client_id: String,
    pub doc_type: String,
    pub file_version: String,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default = "default_file_type")]
    pub file_type: String,
    /// Fiscal year; derived from the file name when absent.
    #[serde(default)]
    pub year: Option<String>,
}

fn default_file_type() -> String {
    "pdf".to_string()
}

/// One logically indexed source document.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ParentRecord {
    pub parent_id: String,
    pub advisor_id: String,
    pub client_id: String,
    pub doc_type: String,
    pub file_version: String,
    pub filename: String,
    pub file_type: String,
    pub strategy: Option<String>,
    pub page_count: u32,
    pub year: String,
    /// Unix timestamp (seconds) of the successful index.
    pub ingested_at: i64,
    pub chunk_count: usize,
}

/// Metadata stored on every chunk, denormalized from its parent so that
/// retrieval filtering never needs a join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub parent_id: String,
    pub advisor_id: String,
    pub client_id: String,
    pub doc_type: String,
    pub file_version: String,
    pub year: String,
    pub filename: String,
    pub page_start: u32,
    pub page_end: u32,
    /// Free-form keys added through `save_metadata`.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One retrievable passage with its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub seq: u32,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

impl ChunkRecord {
    pub fn parent_id(&self) -> &str {
        &self.metadata.parent_id
    }
}

/// A chunk as returned by `get`, without its vector.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkView {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl From<ChunkRecord> for ChunkView {
    fn from(c: ChunkRecord) -> Self {
        Self {
            id: c.chunk_id,
            text: c.text,
            metadata: c.metadata,
        }
    }
}

/// A ranked retrieval result. Produced per query, never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Hit {
    pub chunk_id: String,
    pub parent_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Indexed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmStatus {
    NotApplicable,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeleteScope {
    Single,
    Parent,
    /// The id matched neither a chunk nor a parent.
    None,
}

/// Result of an index or reindex call.
#[derive(Debug, Clone, Serialize)]
pub struct IndexResponse {
    pub parent_id: String,
    pub file_name: String,
    pub file_version: String,
    pub file_type: String,
    pub files_count: u32,
    pub chunks_indexed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_chunks: Option<usize>,
    /// Absent when the store could not be counted after the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_count_after: Option<usize>,
    pub file_index_status: IndexStatus,
    pub file_llm_status: LlmStatus,
    /// Milliseconds.
    pub file_index_lapse_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_error_info: Option<ErrorInfo>,
}

/// Result of a delete call. A failed delete has scope `none`, `deleted = 0`
/// and `file_error_info` set.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub id: String,
    pub scope: DeleteScope,
    pub deleted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_count_after: Option<usize>,
    pub message: String,
    /// Milliseconds.
    pub delete_lapse_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_error_info: Option<ErrorInfo>,
}
