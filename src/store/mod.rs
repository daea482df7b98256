//! Storage abstraction for the chunk index.
//!
//! The [`IndexStore`] trait is the persistence contract the pipeline relies
//! on: key-addressed chunk records with vectors and denormalized metadata,
//! a parent → chunk-id secondary lookup for cascade deletes, and filtered
//! nearest-neighbor queries. Backends:
//!
//! - [`memory::InMemoryStore`] — process-local, used by tests and embedders.
//! - [`crate::sqlite_store::SqliteStore`] — persistent, backed by `sqlx`.
//!
//! Implementations must be `Send + Sync`; the store handle is opened once,
//! shared explicitly (usually as `Arc<dyn IndexStore>`), and closed at
//! shutdown.

pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::MetadataFilter;
use crate::models::{ChunkRecord, Hit, ParentRecord};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`exists`](IndexStore::exists) | Is a parent indexed? |
/// | [`insert_chunks`](IndexStore::insert_chunks) | Atomically add a batch of chunks for a parent |
/// | [`delete_chunk`](IndexStore::delete_chunk) | Remove one chunk |
/// | [`delete_parent`](IndexStore::delete_parent) | Cascade-remove a parent and all its chunks |
/// | [`query`](IndexStore::query) | Filtered nearest-neighbor search |
/// | [`count`](IndexStore::count) | Total chunk count |
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Whether a parent record exists for `parent_id`.
    async fn exists(&self, parent_id: &str) -> Result<bool>;

    async fn get_parent(&self, parent_id: &str) -> Result<Option<ParentRecord>>;

    /// All parent records, ordered by `parent_id`.
    async fn list_parents(&self) -> Result<Vec<ParentRecord>>;

    /// Insert `chunks` for `parent` as one all-or-nothing batch and record the
    /// parent with its updated chunk count.
    ///
    /// Fails with `StoreWriteError` (and writes nothing) if any chunk id
    /// already exists, appears twice in the batch, or belongs to another parent.
    async fn insert_chunks(&self, parent: &ParentRecord, chunks: &[ChunkRecord]) -> Result<usize>;

    async fn chunk_exists(&self, chunk_id: &str) -> Result<bool>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>>;

    /// Delete one chunk. Returns `false` if it was absent.
    ///
    /// The owning parent's chunk count is decremented; a parent left with no
    /// chunks is removed.
    async fn delete_chunk(&self, chunk_id: &str) -> Result<bool>;

    /// Delete the parent record and every chunk that references it.
    /// Returns the number of chunks removed (0 for an unknown parent).
    async fn delete_parent(&self, parent_id: &str) -> Result<usize>;

    /// Merge `extra` keys into a chunk's free-form metadata. Returns `false`
    /// if the chunk does not exist.
    async fn update_chunk_extra(
        &self,
        chunk_id: &str,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool>;

    /// Up to `k` hits whose metadata satisfies `filter`, ordered by
    /// descending similarity with ties broken by ascending chunk id.
    ///
    /// The filter is applied while selecting candidates, before truncation.
    async fn query(&self, embedding: &[f32], k: usize, filter: &MetadataFilter)
        -> Result<Vec<Hit>>;

    /// Total number of chunks across all parents.
    async fn count(&self) -> Result<usize>;

    /// Number of stored chunks for one parent.
    async fn count_for_parent(&self, parent_id: &str) -> Result<usize>;

    /// Release backend resources. The default does nothing.
    async fn close(&self) {}
}

/// Ranking order shared by all backends: score descending, then chunk id
/// ascending.
pub fn rank_hits(hits: &mut [Hit]) {
    hits.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.chunk_id.cmp(&b.chunk_id),
        other => other,
    });
}

/// Validate a batch before any write: ids unique within the batch and every
/// chunk owned by `parent_id`.
pub(crate) fn validate_batch(parent_id: &str, chunks: &[ChunkRecord]) -> Result<()> {
    let mut seen = std::collections::HashSet::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.parent_id() != parent_id {
            return Err(crate::error::IndexError::StoreWriteError(format!(
                "chunk {} belongs to parent {}, not {}",
                chunk.chunk_id,
                chunk.parent_id(),
                parent_id
            )));
        }
        if !seen.insert(chunk.chunk_id.as_str()) {
            return Err(crate::error::IndexError::StoreWriteError(format!(
                "duplicate chunk id in batch: {}",
                chunk.chunk_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::identity::chunk_id;
    use crate::models::{ChunkMetadata, ChunkRecord, ParentRecord};

    pub fn parent(parent_id: &str, doc_type: &str, client_id: &str) -> ParentRecord {
        ParentRecord {
            parent_id: parent_id.to_string(),
            advisor_id: "adv-1".into(),
            client_id: client_id.into(),
            doc_type: doc_type.into(),
            file_version: "1".into(),
            filename: format!("{parent_id}.pdf"),
            file_type: "pdf".into(),
            strategy: None,
            page_count: 1,
            year: "2023".into(),
            ingested_at: 1_700_000_000,
            chunk_count: 0,
        }
    }

    pub fn chunks(parent: &ParentRecord, vectors: &[Vec<f32>]) -> Vec<ChunkRecord> {
        vectors
            .iter()
            .enumerate()
            .map(|(i, v)| ChunkRecord {
                chunk_id: chunk_id(&parent.parent_id, i as u32),
                seq: i as u32,
                text: format!("{} passage {}", parent.parent_id, i),
                embedding: v.clone(),
                metadata: ChunkMetadata {
                    parent_id: parent.parent_id.clone(),
                    advisor_id: parent.advisor_id.clone(),
                    client_id: parent.client_id.clone(),
                    doc_type: parent.doc_type.clone(),
                    file_version: parent.file_version.clone(),
                    year: parent.year.clone(),
                    filename: parent.filename.clone(),
                    page_start: 1,
                    page_end: 1,
                    extra: Default::default(),
                },
            })
            .collect()
    }
}
