//! Index orchestration: index, reindex and delete on top of the store.
//!
//! The [`IndexManager`] is the only component that mutates the
//! [`IndexStore`]. It enforces:
//!
//! - **Idempotency**: a document whose parent id already exists is skipped
//!   with no writes.
//! - **All-or-nothing batches**: a failed or timed-out index leaves no chunk
//!   of the batch visible. A failed reindex leaves the parent with zero
//!   chunks and reports the failure.
//! - **Per-document serialization**: index, reindex and delete calls on the
//!   same parent id run one at a time; different parents proceed in parallel.
//!
//! Extraction and chunking happen before the per-parent lock is taken.
//! Embedding and store writes happen inside it, bounded by
//! `[index] timeout_secs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::{timeout_at, Instant};

use crate::chunk::{chunk_pages, ChunkingParams, Passage};
use crate::config::Config;
use crate::embedding::{embed_batched, Embedder};
use crate::error::{IndexError, Result};
use crate::extract::{DefaultExtractor, TextExtractor};
use crate::identity::{self, parse_chunk_id};
use crate::models::{
    ChunkMetadata, ChunkRecord, ChunkView, DeleteResponse, DeleteScope, DocMetadata,
    IndexResponse, IndexStatus, LlmStatus, ParentRecord,
};
use crate::store::IndexStore;
use crate::timing::{Stopwatch, FILE_INDEX_LAPSE_TIME};

const STAGE_INDEX: &str = "doc-indexing";
const STAGE_REINDEX: &str = "doc-reindexing";
const STAGE_DELETE: &str = "doc-delete";

/// Chunk metadata keys that `save_metadata` may not touch.
const IDENTITY_KEYS: [&str; 5] = [
    "parent_id",
    "advisor_id",
    "client_id",
    "doc_type",
    "file_version",
];

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub chunking: ChunkingParams,
    pub documents_dir: PathBuf,
    pub batch_size: usize,
    pub timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.params(),
            documents_dir: config.documents.dir.clone(),
            batch_size: config.embedding.batch_size,
            timeout: Duration::from_secs(config.index.timeout_secs),
        }
    }
}

/// One async mutex per parent id, created on demand and dropped once no
/// caller holds it.
#[derive(Default)]
struct ParentLocks {
    inner: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl ParentLocks {
    fn handle(&self, parent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = map.get(parent_id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        map.insert(parent_id.to_string(), Arc::downgrade(&lock));
        lock
    }
}

/// A document extracted and chunked, ready to embed and store.
struct Prepared {
    parent: ParentRecord,
    passages: Vec<Passage>,
}

struct Deletion {
    scope: DeleteScope,
    deleted: usize,
    message: String,
}

struct Outcome {
    status: IndexStatus,
    chunks_indexed: usize,
    existing: Option<usize>,
    replaced: Option<usize>,
}

pub struct IndexManager {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn TextExtractor>,
    settings: ManagerSettings,
    locks: ParentLocks,
}

impl IndexManager {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor: Arc::new(DefaultExtractor),
            settings,
            locks: ParentLocks::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Index an uploaded file.
    ///
    /// The file name is sanitized and the bytes are saved under the documents
    /// directory so that [`reindex`](Self::reindex) can find them later.
    /// Never returns an error: failures are reported as
    /// `file_index_status = failed` with `file_error_info`.
    pub async fn index(&self, file_name: &str, bytes: &[u8], metadata: DocMetadata) -> IndexResponse {
        let sw = Stopwatch::start(FILE_INDEX_LAPSE_TIME);
        let file_name = safe_filename(file_name);

        let (parent_id, result) = match identify(bytes, &metadata) {
            Ok(parent_id) => {
                let result = self
                    .index_resolved(&parent_id, &file_name, bytes, &metadata)
                    .await;
                (parent_id, result)
            }
            Err(e) => (String::new(), Err(e)),
        };

        let lapse = sw.finish();
        self.respond(STAGE_INDEX, file_name, &metadata, parent_id, result, lapse)
            .await
    }

    /// Replace every chunk of the document saved as `filename` with a freshly
    /// computed set.
    ///
    /// Old chunks are deleted before the new set is inserted; if the insert
    /// fails the parent is left with zero chunks and the failure is reported.
    pub async fn reindex(&self, filename: &str, metadata: DocMetadata) -> IndexResponse {
        let sw = Stopwatch::start(FILE_INDEX_LAPSE_TIME);
        let file_name = safe_filename(filename);

        let loaded = self
            .read_document(&file_name)
            .await
            .and_then(|bytes| identify(&bytes, &metadata).map(|id| (id, bytes)));
        let (parent_id, result) = match loaded {
            Ok((parent_id, bytes)) => {
                let result = self
                    .reindex_resolved(&parent_id, &file_name, &bytes, &metadata)
                    .await;
                (parent_id, result)
            }
            Err(e) => (String::new(), Err(e)),
        };

        let lapse = sw.finish();
        self.respond(STAGE_REINDEX, file_name, &metadata, parent_id, result, lapse)
            .await
    }

    /// Delete a chunk (scope `single`) or a whole document (scope `parent`).
    ///
    /// Chunk ids are checked first. An id matching neither is not an error:
    /// the response has scope `none` and `deleted = 0`. Store failures are
    /// reported through `file_error_info`.
    pub async fn delete_by_id(&self, id: &str) -> DeleteResponse {
        let sw = Stopwatch::start(FILE_INDEX_LAPSE_TIME);
        let id = id.trim();
        let result = self.delete_inner(id).await;
        let lapse = sw.finish();
        let collection_count_after = self.collection_count().await;

        match result {
            Ok(deletion) => DeleteResponse {
                id: id.to_string(),
                scope: deletion.scope,
                deleted: deletion.deleted,
                collection_count_after,
                message: deletion.message,
                delete_lapse_time: lapse,
                file_error_info: None,
            },
            Err(e) => {
                tracing::warn!(stage = STAGE_DELETE, id, kind = e.kind(), error = %e, "delete failed");
                DeleteResponse {
                    id: id.to_string(),
                    scope: DeleteScope::None,
                    deleted: 0,
                    collection_count_after,
                    message: format!("delete of {id} failed"),
                    delete_lapse_time: lapse,
                    file_error_info: Some(e.info(STAGE_DELETE, lapse)),
                }
            }
        }
    }

    /// Fetch one chunk without its vector.
    pub async fn get(&self, chunk_id: &str) -> Result<ChunkView> {
        self.store
            .get_chunk(chunk_id)
            .await?
            .map(ChunkView::from)
            .ok_or_else(|| IndexError::not_found("chunk", chunk_id))
    }

    pub async fn get_parent(&self, parent_id: &str) -> Result<ParentRecord> {
        self.store
            .get_parent(parent_id)
            .await?
            .ok_or_else(|| IndexError::not_found("document", parent_id))
    }

    /// Merge free-form keys into a chunk's `extra` metadata.
    ///
    /// Identity fields cannot be patched; doing so is `MalformedMetadata`.
    pub async fn save_metadata(&self, chunk_id: &str, patch: Map<String, Value>) -> Result<ChunkView> {
        if let Some(key) = patch.keys().find(|k| IDENTITY_KEYS.contains(&k.as_str())) {
            return Err(IndexError::MalformedMetadata(format!(
                "'{key}' is an identity field and cannot be changed"
            )));
        }

        let owner = parse_chunk_id(chunk_id).map_or(chunk_id, |(parent, _)| parent);
        let lock = self.locks.handle(owner);
        let _guard = lock.lock().await;

        if !self.store.update_chunk_extra(chunk_id, &patch).await? {
            return Err(IndexError::not_found("chunk", chunk_id));
        }
        tracing::debug!(chunk_id, keys = patch.len(), "saved chunk metadata");
        self.get(chunk_id).await
    }

    pub async fn list_parents(&self) -> Result<Vec<ParentRecord>> {
        self.store.list_parents().await
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count().await
    }

    // ---- index ----

    async fn index_resolved(
        &self,
        parent_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &DocMetadata,
    ) -> Result<Outcome> {
        // Cheap check before extraction; repeated under the lock.
        if self.store.exists(parent_id).await? {
            return self.skipped(parent_id).await;
        }

        let prepared = self.prepare(parent_id, file_name, bytes, metadata)?;

        let deadline = Instant::now() + self.settings.timeout;
        let lock = self.locks.handle(parent_id);
        let _guard = timeout_at(deadline, lock.lock())
            .await
            .map_err(|_| IndexError::Cancelled(format!("timed out waiting for {parent_id}")))?;

        let mut writing = false;
        let result = match timeout_at(deadline, self.index_locked(&prepared, bytes, &mut writing)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(parent_id)),
        };

        if result.is_err() && writing {
            self.discard(parent_id).await;
        }
        result
    }

    async fn index_locked(&self, prepared: &Prepared, bytes: &[u8], writing: &mut bool) -> Result<Outcome> {
        let parent_id = &prepared.parent.parent_id;
        if self.store.exists(parent_id).await? {
            return self.skipped(parent_id).await;
        }

        let chunks = self.embed_chunks(prepared).await?;
        self.save_document(&prepared.parent.filename, bytes).await?;

        *writing = true;
        let inserted = self.store.insert_chunks(&prepared.parent, &chunks).await?;
        tracing::info!(parent_id = %parent_id, chunks = inserted, filename = %prepared.parent.filename, "indexed document");

        Ok(Outcome {
            status: IndexStatus::Indexed,
            chunks_indexed: inserted,
            existing: None,
            replaced: None,
        })
    }

    async fn skipped(&self, parent_id: &str) -> Result<Outcome> {
        let existing = self.store.count_for_parent(parent_id).await?;
        tracing::info!(parent_id, existing, "document already indexed, skipping");
        Ok(Outcome {
            status: IndexStatus::Skipped,
            chunks_indexed: 0,
            existing: Some(existing),
            replaced: None,
        })
    }

    // ---- reindex ----

    async fn reindex_resolved(
        &self,
        parent_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &DocMetadata,
    ) -> Result<Outcome> {
        let prepared = self.prepare(parent_id, file_name, bytes, metadata)?;

        let deadline = Instant::now() + self.settings.timeout;
        let lock = self.locks.handle(parent_id);
        let _guard = timeout_at(deadline, lock.lock())
            .await
            .map_err(|_| IndexError::Cancelled(format!("timed out waiting for {parent_id}")))?;

        let mut writing = false;
        let result = match timeout_at(deadline, self.reindex_locked(&prepared, &mut writing)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(parent_id)),
        };

        if let Err(e) = &result {
            if writing {
                tracing::error!(parent_id, error = %e, "reindex failed after old chunks were removed");
                self.discard(parent_id).await;
            }
        }
        result
    }

    async fn reindex_locked(&self, prepared: &Prepared, writing: &mut bool) -> Result<Outcome> {
        let parent_id = &prepared.parent.parent_id;
        let existing = self.store.count_for_parent(parent_id).await?;
        let chunks = self.embed_chunks(prepared).await?;

        *writing = true;
        let replaced = self.store.delete_parent(parent_id).await?;
        let inserted = self.store.insert_chunks(&prepared.parent, &chunks).await?;
        tracing::info!(parent_id = %parent_id, replaced, chunks = inserted, "reindexed document");

        Ok(Outcome {
            status: IndexStatus::Indexed,
            chunks_indexed: inserted,
            existing: Some(existing),
            replaced: Some(replaced),
        })
    }

    // ---- delete ----

    async fn delete_inner(&self, id: &str) -> Result<Deletion> {
        if self.store.chunk_exists(id).await? {
            let owner = parse_chunk_id(id).map_or(id, |(parent, _)| parent);
            let lock = self.locks.handle(owner);
            let _guard = lock.lock().await;

            let deleted = usize::from(self.store.delete_chunk(id).await?);
            tracing::info!(chunk_id = id, "deleted chunk");
            return Ok(Deletion {
                scope: DeleteScope::Single,
                deleted,
                message: format!("deleted chunk {id}"),
            });
        }

        if self.store.exists(id).await? {
            let lock = self.locks.handle(id);
            let _guard = lock.lock().await;

            let deleted = self.store.delete_parent(id).await?;
            tracing::info!(parent_id = id, deleted, "deleted document");
            return Ok(Deletion {
                scope: DeleteScope::Parent,
                deleted,
                message: format!("deleted document {id} and {deleted} chunks"),
            });
        }

        Ok(Deletion {
            scope: DeleteScope::None,
            deleted: 0,
            message: format!("no chunk or document found for id {id}"),
        })
    }

    // ---- shared steps ----

    fn prepare(
        &self,
        parent_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &DocMetadata,
    ) -> Result<Prepared> {
        let extracted = self.extractor.extract(bytes, &metadata.file_type)?;
        let passages = chunk_pages(&extracted.pages, &self.settings.chunking);
        if passages.is_empty() {
            return Err(IndexError::FileReadError(format!(
                "{file_name} contains no extractable text"
            )));
        }

        let year = metadata
            .year
            .as_deref()
            .map(str::trim)
            .filter(|y| !y.is_empty())
            .map(str::to_string)
            .or_else(|| derive_year(file_name))
            .unwrap_or_default();

        let parent = ParentRecord {
            parent_id: parent_id.to_string(),
            advisor_id: metadata.advisor_id.trim().to_string(),
            client_id: metadata.client_id.trim().to_string(),
            doc_type: metadata.doc_type.trim().to_string(),
            file_version: metadata.file_version.trim().to_string(),
            filename: file_name.to_string(),
            file_type: metadata.file_type.trim().to_ascii_lowercase(),
            strategy: metadata.strategy.clone(),
            page_count: extracted.page_count,
            year,
            ingested_at: chrono::Utc::now().timestamp(),
            chunk_count: passages.len(),
        };

        tracing::debug!(parent_id, pages = parent.page_count, passages = passages.len(), "prepared document");
        Ok(Prepared { parent, passages })
    }

    async fn embed_chunks(&self, prepared: &Prepared) -> Result<Vec<ChunkRecord>> {
        let texts: Vec<String> = prepared.passages.iter().map(|p| p.text.clone()).collect();
        let vectors = embed_batched(self.embedder.as_ref(), &texts, self.settings.batch_size).await?;

        let parent = &prepared.parent;
        Ok(prepared
            .passages
            .iter()
            .zip(vectors)
            .map(|(passage, embedding)| ChunkRecord {
                chunk_id: identity::chunk_id(&parent.parent_id, passage.seq),
                seq: passage.seq,
                text: passage.text.clone(),
                embedding,
                metadata: ChunkMetadata {
                    parent_id: parent.parent_id.clone(),
                    advisor_id: parent.advisor_id.clone(),
                    client_id: parent.client_id.clone(),
                    doc_type: parent.doc_type.clone(),
                    file_version: parent.file_version.clone(),
                    year: parent.year.clone(),
                    filename: parent.filename.clone(),
                    page_start: passage.page_start,
                    page_end: passage.page_end,
                    extra: Map::new(),
                },
            })
            .collect())
    }

    async fn read_document(&self, file_name: &str) -> Result<Vec<u8>> {
        let path = self.settings.documents_dir.join(file_name);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| IndexError::FileReadError(format!("cannot read {}: {e}", path.display())))?;
        if bytes.is_empty() {
            return Err(IndexError::FileReadError(format!("{} is empty", path.display())));
        }
        Ok(bytes)
    }

    async fn save_document(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.settings.documents_dir.join(file_name);
        write_file(&self.settings.documents_dir, &path, bytes)
            .await
            .map_err(|e| IndexError::StoreWriteError(format!("cannot save {}: {e}", path.display())))
    }

    /// Remove whatever a failed write left behind for `parent_id`.
    async fn discard(&self, parent_id: &str) {
        match self.store.delete_parent(parent_id).await {
            Ok(removed) => tracing::warn!(parent_id, removed, "discarded chunks of failed write"),
            Err(e) => tracing::error!(parent_id, error = %e, "failed to discard chunks of failed write"),
        }
    }

    fn timed_out(&self, parent_id: &str) -> IndexError {
        IndexError::Cancelled(format!(
            "write of {parent_id} exceeded {}s",
            self.settings.timeout.as_secs_f64()
        ))
    }

    async fn collection_count(&self) -> Option<usize> {
        match self.store.count().await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "could not count chunks after operation");
                None
            }
        }
    }

    async fn respond(
        &self,
        stage: &str,
        file_name: String,
        metadata: &DocMetadata,
        parent_id: String,
        result: Result<Outcome>,
        lapse: f64,
    ) -> IndexResponse {
        let collection_count_after = self.collection_count().await;
        let base = IndexResponse {
            parent_id,
            file_name,
            file_version: metadata.file_version.trim().to_string(),
            file_type: metadata.file_type.clone(),
            files_count: 1,
            chunks_indexed: 0,
            existing_chunks: None,
            replaced_chunks: None,
            collection_count_after,
            file_index_status: IndexStatus::Failed,
            file_llm_status: LlmStatus::NotApplicable,
            file_index_lapse_time: lapse,
            file_error_info: None,
        };

        match result {
            Ok(outcome) => IndexResponse {
                chunks_indexed: outcome.chunks_indexed,
                existing_chunks: outcome.existing,
                replaced_chunks: outcome.replaced,
                file_index_status: outcome.status,
                ..base
            },
            Err(e) => {
                tracing::warn!(stage, parent_id = %base.parent_id, kind = e.kind(), error = %e, "index operation failed");
                IndexResponse {
                    file_error_info: Some(e.info(stage, lapse)),
                    ..base
                }
            }
        }
    }
}

/// Empty bytes fail before identity is computed.
fn identify(bytes: &[u8], metadata: &DocMetadata) -> Result<String> {
    if bytes.is_empty() {
        return Err(IndexError::FileReadError("uploaded file is empty".into()));
    }
    identity::resolve(bytes, metadata)
}

async fn write_file(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, bytes).await
}

/// Last path component with everything outside `[A-Za-z0-9._-]` replaced by
/// `_`. Falls back to `upload.pdf`.
pub fn safe_filename(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.pdf".to_string()
    } else {
        cleaned.to_string()
    }
}

/// First standalone `19xx`/`20xx` token in a file name.
pub fn derive_year(file_name: &str) -> Option<String> {
    let bytes = file_name.as_bytes();
    (0..bytes.len().saturating_sub(3)).find_map(|i| {
        let window = &bytes[i..i + 4];
        let standalone = (i == 0 || !bytes[i - 1].is_ascii_digit())
            && bytes.get(i + 4).map_or(true, |b| !b.is_ascii_digit());
        let century = window.starts_with(b"19") || window.starts_with(b"20");
        (standalone && century && window.iter().all(u8::is_ascii_digit))
            .then(|| file_name[i..i + 4].to_string())
    })
}
