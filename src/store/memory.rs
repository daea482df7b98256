//! In-memory [`IndexStore`] implementation for testing and embedding.
//!
//! All tables live behind a single `std::sync::RwLock`, so each operation is
//! atomic with respect to every other. Vector search is brute-force cosine
//! similarity over the chunks that pass the filter.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{IndexError, Result};
use crate::filter::MetadataFilter;
use crate::models::{ChunkRecord, Hit, ParentRecord};

use super::{rank_hits, validate_batch, IndexStore};

#[derive(Default)]
struct Tables {
    parents: HashMap<String, ParentRecord>,
    chunks: BTreeMap<String, ChunkRecord>,
    by_parent: HashMap<String, BTreeSet<String>>,
}

impl Tables {
    fn remove_parent(&mut self, parent_id: &str) -> usize {
        self.parents.remove(parent_id);
        let ids = self.by_parent.remove(parent_id).unwrap_or_default();
        for id in &ids {
            self.chunks.remove(id);
        }
        ids.len()
    }
}

/// In-memory store for tests and single-process use.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| IndexError::StoreUnavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| IndexError::StoreUnavailable("in-memory store lock poisoned".into()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexStore for InMemoryStore {
    async fn exists(&self, parent_id: &str) -> Result<bool> {
        Ok(self.read()?.parents.contains_key(parent_id))
    }

    async fn get_parent(&self, parent_id: &str) -> Result<Option<ParentRecord>> {
        Ok(self.read()?.parents.get(parent_id).cloned())
    }

    async fn list_parents(&self) -> Result<Vec<ParentRecord>> {
        let tables = self.read()?;
        let mut parents: Vec<ParentRecord> = tables.parents.values().cloned().collect();
        parents.sort_by(|a, b| a.parent_id.cmp(&b.parent_id));
        Ok(parents)
    }

    async fn insert_chunks(&self, parent: &ParentRecord, chunks: &[ChunkRecord]) -> Result<usize> {
        validate_batch(&parent.parent_id, chunks)?;

        let mut tables = self.write()?;
        if let Some(dup) = chunks.iter().find(|c| tables.chunks.contains_key(&c.chunk_id)) {
            return Err(IndexError::StoreWriteError(format!(
                "chunk id already exists: {}",
                dup.chunk_id
            )));
        }

        let ids = tables
            .by_parent
            .entry(parent.parent_id.clone())
            .or_default();
        for chunk in chunks {
            ids.insert(chunk.chunk_id.clone());
        }
        let total = ids.len();
        for chunk in chunks {
            tables.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        }

        let mut record = parent.clone();
        record.chunk_count = total;
        tables.parents.insert(parent.parent_id.clone(), record);

        Ok(chunks.len())
    }

    async fn chunk_exists(&self, chunk_id: &str) -> Result<bool> {
        Ok(self.read()?.chunks.contains_key(chunk_id))
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        Ok(self.read()?.chunks.get(chunk_id).cloned())
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<bool> {
        let mut tables = self.write()?;
        let Some(removed) = tables.chunks.remove(chunk_id) else {
            return Ok(false);
        };
        let parent_id = removed.metadata.parent_id;

        let remaining = match tables.by_parent.get_mut(&parent_id) {
            Some(ids) => {
                ids.remove(chunk_id);
                ids.len()
            }
            None => 0,
        };

        if remaining == 0 {
            tables.by_parent.remove(&parent_id);
            tables.parents.remove(&parent_id);
        } else if let Some(parent) = tables.parents.get_mut(&parent_id) {
            parent.chunk_count = remaining;
        }
        Ok(true)
    }

    async fn delete_parent(&self, parent_id: &str) -> Result<usize> {
        Ok(self.write()?.remove_parent(parent_id))
    }

    async fn update_chunk_extra(
        &self,
        chunk_id: &str,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        let mut tables = self.write()?;
        match tables.chunks.get_mut(chunk_id) {
            Some(chunk) => {
                for (k, v) in extra {
                    chunk.metadata.extra.insert(k.clone(), v.clone());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let tables = self.read()?;
        let mut hits: Vec<Hit> = tables
            .chunks
            .values()
            .filter(|c| filter.matches(&c.metadata))
            .map(|c| Hit {
                chunk_id: c.chunk_id.clone(),
                parent_id: c.metadata.parent_id.clone(),
                text: c.text.clone(),
                metadata: c.metadata.clone(),
                score: cosine_similarity(embedding, &c.embedding) as f64,
            })
            .collect();
        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.chunks.len())
    }

    async fn count_for_parent(&self, parent_id: &str) -> Result<usize> {
        Ok(self
            .read()?
            .by_parent
            .get(parent_id)
            .map(|ids| ids.len())
            .unwrap_or(0))
    }
}
