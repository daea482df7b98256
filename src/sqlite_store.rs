//! SQLite-backed [`IndexStore`] implementation.
//!
//! Chunk records live in the `chunks` table keyed by `chunk_id`, with an
//! index on `parent_id` serving cascade deletes. Parent records live in
//! `parents`. Every mutating call runs in one transaction: an error, or the
//! future being dropped before commit, rolls the whole call back.
//!
//! Write transactions read before they write, and SQLite refuses to upgrade
//! a deferred reader to a writer while another connection writes. Mutations
//! therefore take the store's writer lock before `BEGIN`, so concurrent
//! writes for different parents queue instead of failing with
//! `database is locked`. Reads never take it.
//!
//! Vector search loads the filtered candidate rows and ranks them by cosine
//! similarity in process.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{IndexError, Result};
use crate::filter::MetadataFilter;
use crate::models::{ChunkMetadata, ChunkRecord, Hit, ParentRecord};
use crate::store::{rank_hits, validate_batch, IndexStore};

const CHUNK_COLUMNS: &str = "chunk_id, parent_id, seq, text, page_start, page_end, \
    advisor_id, client_id, doc_type, file_version, year, filename, extra_json, embedding";

const PARENT_COLUMNS: &str = "parent_id, advisor_id, client_id, doc_type, file_version, \
    filename, file_type, strategy, page_count, year, ingested_at, chunk_count";

/// SQLite implementation of the [`IndexStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_extra(chunk_id: &str, extra_json: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    serde_json::from_str(extra_json).map_err(|e| {
        IndexError::StoreUnavailable(format!("corrupt extra_json for chunk {chunk_id}: {e}"))
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord> {
    let chunk_id: String = row.get("chunk_id");
    let extra_json: String = row.get("extra_json");
    let extra = parse_extra(&chunk_id, &extra_json)?;
    let blob: Vec<u8> = row.get("embedding");
    let seq: i64 = row.get("seq");
    let page_start: i64 = row.get("page_start");
    let page_end: i64 = row.get("page_end");

    Ok(ChunkRecord {
        chunk_id,
        seq: seq as u32,
        text: row.get("text"),
        embedding: blob_to_vec(&blob),
        metadata: ChunkMetadata {
            parent_id: row.get("parent_id"),
            advisor_id: row.get("advisor_id"),
            client_id: row.get("client_id"),
            doc_type: row.get("doc_type"),
            file_version: row.get("file_version"),
            year: row.get("year"),
            filename: row.get("filename"),
            page_start: page_start as u32,
            page_end: page_end as u32,
            extra,
        },
    })
}

fn parent_from_row(row: &SqliteRow) -> ParentRecord {
    let page_count: i64 = row.get("page_count");
    let chunk_count: i64 = row.get("chunk_count");
    ParentRecord {
        parent_id: row.get("parent_id"),
        advisor_id: row.get("advisor_id"),
        client_id: row.get("client_id"),
        doc_type: row.get("doc_type"),
        file_version: row.get("file_version"),
        filename: row.get("filename"),
        file_type: row.get("file_type"),
        strategy: row.get("strategy"),
        page_count: page_count as u32,
        year: row.get("year"),
        ingested_at: row.get("ingested_at"),
        chunk_count: chunk_count as usize,
    }
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn exists(&self, parent_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM parents WHERE parent_id = ?")
            .bind(parent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn get_parent(&self, parent_id: &str) -> Result<Option<ParentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PARENT_COLUMNS} FROM parents WHERE parent_id = ?"
        ))
        .bind(parent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parent_from_row))
    }

    async fn list_parents(&self) -> Result<Vec<ParentRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PARENT_COLUMNS} FROM parents ORDER BY parent_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(parent_from_row).collect())
    }

    async fn insert_chunks(&self, parent: &ParentRecord, chunks: &[ChunkRecord]) -> Result<usize> {
        validate_batch(&parent.parent_id, chunks)?;

        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let dup: Option<i64> = sqlx::query_scalar("SELECT 1 FROM chunks WHERE chunk_id = ?")
                .bind(&chunk.chunk_id)
                .fetch_optional(&mut *tx)
                .await?;
            if dup.is_some() {
                return Err(IndexError::StoreWriteError(format!(
                    "chunk id already exists: {}",
                    chunk.chunk_id
                )));
            }

            let meta = &chunk.metadata;
            let extra_json = serde_json::to_string(&meta.extra)
                .map_err(|e| IndexError::StoreWriteError(e.to_string()))?;
            sqlx::query(&format!(
                "INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&chunk.chunk_id)
            .bind(&meta.parent_id)
            .bind(chunk.seq as i64)
            .bind(&chunk.text)
            .bind(meta.page_start as i64)
            .bind(meta.page_end as i64)
            .bind(&meta.advisor_id)
            .bind(&meta.client_id)
            .bind(&meta.doc_type)
            .bind(&meta.file_version)
            .bind(&meta.year)
            .bind(&meta.filename)
            .bind(&extra_json)
            .bind(vec_to_blob(&chunk.embedding))
            .execute(&mut *tx)
            .await?;
        }

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE parent_id = ?")
            .bind(&parent.parent_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO parents ({PARENT_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(parent_id) DO UPDATE SET
                filename = excluded.filename,
                file_type = excluded.file_type,
                strategy = excluded.strategy,
                page_count = excluded.page_count,
                year = excluded.year,
                ingested_at = excluded.ingested_at,
                chunk_count = excluded.chunk_count
            "#
        ))
        .bind(&parent.parent_id)
        .bind(&parent.advisor_id)
        .bind(&parent.client_id)
        .bind(&parent.doc_type)
        .bind(&parent.file_version)
        .bind(&parent.filename)
        .bind(&parent.file_type)
        .bind(&parent.strategy)
        .bind(parent.page_count as i64)
        .bind(&parent.year)
        .bind(parent.ingested_at)
        .bind(total)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(chunks.len())
    }

    async fn chunk_exists(&self, chunk_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM chunks WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?"
        ))
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn delete_chunk(&self, chunk_id: &str) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let parent_id: Option<String> =
            sqlx::query_scalar("SELECT parent_id FROM chunks WHERE chunk_id = ?")
                .bind(chunk_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(parent_id) = parent_id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM chunks WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE parent_id = ?")
            .bind(&parent_id)
            .fetch_one(&mut *tx)
            .await?;

        if remaining == 0 {
            sqlx::query("DELETE FROM parents WHERE parent_id = ?")
                .bind(&parent_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE parents SET chunk_count = ? WHERE parent_id = ?")
                .bind(remaining)
                .bind(&parent_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_parent(&self, parent_id: &str) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM chunks WHERE parent_id = ?")
            .bind(parent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM parents WHERE parent_id = ?")
            .bind(parent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted as usize)
    }

    async fn update_chunk_extra(
        &self,
        chunk_id: &str,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT extra_json FROM chunks WHERE chunk_id = ?")
                .bind(chunk_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Ok(false);
        };

        let mut merged = parse_extra(chunk_id, &current)?;
        for (k, v) in extra {
            merged.insert(k.clone(), v.clone());
        }
        let merged_json = serde_json::to_string(&merged)
            .map_err(|e| IndexError::StoreWriteError(e.to_string()))?;

        sqlx::query("UPDATE chunks SET extra_json = ? WHERE chunk_id = ?")
            .bind(&merged_json)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
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

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {CHUNK_COLUMNS} FROM chunks"));
        for (i, (field, value)) in filter.clauses().iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            qb.push(field.column());
            qb.push(" = ");
            qb.push_bind(value.clone());
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits = rows
            .iter()
            .map(|row| {
                let chunk = chunk_from_row(row)?;
                let score = cosine_similarity(embedding, &chunk.embedding) as f64;
                Ok(Hit {
                    parent_id: chunk.metadata.parent_id.clone(),
                    chunk_id: chunk.chunk_id,
                    text: chunk.text,
                    metadata: chunk.metadata,
                    score,
                })
            })
            .collect::<Result<Vec<Hit>>>()?;

        rank_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn count_for_parent(&self, parent_id: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE parent_id = ?")
            .bind(parent_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
