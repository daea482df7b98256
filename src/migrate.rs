//! Schema migrations.
//!
//! Idempotent: every statement is `CREATE ... IF NOT EXISTS`, so running
//! `finrag init` repeatedly is safe.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parents (
            parent_id TEXT PRIMARY KEY,
            advisor_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            file_version TEXT NOT NULL,
            filename TEXT NOT NULL,
            file_type TEXT NOT NULL,
            strategy TEXT,
            page_count INTEGER NOT NULL,
            year TEXT NOT NULL DEFAULT '',
            ingested_at INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunk metadata is denormalized from the parent so filtering never joins.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            parent_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            page_start INTEGER NOT NULL,
            page_end INTEGER NOT NULL,
            advisor_id TEXT NOT NULL,
            client_id TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            file_version TEXT NOT NULL,
            year TEXT NOT NULL DEFAULT '',
            filename TEXT NOT NULL,
            extra_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL,
            UNIQUE(parent_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_parent_id ON chunks(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_advisor_id ON chunks(advisor_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_client_id ON chunks(client_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_doc_type ON chunks(doc_type)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
