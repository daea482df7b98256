//! CLI command handlers.
//!
//! Each `run_*` function opens what it needs from the [`Config`], performs
//! one operation and prints the response as pretty JSON on stdout. Logs go
//! to stderr through `tracing`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::IndexError;
use crate::filter::MetadataFilter;
use crate::llm::create_answer_model;
use crate::manager::{IndexManager, ManagerSettings};
use crate::models::{DocMetadata, IndexResponse, IndexStatus};
use crate::qa::QaService;
use crate::retriever::Retriever;
use crate::sqlite_store::SqliteStore;
use crate::store::IndexStore;

/// Handles shared by the commands, opened once per invocation.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn IndexStore>,
    pub manager: IndexManager,
    pub retriever: Retriever,
}

impl App {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::run_migrations(&pool).await?;
        let store: Arc<dyn IndexStore> = Arc::new(SqliteStore::new(pool));
        let embedder = create_embedder(&config.embedding)?;

        let manager = IndexManager::new(
            store.clone(),
            embedder.clone(),
            ManagerSettings::from_config(config),
        );
        let retriever = Retriever::new(store.clone(), embedder);

        Ok(Self {
            config: config.clone(),
            store,
            manager,
            retriever,
        })
    }

    pub async fn close(self) {
        self.store.close().await;
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check_index(resp: &IndexResponse) -> Result<()> {
    if resp.file_index_status == IndexStatus::Failed {
        let reason = resp
            .file_error_info
            .as_ref()
            .map(|e| format!("{}: {}", e.kind, e.message))
            .unwrap_or_default();
        bail!("indexing {} failed ({})", resp.file_name, reason);
    }
    Ok(())
}

pub async fn run_init(config: &Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::run_migrations(&pool).await?;
    pool.close().await;
    std::fs::create_dir_all(&config.documents.dir).with_context(|| {
        format!(
            "Failed to create documents directory: {}",
            config.documents.dir.display()
        )
    })?;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn run_index(config: &Config, path: &Path, metadata: DocMetadata) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let app = App::open(config).await?;
    let resp = app.manager.index(&file_name, &bytes, metadata).await;
    app.close().await;

    print_json(&resp)?;
    check_index(&resp)
}

pub async fn run_reindex(config: &Config, filename: &str, metadata: DocMetadata) -> Result<()> {
    let app = App::open(config).await?;
    let resp = app.manager.reindex(filename, metadata).await;
    app.close().await;

    print_json(&resp)?;
    check_index(&resp)
}

pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let resp = app.manager.delete_by_id(id).await;
    app.close().await;

    print_json(&resp)?;
    if let Some(info) = &resp.file_error_info {
        bail!("deleting {} failed ({}: {})", resp.id, info.kind, info.message);
    }
    Ok(())
}

/// Print a chunk, or the document record when `id` is a parent id.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let result = match app.manager.get(id).await {
        Ok(chunk) => print_json(&chunk),
        Err(IndexError::NotFound { .. }) => match app.manager.get_parent(id).await {
            Ok(parent) => print_json(&parent),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    };
    app.close().await;
    result
}

pub async fn run_save_metadata(config: &Config, chunk_id: &str, patch_json: &str) -> Result<()> {
    let patch: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(patch_json).context("metadata patch must be a JSON object")?;
    let app = App::open(config).await?;
    let result = app.manager.save_metadata(chunk_id, patch).await;
    app.close().await;
    print_json(&result?)
}

pub async fn run_count(config: &Config) -> Result<()> {
    let app = App::open(config).await?;
    let count = app.manager.count().await;
    app.close().await;
    print_json(&serde_json::json!({ "count": count? }))
}

pub async fn run_parents(config: &Config) -> Result<()> {
    let app = App::open(config).await?;
    let parents = app.manager.list_parents().await;
    app.close().await;
    print_json(&parents?)
}

pub async fn run_search(config: &Config, query: &str, k: Option<usize>, filter: MetadataFilter) -> Result<()> {
    let app = App::open(config).await?;
    let k = k.unwrap_or(config.retrieval.n_results);
    let hits = app.retriever.search(query, k, &filter).await;
    app.close().await;
    print_json(&hits?)
}

/// One question prints a single response; several print a batch.
pub async fn run_ask(
    config: &Config,
    questions: &[String],
    n_results: Option<usize>,
    top_k_ctx: Option<usize>,
    filter: MetadataFilter,
) -> Result<()> {
    let app = App::open(config).await?;
    let model = create_answer_model(&config.llm)?;
    let qa = QaService::new(
        app.retriever.clone(),
        model,
        config.retrieval.max_chars_per_chunk,
    );
    let n_results = n_results.unwrap_or(config.retrieval.n_results);
    let top_k_ctx = top_k_ctx.unwrap_or(config.retrieval.top_k_ctx);

    let printed = match questions {
        [question] => print_json(&qa.ask(question, n_results, top_k_ctx, &filter).await),
        _ => print_json(&qa.ask_batch(questions, n_results, top_k_ctx, &filter).await),
    };
    app.close().await;
    printed
}
