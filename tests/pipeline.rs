//! Library-level pipeline tests against the in-memory and SQLite stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use finrag::chunk::ChunkingParams;
use finrag::citation::compose;
use finrag::embedding::{Embedder, HashEmbedder};
use finrag::error::{IndexError, Result};
use finrag::filter::{FilterField, MetadataFilter};
use finrag::identity;
use finrag::manager::{IndexManager, ManagerSettings};
use finrag::models::{ChunkRecord, DeleteScope, DocMetadata, Hit, IndexStatus, ParentRecord};
use finrag::retriever::Retriever;
use finrag::sqlite_store::SqliteStore;
use finrag::store::memory::InMemoryStore;
use finrag::store::IndexStore;

/// A PDF with one content stream per page, built with byte-accurate xref
/// offsets. Page text must not contain parentheses or backslashes.
fn pdf_with_pages(pages: &[&[&str]]) -> Vec<u8> {
    let mut objects: Vec<Vec<u8>> = Vec::new();
    let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", 4 + 2 * i)).collect();
    objects.push(b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
    objects.push(format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), pages.len()).into_bytes());
    objects.push(b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_vec());

    for (i, lines) in pages.iter().enumerate() {
        let content_obj = 5 + 2 * i;
        objects.push(
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {content_obj} 0 R /Resources << /Font << /F1 3 0 R >> >> >>"
            )
            .into_bytes(),
        );
        let mut stream = String::from("BT /F1 12 Tf 72 720 Td");
        for line in lines.iter() {
            stream.push_str(&format!(" ({line}) Tj 0 -18 Td"));
        }
        stream.push_str(" ET");
        objects.push(format!("<< /Length {} >>\nstream\n{}\nendstream", stream.len(), stream).into_bytes());
    }

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }
    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_start
        )
        .as_bytes(),
    );
    out
}

fn annual_report_pdf() -> Vec<u8> {
    pdf_with_pages(&[
        &[
            "Annual report for fiscal year 2023.",
            "Total revenue increased twelve percent to 4.2 billion dollars.",
        ],
        &[
            "Operating margin expanded to 18 percent on lower input costs.",
            "Free cash flow funded the share repurchase program.",
        ],
        &[
            "Risk factors include interest rate exposure and currency swings.",
            "The board declared a quarterly dividend.",
        ],
    ])
}

fn meta(doc_type: &str, version: &str, file_type: &str) -> DocMetadata {
    DocMetadata {
        advisor_id: "adv-1".into(),
        client_id: "client-9".into(),
        doc_type: doc_type.into(),
        file_version: version.into(),
        file_type: file_type.into(),
        ..Default::default()
    }
}

fn settings(tmp: &TempDir) -> ManagerSettings {
    ManagerSettings {
        chunking: ChunkingParams {
            chunk_chars: 120,
            overlap_chars: 20,
        },
        documents_dir: tmp.path().join("documents"),
        batch_size: 8,
        timeout: Duration::from_secs(10),
    }
}

fn embedder() -> Arc<dyn Embedder> {
    Arc::new(HashEmbedder::new(128))
}

async fn sqlite_store(tmp: &TempDir) -> Arc<SqliteStore> {
    let pool = finrag::db::connect_path(&tmp.path().join("finrag.sqlite"))
        .await
        .unwrap();
    finrag::migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

async fn end_to_end(store: Arc<dyn IndexStore>, tmp: &TempDir) {
    let mgr = IndexManager::new(store.clone(), embedder(), settings(tmp));
    let pdf = annual_report_pdf();

    let first = mgr.index("acme_10k_2023.pdf", &pdf, meta("10-K", "1", "pdf")).await;
    assert_eq!(first.file_index_status, IndexStatus::Indexed, "{:?}", first.file_error_info);
    assert!(first.chunks_indexed > 0);
    let original_count = first.chunks_indexed;

    let parent = store.get_parent(&first.parent_id).await.unwrap().unwrap();
    assert_eq!(parent.page_count, 3);
    assert_eq!(parent.year, "2023");
    assert_eq!(parent.chunk_count, original_count);

    let again = mgr.index("acme_10k_2023.pdf", &pdf, meta("10-K", "1", "pdf")).await;
    assert_eq!(again.file_index_status, IndexStatus::Skipped);
    assert_eq!(again.chunks_indexed, 0);
    assert_eq!(again.parent_id, first.parent_id);
    assert_eq!(store.count().await.unwrap(), original_count);

    let v2 = mgr.reindex("acme_10k_2023.pdf", meta("10-K", "2", "pdf")).await;
    assert_eq!(v2.file_index_status, IndexStatus::Indexed, "{:?}", v2.file_error_info);
    assert_ne!(v2.parent_id, first.parent_id);
    assert_eq!(v2.existing_chunks, Some(0));
    assert_eq!(store.count_for_parent(&v2.parent_id).await.unwrap(), v2.chunks_indexed);
    assert_eq!(store.count().await.unwrap(), original_count + v2.chunks_indexed);

    let deleted = mgr.delete_by_id(&first.parent_id).await;
    assert_eq!(deleted.scope, DeleteScope::Parent);
    assert_eq!(deleted.deleted, original_count);
    assert_eq!(deleted.collection_count_after, Some(v2.chunks_indexed));

    let retriever = Retriever::new(store.clone(), embedder());
    let filter = MetadataFilter::new().with(FilterField::DocType, "10-K");
    let hits = retriever.search("total revenue", 50, &filter).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.parent_id == v2.parent_id));
}

#[tokio::test]
async fn end_to_end_in_memory() {
    let tmp = TempDir::new().unwrap();
    end_to_end(Arc::new(InMemoryStore::new()), &tmp).await;
}

#[tokio::test]
async fn end_to_end_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    end_to_end(store.clone(), &tmp).await;
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_index_of_distinct_documents_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let mgr = Arc::new(IndexManager::new(store.clone(), embedder(), settings(&tmp)));

    let tasks: Vec<_> = (0..24)
        .map(|i| {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move {
                let text = format!(
                    "Client {i} quarterly statement.\n\nPortfolio value changed by {i} percent."
                );
                mgr.index(&format!("statement_{i}.txt"), text.as_bytes(), meta("statement", "1", "txt"))
                    .await
            })
        })
        .collect();

    let mut total = 0;
    for task in tasks {
        let resp = task.await.unwrap();
        assert_eq!(resp.file_index_status, IndexStatus::Indexed, "{:?}", resp.file_error_info);
        total += resp.chunks_indexed;
    }
    assert_eq!(store.count().await.unwrap(), total);
    assert_eq!(store.list_parents().await.unwrap().len(), 24);
    store.close().await;
}

#[tokio::test]
async fn identity_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let text = "Quarterly call transcript.\n\nGuidance was raised for the full year.";

    let store = sqlite_store(&tmp).await;
    let mgr = IndexManager::new(store.clone(), embedder(), settings(&tmp));
    let first = mgr.index("call.txt", text.as_bytes(), meta("earnings-call", "1", "txt")).await;
    assert_eq!(first.file_index_status, IndexStatus::Indexed);
    store.close().await;

    let store = sqlite_store(&tmp).await;
    let mgr = IndexManager::new(store.clone(), embedder(), settings(&tmp));
    let second = mgr.index("call.txt", text.as_bytes(), meta("earnings-call", "1", "txt")).await;
    assert_eq!(second.file_index_status, IndexStatus::Skipped);
    assert_eq!(second.parent_id, first.parent_id);
    assert_eq!(store.count().await.unwrap(), first.chunks_indexed);
}

#[tokio::test]
async fn filter_never_crosses_doc_types() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    let mgr = IndexManager::new(store.clone(), embedder(), settings(&tmp));

    let shared = "Revenue guidance and margin outlook for the coming quarters.";
    let call = mgr.index("call.txt", shared.as_bytes(), meta("earnings-call", "1", "txt")).await;
    let tenk = mgr
        .index("tenk.txt", format!("{shared} Audited.").as_bytes(), meta("10-K", "1", "txt"))
        .await;
    assert_eq!(call.file_index_status, IndexStatus::Indexed);
    assert_eq!(tenk.file_index_status, IndexStatus::Indexed);

    let retriever = Retriever::new(store.clone(), embedder());
    let filter = MetadataFilter::new().with(FilterField::DocType, "10-K");
    let hits = retriever.search("revenue guidance", 1, &filter).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].metadata.doc_type, "10-K");

    let none = MetadataFilter::new()
        .with(FilterField::DocType, "10-K")
        .with(FilterField::ClientId, "someone-else");
    assert!(retriever.search("revenue guidance", 5, &none).await.unwrap().is_empty());
}

#[tokio::test]
async fn citations_dedup_across_retrieved_documents() {
    let store = Arc::new(InMemoryStore::new());
    let hash = HashEmbedder::new(128);
    let vector = hash.embed_one("cash flow");

    for (parent_id, n) in [("doc_a", 3u32), ("doc_b", 2u32)] {
        let parent = ParentRecord {
            parent_id: parent_id.into(),
            advisor_id: "adv-1".into(),
            client_id: "client-9".into(),
            doc_type: "10-K".into(),
            file_version: "1".into(),
            filename: format!("{parent_id}.pdf"),
            file_type: "pdf".into(),
            strategy: None,
            page_count: 1,
            year: "2023".into(),
            ingested_at: 0,
            chunk_count: 0,
        };
        let chunks: Vec<ChunkRecord> = (0..n)
            .map(|seq| ChunkRecord {
                chunk_id: identity::chunk_id(parent_id, seq),
                seq,
                text: "cash flow".into(),
                embedding: vector.clone(),
                metadata: finrag::models::ChunkMetadata {
                    parent_id: parent_id.into(),
                    advisor_id: "adv-1".into(),
                    client_id: "client-9".into(),
                    doc_type: "10-K".into(),
                    file_version: "1".into(),
                    year: "2023".into(),
                    filename: format!("{parent_id}.pdf"),
                    page_start: 1,
                    page_end: 1,
                    extra: Default::default(),
                },
            })
            .collect();
        store.insert_chunks(&parent, &chunks).await.unwrap();
    }

    let retriever = Retriever::new(store, Arc::new(hash));
    let hits: Vec<Hit> = retriever.search("cash flow", 5, &MetadataFilter::new()).await.unwrap();
    assert_eq!(hits.len(), 5);
    let ctx = compose(&hits, 5);
    assert_eq!(ctx.citations, vec!["doc_a", "doc_b"]);
}

/// Delegates to an in-memory store, failing writes or counts on demand.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    fail_inserts: AtomicBool,
    fail_deletes: AtomicBool,
    fail_counts: AtomicBool,
}

impl FlakyStore {
    fn failing_inserts() -> Self {
        Self {
            fail_inserts: AtomicBool::new(true),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IndexStore for FlakyStore {
    async fn exists(&self, parent_id: &str) -> Result<bool> {
        self.inner.exists(parent_id).await
    }
    async fn get_parent(&self, parent_id: &str) -> Result<Option<ParentRecord>> {
        self.inner.get_parent(parent_id).await
    }
    async fn list_parents(&self) -> Result<Vec<ParentRecord>> {
        self.inner.list_parents().await
    }
    async fn insert_chunks(&self, parent: &ParentRecord, chunks: &[ChunkRecord]) -> Result<usize> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(IndexError::StoreWriteError("disk full".into()));
        }
        self.inner.insert_chunks(parent, chunks).await
    }
    async fn chunk_exists(&self, chunk_id: &str) -> Result<bool> {
        self.inner.chunk_exists(chunk_id).await
    }
    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        self.inner.get_chunk(chunk_id).await
    }
    async fn delete_chunk(&self, chunk_id: &str) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(IndexError::StoreWriteError("read-only volume".into()));
        }
        self.inner.delete_chunk(chunk_id).await
    }
    async fn delete_parent(&self, parent_id: &str) -> Result<usize> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(IndexError::StoreWriteError("read-only volume".into()));
        }
        self.inner.delete_parent(parent_id).await
    }
    async fn update_chunk_extra(
        &self,
        chunk_id: &str,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        self.inner.update_chunk_extra(chunk_id, extra).await
    }
    async fn query(&self, embedding: &[f32], k: usize, filter: &MetadataFilter) -> Result<Vec<Hit>> {
        self.inner.query(embedding, k, filter).await
    }
    async fn count(&self) -> Result<usize> {
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(IndexError::StoreUnavailable("connection reset".into()));
        }
        self.inner.count().await
    }
    async fn count_for_parent(&self, parent_id: &str) -> Result<usize> {
        self.inner.count_for_parent(parent_id).await
    }
}

#[tokio::test]
async fn failed_insert_leaves_nothing_visible() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::failing_inserts());
    let mgr = IndexManager::new(store.clone(), embedder(), settings(&tmp));

    let resp = mgr
        .index("notes.txt", b"Liquidity remains strong.\n\nDebt was refinanced.", meta("10-Q", "1", "txt"))
        .await;
    assert_eq!(resp.file_index_status, IndexStatus::Failed);
    let info = resp.file_error_info.unwrap();
    assert_eq!(info.kind, "StoreWriteError");
    assert_eq!(info.stage, "doc-indexing");
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(!store.exists(&resp.parent_id).await.unwrap());
}

#[tokio::test]
async fn failed_reindex_leaves_zero_chunks() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::default());
    let mgr = IndexManager::new(store.clone(), embedder(), settings(&tmp));

    let text = b"Liquidity remains strong.\n\nDebt was refinanced at a lower rate.";
    let first = mgr.index("notes.txt", text, meta("10-Q", "1", "txt")).await;
    assert_eq!(first.file_index_status, IndexStatus::Indexed);
    assert!(store.count_for_parent(&first.parent_id).await.unwrap() > 0);

    store.fail_inserts.store(true, Ordering::SeqCst);
    let resp = mgr.reindex("notes.txt", meta("10-Q", "1", "txt")).await;
    assert_eq!(resp.file_index_status, IndexStatus::Failed);
    assert_eq!(resp.parent_id, first.parent_id);
    assert_eq!(resp.file_error_info.unwrap().stage, "doc-reindexing");
    assert_eq!(store.count_for_parent(&first.parent_id).await.unwrap(), 0);
    assert!(!store.exists(&first.parent_id).await.unwrap());

    store.fail_inserts.store(false, Ordering::SeqCst);
    let healed = mgr.index("notes.txt", text, meta("10-Q", "1", "txt")).await;
    assert_eq!(healed.file_index_status, IndexStatus::Indexed);
    assert_eq!(healed.chunks_indexed, first.chunks_indexed);
}

#[tokio::test]
async fn failed_delete_reports_error_info() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::default());
    let mgr = IndexManager::new(store.clone(), embedder(), settings(&tmp));

    let indexed = mgr
        .index("notes.txt", b"Liquidity remains strong.\n\nDebt was refinanced.", meta("10-Q", "1", "txt"))
        .await;
    assert_eq!(indexed.file_index_status, IndexStatus::Indexed);

    store.fail_deletes.store(true, Ordering::SeqCst);
    let resp = mgr.delete_by_id(&indexed.parent_id).await;
    assert_eq!(resp.scope, DeleteScope::None);
    assert_eq!(resp.deleted, 0);
    assert!(resp.delete_lapse_time >= 0.0);
    let info = resp.file_error_info.unwrap();
    assert_eq!(info.kind, "StoreWriteError");
    assert_eq!(info.stage, "doc-delete");
    assert_eq!(info.lapse_ms, resp.delete_lapse_time);
    assert_eq!(store.count_for_parent(&indexed.parent_id).await.unwrap(), indexed.chunks_indexed);
}

#[tokio::test]
async fn uncountable_store_leaves_count_absent() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore::default());
    store.fail_counts.store(true, Ordering::SeqCst);
    let mgr = IndexManager::new(store.clone(), embedder(), settings(&tmp));

    let resp = mgr
        .index("notes.txt", b"Liquidity remains strong.\n\nDebt was refinanced.", meta("10-Q", "1", "txt"))
        .await;
    assert_eq!(resp.file_index_status, IndexStatus::Indexed);
    assert_eq!(resp.collection_count_after, None);

    let json = serde_json::to_value(&resp).unwrap();
    assert!(json.get("collection_count_after").is_none());

    let deleted = mgr.delete_by_id(&resp.parent_id).await;
    assert_eq!(deleted.scope, DeleteScope::Parent);
    assert_eq!(deleted.collection_count_after, None);
}
