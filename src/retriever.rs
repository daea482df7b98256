//! Metadata-filtered similarity search.
//!
//! The query text is embedded, then handed to [`IndexStore::query`] together
//! with the filter, so filtering happens during candidate selection. Ranking
//! (score descending, chunk id ascending) is the store's.

use std::sync::Arc;

use crate::embedding::{embed_query, Embedder};
use crate::error::{IndexError, Result};
use crate::filter::MetadataFilter;
use crate::models::Hit;
use crate::store::IndexStore;
use crate::timing::{Stopwatch, RETRIEVAL_LAPSE_TIME};

/// Read-only view of the index for queries.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(store: Arc<dyn IndexStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Up to `k` hits matching `filter`. Fewer are returned only when fewer
    /// matching chunks exist.
    pub async fn search(&self, query: &str, k: usize, filter: &MetadataFilter) -> Result<Vec<Hit>> {
        self.search_timed(query, k, filter).await.0
    }

    /// Like [`search`](Self::search), also returning the lapse in milliseconds.
    pub async fn search_timed(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> (Result<Vec<Hit>>, f64) {
        let sw = Stopwatch::start(RETRIEVAL_LAPSE_TIME);
        let result = self.run(query, k, filter).await;
        match &result {
            Ok(hits) => tracing::debug!(k, hits = hits.len(), filtered = !filter.is_empty(), "search complete"),
            Err(e) => tracing::warn!(kind = e.kind(), error = %e, "search failed"),
        }
        (result, sw.finish())
    }

    async fn run(&self, query: &str, k: usize, filter: &MetadataFilter) -> Result<Vec<Hit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(IndexError::EmptyQuery);
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let embedding = embed_query(self.embedder.as_ref(), query).await?;
        self.store.query(&embedding, k, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DisabledEmbedder, HashEmbedder};
    use crate::filter::FilterField;
    use crate::store::memory::InMemoryStore;
    use crate::store::test_support::{chunks, parent};

    async fn seeded(embedder: &HashEmbedder) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let tenk = parent("doc_k", "10-K", "c1");
        let call = parent("doc_e", "earnings-call", "c2");
        let revenue = embedder.embed_one("quarterly revenue growth");
        let margin = embedder.embed_one("gross margin pressure");
        store
            .insert_chunks(&tenk, &chunks(&tenk, &[revenue.clone(), margin.clone()]))
            .await
            .unwrap();
        store
            .insert_chunks(&call, &chunks(&call, &[revenue, margin]))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let retriever = Retriever::new(Arc::new(InMemoryStore::new()), Arc::new(HashEmbedder::new(16)));
        let err = retriever.search("   ", 3, &MetadataFilter::new()).await.unwrap_err();
        assert!(matches!(err, IndexError::EmptyQuery));
    }

    #[tokio::test]
    async fn filter_restricts_hits() {
        let embedder = HashEmbedder::new(128);
        let store = seeded(&embedder).await;
        let retriever = Retriever::new(store, Arc::new(HashEmbedder::new(128)));

        let all = retriever
            .search("revenue growth", 10, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 4);

        let filter = MetadataFilter::new().with(FilterField::DocType, "10-K");
        let hits = retriever.search("revenue growth", 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.metadata.doc_type == "10-K"));

        let filter = MetadataFilter::new().with(FilterField::ClientId, "nobody");
        assert!(retriever.search("revenue", 10, &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn best_match_ranks_first() {
        let embedder = HashEmbedder::new(128);
        let store = seeded(&embedder).await;
        let retriever = Retriever::new(store, Arc::new(HashEmbedder::new(128)));

        let hits = retriever
            .search("quarterly revenue growth", 2, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.chunk_id.ends_with("000000")));
        assert!(hits[0].chunk_id < hits[1].chunk_id);
    }

    #[tokio::test]
    async fn embedding_failure_surfaces() {
        let retriever = Retriever::new(Arc::new(InMemoryStore::new()), Arc::new(DisabledEmbedder));
        let (result, lapse) = retriever
            .search_timed("revenue", 3, &MetadataFilter::new())
            .await;
        assert!(matches!(result, Err(IndexError::EmbeddingError(_))));
        assert!(lapse >= 0.0);
    }
}
