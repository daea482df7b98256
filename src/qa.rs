//! Question answering over the index.
//!
//! `ask` runs retrieval, composes context and citations, then calls the
//! [`AnswerModel`]. An LLM failure keeps the retrieved hits and citations in
//! the response; a retrieval failure returns no hits. Neither touches the
//! index.

use std::sync::Arc;

use serde::Serialize;

use crate::citation::{compose, ContextBlock};
use crate::error::ErrorInfo;
use crate::filter::MetadataFilter;
use crate::llm::AnswerModel;
use crate::models::{Hit, LlmStatus};
use crate::retriever::Retriever;
use crate::timing::{Stopwatch, LLM_LAPSE_TIME};

const STAGE_RETRIEVAL: &str = "rag-search";
const STAGE_LLM: &str = "llm";

#[derive(Debug, Clone, Serialize)]
pub struct QaResponse {
    pub question: String,
    pub answer: String,
    pub citations: Vec<String>,
    pub context_blocks: Vec<ContextBlock>,
    pub hits: Vec<Hit>,
    pub retrieval_lapse_time: f64,
    pub llm_lapse_time: f64,
    pub file_llm_status: LlmStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_error_info: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub results: Vec<QaResponse>,
}

pub struct QaService {
    retriever: Retriever,
    model: Arc<dyn AnswerModel>,
    max_chars_per_chunk: usize,
}

impl QaService {
    pub fn new(retriever: Retriever, model: Arc<dyn AnswerModel>, max_chars_per_chunk: usize) -> Self {
        Self {
            retriever,
            model,
            max_chars_per_chunk,
        }
    }

    pub async fn ask(
        &self,
        question: &str,
        n_results: usize,
        top_k_ctx: usize,
        filter: &MetadataFilter,
    ) -> QaResponse {
        let mut response = QaResponse {
            question: question.to_string(),
            answer: String::new(),
            citations: Vec::new(),
            context_blocks: Vec::new(),
            hits: Vec::new(),
            retrieval_lapse_time: 0.0,
            llm_lapse_time: 0.0,
            file_llm_status: LlmStatus::Failed,
            file_error_info: None,
        };

        let (retrieved, retrieval_ms) = self.retriever.search_timed(question, n_results, filter).await;
        response.retrieval_lapse_time = retrieval_ms;
        let hits = match retrieved {
            Ok(hits) => hits,
            Err(e) => {
                response.file_error_info = Some(e.info(STAGE_RETRIEVAL, retrieval_ms));
                return response;
            }
        };

        let composed = compose(&hits, top_k_ctx);
        let context = composed.render(self.max_chars_per_chunk);
        response.citations = composed.citations;
        response.context_blocks = composed.blocks;
        response.hits = hits;

        let sw = Stopwatch::start(LLM_LAPSE_TIME);
        let answered = self.model.answer(question, &context).await;
        let llm_ms = sw.finish();
        response.llm_lapse_time = llm_ms;

        match answered {
            Ok(answer) => {
                response.answer = answer;
                response.file_llm_status = LlmStatus::Success;
            }
            Err(e) => {
                tracing::warn!(model = self.model.model_name(), error = %e, "answer generation failed");
                response.file_error_info = Some(ErrorInfo {
                    stage: STAGE_LLM.to_string(),
                    kind: "LlmError".to_string(),
                    message: format!("{e:#}"),
                    lapse_ms: llm_ms,
                });
            }
        }
        response
    }

    /// Answer each question in order.
    pub async fn ask_batch(
        &self,
        questions: &[String],
        n_results: usize,
        top_k_ctx: usize,
        filter: &MetadataFilter,
    ) -> BatchResponse {
        tracing::info!(questions = questions.len(), "batch evaluation");
        let mut results = Vec::with_capacity(questions.len());
        for question in questions {
            results.push(self.ask(question, n_results, top_k_ctx, filter).await);
        }
        BatchResponse { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DisabledEmbedder, HashEmbedder};
    use crate::llm::DisabledModel;
    use crate::store::memory::InMemoryStore;
    use crate::store::test_support::{chunks, parent};
    use crate::store::IndexStore;
    use async_trait::async_trait;

    struct EchoModel;

    #[async_trait]
    impl AnswerModel for EchoModel {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn answer(&self, question: &str, context: &str) -> anyhow::Result<String> {
            Ok(format!("{question} | {} blocks", context.matches("[doc_").count()))
        }
    }

    async fn retriever() -> Retriever {
        let embedder = HashEmbedder::new(64);
        let store = Arc::new(InMemoryStore::new());
        let a = parent("doc_a", "10-K", "c1");
        let b = parent("doc_b", "10-K", "c1");
        let v = embedder.embed_one("net income");
        store.insert_chunks(&a, &chunks(&a, &[v.clone(), v.clone()])).await.unwrap();
        store.insert_chunks(&b, &chunks(&b, &[v])).await.unwrap();
        Retriever::new(store, Arc::new(embedder))
    }

    #[tokio::test]
    async fn successful_answer_has_citations() {
        let qa = QaService::new(retriever().await, Arc::new(EchoModel), 1200);
        let resp = qa.ask("net income", 8, 3, &MetadataFilter::new()).await;
        assert_eq!(resp.file_llm_status, LlmStatus::Success);
        assert_eq!(resp.answer, "net income | 3 blocks");
        assert_eq!(resp.citations, vec!["doc_a", "doc_b"]);
        assert_eq!(resp.hits.len(), 3);
        assert!(resp.file_error_info.is_none());
    }

    #[tokio::test]
    async fn llm_failure_keeps_retrieval() {
        let qa = QaService::new(retriever().await, Arc::new(DisabledModel), 1200);
        let resp = qa.ask("net income", 8, 2, &MetadataFilter::new()).await;
        assert_eq!(resp.file_llm_status, LlmStatus::Failed);
        assert_eq!(resp.hits.len(), 3);
        assert_eq!(resp.context_blocks.len(), 2);
        assert!(!resp.citations.is_empty());
        let info = resp.file_error_info.unwrap();
        assert_eq!(info.stage, "llm");
        assert_eq!(info.kind, "LlmError");
    }

    #[tokio::test]
    async fn retrieval_failure_returns_no_hits() {
        let retriever = Retriever::new(Arc::new(InMemoryStore::new()), Arc::new(DisabledEmbedder));
        let qa = QaService::new(retriever, Arc::new(EchoModel), 1200);
        let resp = qa.ask("net income", 8, 2, &MetadataFilter::new()).await;
        assert_eq!(resp.file_llm_status, LlmStatus::Failed);
        assert!(resp.hits.is_empty());
        assert_eq!(resp.file_error_info.unwrap().kind, "EmbeddingError");

        let resp = qa.ask("  ", 8, 2, &MetadataFilter::new()).await;
        assert_eq!(resp.file_error_info.unwrap().kind, "EmptyQuery");
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let qa = QaService::new(retriever().await, Arc::new(EchoModel), 1200);
        let questions = vec!["net income".to_string(), "".to_string()];
        let batch = qa.ask_batch(&questions, 4, 2, &MetadataFilter::new()).await;
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.results[0].file_llm_status, LlmStatus::Success);
        assert_eq!(batch.results[1].file_llm_status, LlmStatus::Failed);
    }
}
