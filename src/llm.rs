//! Answer generation from retrieved context.
//!
//! [`AnswerModel`] is the LLM collaborator: a question plus rendered context
//! in, answer text out. Failures are plain `anyhow` errors; the caller turns
//! them into `file_llm_status = failed` without touching the index.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::embedding::post_with_retry;

const SYSTEM_PROMPT: &str = "You answer questions about financial filings using only the \
context provided. When the context does not contain the answer, say that the information \
is not available. Keep answers short and reference sources by their bracketed document id.";

const LLM_MAX_RETRIES: u32 = 2;

#[async_trait]
pub trait AnswerModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn answer(&self, question: &str, context: &str) -> Result<String>;
}

/// User message sent alongside the system prompt.
pub fn user_prompt(question: &str, context: &str) -> String {
    format!(
        "Question: {question}\n\nContext:\n{context}\n\n\
         Cite sources inline as [id]. Answer in at most six sentences."
    )
}

pub struct DisabledModel;

#[async_trait]
impl AnswerModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn answer(&self, _question: &str, _context: &str) -> Result<String> {
        bail!("llm provider is disabled")
    }
}

/// OpenAI-compatible chat completions client.
///
/// Calls `POST {base_url}/chat/completions` (default
/// `https://api.openai.com/v1`). Requires `OPENAI_API_KEY`.
pub struct OpenAiChat {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }
}

#[async_trait]
impl AnswerModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn answer(&self, question: &str, context: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(question, context) },
            ],
            "temperature": self.temperature,
            "top_p": 1.0,
            "max_tokens": self.max_tokens,
        });
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let json = post_with_retry(LLM_MAX_RETRIES, "OpenAI chat", || {
            self.client
                .post(&endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
        })
        .await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
}

pub fn create_answer_model(config: &LlmConfig) -> Result<Arc<dyn AnswerModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAiChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
