//! Context blocks and citations from ranked hits.
//!
//! [`compose`] takes the first `top_k_ctx` hits in the order the retriever
//! ranked them. Each becomes a context block with its text copied verbatim.
//! Citations are the distinct parent ids of those blocks in first-appearance
//! order. Nothing is re-ranked or re-filtered.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::Hit;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextBlock {
    pub chunk_id: String,
    pub parent_id: String,
    pub filename: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ComposedContext {
    pub blocks: Vec<ContextBlock>,
    pub citations: Vec<String>,
}

pub fn compose(hits: &[Hit], top_k_ctx: usize) -> ComposedContext {
    let blocks: Vec<ContextBlock> = hits
        .iter()
        .take(top_k_ctx)
        .map(|hit| ContextBlock {
            chunk_id: hit.chunk_id.clone(),
            parent_id: hit.parent_id.clone(),
            filename: hit.metadata.filename.clone(),
            text: hit.text.clone(),
        })
        .collect();

    let mut seen = HashSet::new();
    let citations = blocks
        .iter()
        .filter(|b| seen.insert(b.parent_id.as_str()))
        .map(|b| b.parent_id.clone())
        .collect();

    ComposedContext { blocks, citations }
}

impl ComposedContext {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Render the prompt context: one `[parent_id] filename` header per
    /// block, the trimmed body capped at `max_chars` characters, blocks
    /// separated by a blank line.
    pub fn render(&self, max_chars: usize) -> String {
        self.blocks
            .iter()
            .map(|b| {
                let body = b.text.trim();
                let body = match body.char_indices().nth(max_chars) {
                    Some((cut, _)) => &body[..cut],
                    None => body,
                };
                format!("[{}] {}\n{}", b.parent_id, b.filename, body)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
