//! # finrag
//!
//! Citation-grounded retrieval over financial documents.
//!
//! finrag ingests PDF (or plain text) filings, splits them into page-tagged
//! passages, stores the passages with vectors and denormalized metadata, and
//! answers questions by retrieving relevant passages and citing the
//! documents they came from.
//!
//! ## Architecture
//!
//! ```text
//! bytes + metadata ──▶ extract ──▶ chunk ──▶ identity ──▶ IndexManager ──▶ IndexStore
//!                                                                              │
//! question + filter ──▶ Retriever ──▶ ranked hits ──▶ citation ──▶ llm ◀───────┘
//! ```
//!
//! The index core guarantees:
//!
//! - identical content and identity tuple always map to the same parent id,
//!   and indexing it again is a no-op;
//! - a batch of chunks is visible entirely or not at all;
//! - reindex leaves exactly the current content's chunks;
//! - deleting a parent removes every chunk it owns;
//! - filters are applied before top-k truncation.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and `ErrorInfo` payloads |
//! | [`models`] | Records, hits and responses |
//! | [`extract`] | Page-level text extraction |
//! | [`chunk`] | Deterministic passage splitting |
//! | [`identity`] | Parent and chunk ids |
//! | [`filter`] | Typed metadata predicates |
//! | [`store`] | `IndexStore` trait and in-memory backend |
//! | [`sqlite_store`] | SQLite backend |
//! | [`embedding`] | Embedding providers |
//! | [`manager`] | Index, reindex, delete orchestration |
//! | [`retriever`] | Filtered similarity search |
//! | [`citation`] | Context blocks and citations |
//! | [`llm`] | Answer model providers |
//! | [`qa`] | Question answering |
//! | [`timing`] | Lapse-time instrumentation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`commands`] | CLI command handlers |

pub mod chunk;
pub mod citation;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod filter;
pub mod identity;
pub mod llm;
pub mod manager;
pub mod migrate;
pub mod models;
pub mod qa;
pub mod retriever;
pub mod sqlite_store;
pub mod store;
pub mod timing;
