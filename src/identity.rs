//! Deterministic document and chunk identity.
//!
//! A parent id is a SHA-256 fingerprint over the normalized file content and
//! the canonicalized identity tuple `(advisor_id, client_id, doc_type,
//! file_version)`. Identical content and tuple always resolve to the same id;
//! changing any tuple field yields a different id.
//!
//! Chunk ids are `<parent_id>::chunk::<seq>` with a zero-padded sequence, so
//! lexical order of chunk ids equals sequence order within a parent.

use sha2::{Digest, Sha256};

use crate::error::{IndexError, Result};
use crate::models::DocMetadata;

const DOMAIN_TAG: &[u8] = b"finrag/parent/v1";
const CHUNK_SEP: &str = "::chunk::";
/// Hex characters of the digest kept in the rendered id (128 bits).
const ID_HEX_LEN: usize = 32;

/// Compute the parent id for `file_bytes` under `metadata`.
///
/// Fails with `MalformedMetadata` when an identity field is missing or blank.
/// File content alone never causes an error.
pub fn resolve(file_bytes: &[u8], metadata: &DocMetadata) -> Result<String> {
    let fields = [
        ("advisor_id", metadata.advisor_id.as_str()),
        ("client_id", metadata.client_id.as_str()),
        ("doc_type", metadata.doc_type.as_str()),
        ("file_version", metadata.file_version.as_str()),
    ];

    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        return Err(IndexError::MalformedMetadata(format!(
            "required fields missing or empty: {}",
            missing.join(", ")
        )));
    }

    let content = normalize(file_bytes);

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update((content.len() as u64).to_le_bytes());
    hasher.update(&content);
    for (name, value) in fields {
        let value = value.trim();
        hasher.update(name.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());

    Ok(format!("doc_{}", &digest[..ID_HEX_LEN]))
}

/// Compose the id of chunk `seq` of `parent_id`.
pub fn chunk_id(parent_id: &str, seq: u32) -> String {
    format!("{}{}{:06}", parent_id, CHUNK_SEP, seq)
}

/// Split a chunk id into `(parent_id, seq)`. Returns `None` for parent ids
/// and malformed input.
pub fn parse_chunk_id(id: &str) -> Option<(&str, u32)> {
    let (parent, seq) = id.split_once(CHUNK_SEP)?;
    if parent.is_empty() {
        return None;
    }
    seq.parse().ok().map(|s| (parent, s))
}

/// Line endings unified and trailing whitespace dropped, so that the same
/// document saved by different tools fingerprints identically.
fn normalize(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    while out.last().is_some_and(|b| b.is_ascii_whitespace()) {
        out.pop();
    }
    out
}
