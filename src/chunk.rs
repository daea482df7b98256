//! Page-aware paragraph chunker.
//!
//! Splits extracted page text into ordered [`Passage`]s of at most
//! `chunk_chars` bytes. Paragraphs (separated by blank lines) are packed
//! greedily; when a passage is flushed, the tail of its text (up to
//! `overlap_chars`) seeds the next passage if it fits. A paragraph larger than
//! `chunk_chars` is hard-split with a sliding window, never dropped.
//!
//! Output depends only on the input text and [`ChunkingParams`], so passage
//! boundaries (and therefore chunk ids) are stable across reindex of
//! unchanged content.

/// Paragraph separator used when packing.
const PARA_SEP: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    /// Target maximum passage size in bytes.
    pub chunk_chars: usize,
    /// Bytes carried over from the end of one passage into the next.
    pub overlap_chars: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_chars: 900,
            overlap_chars: 150,
        }
    }
}

/// One passage of a document, tagged with its originating 1-based page range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    pub seq: u32,
    pub text: String,
    pub page_start: u32,
    pub page_end: u32,
}

/// Split page texts into passages. Empty pages contribute nothing.
pub fn chunk_pages(pages: &[String], params: &ChunkingParams) -> Vec<Passage> {
    let max_chars = params.chunk_chars.max(1);
    let overlap = params.overlap_chars.min(max_chars - 1);

    let normalized: Vec<String> = pages.iter().map(|p| p.replace("\r\n", "\n")).collect();

    let mut segments: Vec<(u32, &str)> = Vec::new();
    for (i, page) in normalized.iter().enumerate() {
        let page_no = i as u32 + 1;
        for para in page.split(PARA_SEP) {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.len() > max_chars {
                for piece in hard_split(trimmed, max_chars, overlap) {
                    segments.push((page_no, piece));
                }
            } else {
                segments.push((page_no, trimmed));
            }
        }
    }

    let mut passages = Vec::new();
    let mut buf = String::new();
    let mut page_start = 0u32;
    let mut page_end = 0u32;

    for (page_no, seg) in segments {
        let would_be = if buf.is_empty() {
            seg.len()
        } else {
            buf.len() + PARA_SEP.len() + seg.len()
        };

        if would_be > max_chars && !buf.is_empty() {
            let tail = overlap_tail(&buf, overlap).to_string();
            push_passage(&mut passages, &buf, page_start, page_end);
            buf.clear();

            if !tail.is_empty() && tail.len() + PARA_SEP.len() + seg.len() <= max_chars {
                buf.push_str(&tail);
                page_start = page_end;
            }
        }

        if buf.is_empty() {
            page_start = page_no;
        } else {
            buf.push_str(PARA_SEP);
        }
        buf.push_str(seg);
        page_end = page_no;
    }

    if !buf.is_empty() {
        push_passage(&mut passages, &buf, page_start, page_end);
    }

    passages
}

fn push_passage(passages: &mut Vec<Passage>, text: &str, page_start: u32, page_end: u32) {
    passages.push(Passage {
        seq: passages.len() as u32,
        text: text.to_string(),
        page_start,
        page_end,
    });
}

/// Sliding-window split of one oversized paragraph. Each piece is at most
/// `max_chars` bytes and starts `overlap` bytes before the previous piece ended.
fn hard_split(text: &str, max_chars: usize, overlap: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let remaining = &text[start..];
        if remaining.len() <= max_chars {
            pieces.push(remaining.trim());
            break;
        }

        let mut limit = floor_boundary(remaining, max_chars);
        if limit == 0 {
            limit = ceil_boundary(remaining, 1);
        }

        // Prefer a line or word boundary, as long as it still makes progress
        // past the overlap window.
        let cut = remaining[..limit]
            .rfind('\n')
            .or_else(|| remaining[..limit].rfind(' '))
            .map(|pos| pos + 1)
            .filter(|&pos| pos > overlap)
            .unwrap_or(limit);

        pieces.push(remaining[..cut].trim());

        let mut next = floor_boundary(remaining, cut.saturating_sub(overlap));
        if next == 0 {
            next = cut;
        }
        start += next;
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

/// Trailing slice of `text` of at most `overlap` bytes, starting on a word
/// boundary when one exists.
fn overlap_tail(text: &str, overlap: usize) -> &str {
    if overlap == 0 || text.is_empty() {
        return "";
    }
    if text.len() <= overlap {
        return text.trim();
    }
    let from = ceil_boundary(text, text.len() - overlap);
    let tail = &text[from..];
    match tail.find(char::is_whitespace) {
        Some(pos) if pos + 1 < tail.len() => tail[pos..].trim(),
        _ => tail.trim(),
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
