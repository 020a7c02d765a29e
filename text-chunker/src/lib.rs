//! Content-typed text chunking with boundary-aware splitting and
//! per-chunk keyword extraction for sparse indexing.

pub mod keywords;

use context_model::{estimate_tokens, ChunkMeta, ContentType, EmbeddedChunk, SourceType};

/// Chunking parameters. Token budgets are converted to character budgets
/// at ~4 chars per token, matching the estimator in `context-model`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    /// Split on structural units (paragraphs, function starts) instead of
    /// fixed-width windows.
    pub respect_boundaries: bool,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self { max_tokens: 320, overlap_tokens: 40, respect_boundaries: true }
    }
}

/// One chunk produced by the splitter, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub content: String,
    pub content_type: ContentType,
    pub token_count: usize,
    pub keywords: Vec<String>,
    pub index: u32,
}

/// Detect content type by scoring indicator patterns per line.
pub fn detect_content_type(text: &str) -> ContentType {
    let mut code = 0usize;
    let mut table = 0usize;
    let mut list = 0usize;
    let mut prose = 0usize;
    for line in text.lines() {
        let t = line.trim_start();
        if t.is_empty() {
            continue;
        }
        if is_table_row(t) {
            table += 1;
        } else if is_list_item(t) {
            list += 1;
        } else if looks_like_code(t) {
            code += 1;
        } else {
            prose += 1;
        }
    }
    let total = code + table + list + prose;
    if total == 0 {
        return ContentType::Prose;
    }
    // A majority of one shape wins; code mixed with real prose is Mixed.
    if table * 2 > total {
        ContentType::Table
    } else if list * 2 > total {
        ContentType::List
    } else if code * 2 > total {
        ContentType::Code
    } else if code > 0 && prose > 0 && code * 4 > total {
        ContentType::Mixed
    } else {
        ContentType::Prose
    }
}

fn is_table_row(line: &str) -> bool {
    line.starts_with('|') && line.matches('|').count() >= 2
}

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") || line.starts_with("+ ") {
        return true;
    }
    // Ordered list: "1. ", "12) "
    let digits: String = line.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return false;
    }
    let rest = &line[digits.len()..];
    rest.starts_with(". ") || rest.starts_with(") ")
}

fn looks_like_code(line: &str) -> bool {
    const STARTERS: [&str; 12] = [
        "fn ", "pub fn ", "impl ", "struct ", "enum ", "trait ", "def ", "class ", "function ",
        "let ", "const ", "use ",
    ];
    if STARTERS.iter().any(|s| line.starts_with(s)) {
        return true;
    }
    line.ends_with('{')
        || line.ends_with('}')
        || line.ends_with(';')
        || line.starts_with("//")
        || line.starts_with('#') && line.contains('[')
        || line.contains("=>")
        || line.contains("->")
}

/// Split `text` into chunk pieces sized to `params`, detecting the content
/// type once for the whole input and extracting keywords per chunk.
pub fn chunk_text(text: &str, params: &ChunkParams) -> Vec<ChunkPiece> {
    let content_type = detect_content_type(text);
    let max_chars = params.max_tokens.saturating_mul(4).max(16);
    let overlap_chars = params.overlap_tokens.saturating_mul(4).min(max_chars / 2);

    let segments = if params.respect_boundaries {
        pack_units(split_units(text, content_type), max_chars, overlap_chars)
    } else {
        sliding_windows(text, max_chars, overlap_chars)
    };

    segments
        .into_iter()
        .enumerate()
        .map(|(i, content)| {
            let token_count = estimate_tokens(&content);
            let keywords = keywords::extract_keywords(&content, keywords::MAX_KEYWORDS);
            ChunkPiece { content, content_type, token_count, keywords, index: i as u32 }
        })
        .collect()
}

/// Chunk a source and materialize `EmbeddedChunk`s with empty embeddings.
/// Embeddings are filled in by the caller when a provider is ready.
pub fn chunk_source(
    text: &str,
    source_id: &str,
    source_type: SourceType,
    meta: ChunkMeta,
    params: &ChunkParams,
) -> Vec<EmbeddedChunk> {
    let now = chrono::Utc::now().to_rfc3339();
    chunk_text(text, params)
        .into_iter()
        .map(|piece| EmbeddedChunk {
            id: EmbeddedChunk::chunk_id(source_id, piece.index),
            source_id: source_id.to_string(),
            source_type,
            content: piece.content,
            content_type: piece.content_type,
            embedding: Vec::new(),
            keywords: piece.keywords,
            chunk_index: piece.index,
            token_count: piece.token_count,
            meta: meta.clone(),
            created_at: now.clone(),
        })
        .collect()
}

/// Structural units to pack: paragraphs for prose, declaration-delimited
/// blocks for code. Units keep their trailing separators trimmed.
fn split_units(text: &str, content_type: ContentType) -> Vec<String> {
    match content_type {
        ContentType::Code | ContentType::Mixed => split_code_units(text),
        _ => split_paragraphs(text),
    }
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut buf = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !buf.trim().is_empty() {
                units.push(std::mem::take(&mut buf));
            }
            buf.clear();
        } else {
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(line);
        }
    }
    if !buf.trim().is_empty() {
        units.push(buf);
    }
    units
}

fn split_code_units(text: &str) -> Vec<String> {
    const DECL_STARTERS: [&str; 9] =
        ["fn ", "pub fn ", "impl ", "struct ", "enum ", "trait ", "def ", "class ", "function "];
    let mut units = Vec::new();
    let mut buf = String::new();
    let mut prev_blank = false;
    for line in text.lines() {
        let t = line.trim_start();
        let starts_decl = DECL_STARTERS.iter().any(|s| t.starts_with(s));
        // Cut before a new top-level declaration or after a blank gap.
        if (starts_decl || prev_blank) && !buf.trim().is_empty() {
            units.push(std::mem::take(&mut buf));
        }
        prev_blank = t.is_empty();
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
    }
    if !buf.trim().is_empty() {
        units.push(buf);
    }
    units
}

/// Greedily pack units into segments not exceeding `max_chars`, carrying a
/// trailing overlap of up to `overlap_chars` into the next segment. Units
/// larger than the budget are hard-split on char boundaries.
fn pack_units(units: Vec<String>, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    for unit in units {
        if unit.len() > max_chars {
            // Flush what we have, then window the oversized unit directly.
            if !buf.trim().is_empty() {
                out.push(std::mem::take(&mut buf));
            }
            let mut windows = sliding_windows(&unit, max_chars, overlap_chars);
            if let Some(last) = windows.pop() {
                out.extend(windows);
                buf = last;
            }
            continue;
        }
        let sep = if buf.is_empty() { 0 } else { 2 };
        if buf.len() + sep + unit.len() > max_chars && !buf.trim().is_empty() {
            let tail = overlap_tail(&buf, overlap_chars);
            out.push(std::mem::take(&mut buf));
            buf = tail;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(&unit);
    }
    if !buf.trim().is_empty() {
        out.push(buf);
    }
    out
}

fn overlap_tail(buf: &str, overlap_chars: usize) -> String {
    if overlap_chars == 0 || buf.len() <= overlap_chars {
        return String::new();
    }
    let mut start = buf.len() - overlap_chars;
    while start < buf.len() && !buf.is_char_boundary(start) {
        start += 1;
    }
    buf[start..].trim_start().to_string()
}

fn sliding_windows(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let step = max_chars.saturating_sub(overlap_chars).max(1);
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let mut end = (start + max_chars).min(text.len());
        while end < text.len() && !text.is_char_boundary(end) {
            end += 1;
        }
        while !text.is_char_boundary(start) {
            start += 1;
        }
        let seg = text[start..end].to_string();
        if !seg.trim().is_empty() {
            out.push(seg);
        }
        if end == text.len() {
            break;
        }
        start += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_code_vs_prose() {
        let code = "fn main() {\n    let x = 1;\n    println!(\"{x}\");\n}\n";
        assert_eq!(detect_content_type(code), ContentType::Code);
        let prose = "The retriever fuses two ranked lists.\n\nIt then truncates them.";
        assert_eq!(detect_content_type(prose), ContentType::Prose);
    }

    #[test]
    fn detects_table_and_list() {
        let table = "| a | b |\n| - | - |\n| 1 | 2 |\n";
        assert_eq!(detect_content_type(table), ContentType::Table);
        let list = "- one\n- two\n- three\n";
        assert_eq!(detect_content_type(list), ContentType::List);
    }

    #[test]
    fn boundary_split_respects_paragraphs() {
        let text = "first paragraph here.\n\nsecond paragraph here.\n\nthird paragraph here.";
        let params = ChunkParams { max_tokens: 12, overlap_tokens: 0, respect_boundaries: true };
        let pieces = chunk_text(text, &params);
        assert!(pieces.len() >= 2);
        assert!(pieces[0].content.contains("first paragraph"));
        // No chunk mixes paragraph fragments mid-sentence.
        for p in &pieces {
            assert!(p.content.len() <= 12 * 4 + 2);
        }
    }

    #[test]
    fn sliding_window_carries_overlap() {
        let text = "abcdefghijklmnopqrstuvwxyz".repeat(4);
        let params = ChunkParams { max_tokens: 8, overlap_tokens: 2, respect_boundaries: false };
        let pieces = chunk_text(&text, &params);
        assert!(pieces.len() > 1);
        for w in pieces.windows(2) {
            let prev = &w[0].content;
            let tail = &prev[prev.len() - 8..];
            assert!(w[1].content.starts_with(tail));
        }
    }

    #[test]
    fn chunk_source_derives_ids_and_tokens() {
        let chunks = chunk_source(
            "hello world, a short document.",
            "doc-1",
            SourceType::Document,
            ChunkMeta::default(),
            &ChunkParams::default(),
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "doc-1#0");
        assert_eq!(chunks[0].token_count, estimate_tokens(&chunks[0].content));
        assert!(chunks[0].embedding.is_empty());
    }

    #[test]
    fn indices_are_sequential() {
        let text = "para one.\n\npara two.\n\npara three.\n\npara four.";
        let params = ChunkParams { max_tokens: 4, overlap_tokens: 0, respect_boundaries: true };
        let pieces = chunk_text(text, &params);
        for (i, p) in pieces.iter().enumerate() {
            assert_eq!(p.index as usize, i);
        }
    }
}
