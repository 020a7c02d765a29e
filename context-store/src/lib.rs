pub mod cache;
pub mod chunk_repo;
pub mod message_repo;

use context_model::{EmbeddedChunk, SourceType, StoredMessage};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
}

/// A chunk plus its retrieval score (cosine similarity, negated BM25 rank,
/// or uniform 1.0 from the substring fallback).
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: EmbeddedChunk,
    pub score: f32,
}

/// A message plus its full-text search score.
#[derive(Debug, Clone)]
pub struct ScoredMessage {
    pub message: StoredMessage,
    pub score: f32,
}

/// Predicates applied to chunk retrieval. All fields optional, AND-combined.
/// Source type, date range and excluded ids are pushed into SQL; sector and
/// domain tag live in opaque metadata and are applied post-fetch.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub source_types: Vec<SourceType>,
    /// Inclusive RFC 3339 lower bound on `created_at`.
    pub date_start: Option<String>,
    /// Inclusive RFC 3339 upper bound on `created_at`.
    pub date_end: Option<String>,
    pub exclude_ids: Vec<String>,
    pub sector_id: Option<String>,
    pub domain_tag: Option<String>,
}

impl ChunkFilter {
    pub fn is_empty(&self) -> bool {
        self.source_types.is_empty()
            && self.date_start.is_none()
            && self.date_end.is_none()
            && self.exclude_ids.is_empty()
            && self.sector_id.is_none()
            && self.domain_tag.is_none()
    }

    /// Post-fetch predicates over decoded metadata.
    pub(crate) fn matches_meta(&self, chunk: &EmbeddedChunk) -> bool {
        if let Some(sector) = &self.sector_id {
            if chunk.meta.sector_id.as_deref() != Some(sector.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.domain_tag {
            if !chunk.meta.domain_tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

/// Candidate ceiling for brute-force similarity scans. Latency guard, not a
/// correctness bound; corpora past this size need a real ANN index.
pub const VECTOR_CANDIDATE_CEILING: usize = 5000;

/// Tokenize query text into OR'd quoted FTS5 terms so that any term match
/// contributes; ranking is left to the text engine.
pub(crate) fn fts_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Plain lowercase terms for the substring fallback.
pub(crate) fn fallback_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_query_quotes_and_ors_terms() {
        assert_eq!(
            fts_match_query("hybrid retrieval").as_deref(),
            Some("\"hybrid\" OR \"retrieval\"")
        );
        assert_eq!(fts_match_query("  ??  "), None);
    }

    #[test]
    fn empty_filter_reports_empty() {
        assert!(ChunkFilter::default().is_empty());
        let f = ChunkFilter { sector_id: Some("s".into()), ..Default::default() };
        assert!(!f.is_empty());
    }
}
