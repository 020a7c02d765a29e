//! Hybrid retrieval: dense + sparse legs fused with Reciprocal Rank
//! Fusion, query-complexity classification, and post-fusion shaping.

use context_model::EmbeddedChunk;
use context_store::{ChunkFilter, ScoredChunk};
use serde::{Deserialize, Serialize};

use crate::{ContextEngine, EngineError};

/// Reciprocal Rank Fusion parameters: contribution of an item at 1-based
/// rank `r` in a leg is `weight / (k + r)`.
#[derive(Debug, Clone, Copy)]
pub struct RrfConfig {
    pub k: f32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: 60.0, vector_weight: 0.6, keyword_weight: 0.4 }
    }
}

impl RrfConfig {
    /// Negative or non-finite weights clamp to 0; k below 1 pins to 1.
    pub fn normalized(&self) -> Self {
        let clamp = |w: f32| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let k = if self.k.is_finite() && self.k >= 1.0 { self.k } else { 1.0 };
        Self { k, vector_weight: clamp(self.vector_weight), keyword_weight: clamp(self.keyword_weight) }
    }
}

/// Which retrieval leg(s) produced a fused result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOrigin {
    Vector,
    Keyword,
    Both,
}

/// Ephemeral fused result; never persisted. Rank 0 means the chunk was
/// absent from that leg. `score` is the fused RRF value used for ordering;
/// `relevance` is the best per-leg score on a 0..=1-ish scale (cosine for
/// the vector leg, clamped keyword score for the sparse leg) and is what
/// the assembler's minimum-relevance filter compares against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSearchResult {
    pub chunk: EmbeddedChunk,
    pub score: f32,
    pub relevance: f32,
    pub vector_rank: usize,
    pub keyword_rank: usize,
    pub origin: MatchOrigin,
}

/// Coarse query classification driving retrieval shortlist sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryComplexity {
    Simple,
    Complex,
    CodeReference,
    Architecture,
}

/// Per-class item ceilings, monotonically increasing from `Simple` to
/// `Architecture`.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalCeilings {
    pub chunks: usize,
    pub kb_entries: usize,
    pub recent_messages: usize,
}

pub fn retrieval_ceilings(complexity: QueryComplexity) -> RetrievalCeilings {
    match complexity {
        QueryComplexity::Simple => RetrievalCeilings { chunks: 2, kb_entries: 1, recent_messages: 4 },
        QueryComplexity::Complex => RetrievalCeilings { chunks: 4, kb_entries: 2, recent_messages: 6 },
        QueryComplexity::CodeReference => {
            RetrievalCeilings { chunks: 6, kb_entries: 3, recent_messages: 8 }
        }
        QueryComplexity::Architecture => {
            RetrievalCeilings { chunks: 8, kb_entries: 4, recent_messages: 10 }
        }
    }
}

const ARCHITECTURE_TERMS: [&str; 10] = [
    "trade-off",
    "tradeoff",
    "refactor",
    "architecture",
    "design pattern",
    "best practice",
    "compare",
    "versus",
    " vs ",
    "scalab",
];

const CODE_REFERENCE_TERMS: [&str; 8] = [
    "where is",
    "where does",
    "find the",
    "show me",
    "how does",
    "implementation of",
    "defined",
    "call site",
];

const CODE_KEYWORDS: [&str; 8] =
    ["fn ", "struct ", "impl ", "class ", "function", "def ", "async ", "trait "];

const FILE_EXTENSIONS: [&str; 9] =
    [".rs", ".py", ".ts", ".js", ".go", ".cs", ".toml", ".json", ".sql"];

/// Ordered rule families: architecture language wins over code-reference
/// language, which wins over the length/question heuristics.
pub fn classify_query(query: &str) -> QueryComplexity {
    let lower = query.to_lowercase();
    if ARCHITECTURE_TERMS.iter().any(|t| lower.contains(t)) {
        return QueryComplexity::Architecture;
    }
    if CODE_REFERENCE_TERMS.iter().any(|t| lower.contains(t))
        || CODE_KEYWORDS.iter().any(|t| lower.contains(t))
        || FILE_EXTENSIONS.iter().any(|t| lower.contains(t))
    {
        return QueryComplexity::CodeReference;
    }
    let questions = lower.matches('?').count();
    let words = lower.split_whitespace().count();
    if questions >= 2 || words > 20 {
        return QueryComplexity::Complex;
    }
    QueryComplexity::Simple
}

/// Fuse two ranked lists. An item present in both legs sums both
/// contributions and is tagged [`MatchOrigin::Both`].
pub fn fuse_rrf(
    vector_hits: &[ScoredChunk],
    keyword_hits: &[ScoredChunk],
    cfg: &RrfConfig,
    limit: usize,
) -> Vec<HybridSearchResult> {
    let cfg = cfg.normalized();
    let mut fused: Vec<HybridSearchResult> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for (i, hit) in vector_hits.iter().enumerate() {
        let rank = i + 1;
        let contribution = cfg.vector_weight / (cfg.k + rank as f32);
        let slot = fused.len();
        index.insert(hit.chunk.id.clone(), slot);
        fused.push(HybridSearchResult {
            chunk: hit.chunk.clone(),
            score: contribution,
            relevance: hit.score,
            vector_rank: rank,
            keyword_rank: 0,
            origin: MatchOrigin::Vector,
        });
    }
    for (i, hit) in keyword_hits.iter().enumerate() {
        let rank = i + 1;
        let contribution = cfg.keyword_weight / (cfg.k + rank as f32);
        // BM25-derived keyword scores are unbounded; clamp for relevance.
        let leg_relevance = hit.score.min(1.0);
        match index.get(&hit.chunk.id) {
            Some(&slot) => {
                let entry = &mut fused[slot];
                entry.score += contribution;
                entry.relevance = entry.relevance.max(leg_relevance);
                entry.keyword_rank = rank;
                entry.origin = MatchOrigin::Both;
            }
            None => {
                index.insert(hit.chunk.id.clone(), fused.len());
                fused.push(HybridSearchResult {
                    chunk: hit.chunk.clone(),
                    score: contribution,
                    relevance: leg_relevance,
                    vector_rank: 0,
                    keyword_rank: rank,
                    origin: MatchOrigin::Keyword,
                });
            }
        }
    }

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused.truncate(limit);
    fused
}

/// Drop any candidate whose cosine similarity to an already-kept result
/// meets the threshold. O(n²) over the shortlist, which stays small.
pub fn dedup_by_similarity(
    results: Vec<HybridSearchResult>,
    threshold: f32,
) -> Vec<HybridSearchResult> {
    let mut kept: Vec<HybridSearchResult> = Vec::with_capacity(results.len());
    for candidate in results {
        let duplicate = kept.iter().any(|k| {
            context_model::cosine_similarity(&k.chunk.embedding, &candidate.chunk.embedding)
                >= threshold
        });
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

/// At most `max` results per source id, keeping the highest-ranked ones.
pub fn cap_per_source(results: Vec<HybridSearchResult>, max: usize) -> Vec<HybridSearchResult> {
    if max == 0 {
        return Vec::new();
    }
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    results
        .into_iter()
        .filter(|r| {
            let n = counts.entry(r.chunk.source_id.clone()).or_insert(0);
            *n += 1;
            *n <= max
        })
        .collect()
}

pub const SECTOR_BOOST_FACTOR: f32 = 1.2;

/// Multiply the score of chunks whose metadata sector matches the active
/// sector, then re-sort.
pub fn sector_boost(results: &mut Vec<HybridSearchResult>, sector_id: &str) {
    for r in results.iter_mut() {
        if r.chunk.meta.sector_id.as_deref() == Some(sector_id) {
            r.score *= SECTOR_BOOST_FACTOR;
        }
    }
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// `score *= 1 + 0.2 * exp(-age_days / 30)`, then re-sort. Unparseable
/// timestamps are treated as old (no boost).
pub fn recency_boost(results: &mut Vec<HybridSearchResult>) {
    let now = chrono::Utc::now();
    for r in results.iter_mut() {
        let age_days = match chrono::DateTime::parse_from_rfc3339(&r.chunk.created_at) {
            Ok(created) => {
                let secs = (now - created.with_timezone(&chrono::Utc)).num_seconds();
                (secs.max(0) as f32) / 86_400.0
            }
            Err(_) => f32::INFINITY,
        };
        let decay = (-age_days / 30.0).exp();
        r.score *= 1.0 + decay * 0.2;
    }
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

impl ContextEngine {
    /// Hybrid search: run the dense and sparse legs concurrently (each
    /// requesting `2 * limit` candidates for fusion headroom) and fuse with
    /// RRF. A not-ready embedding provider degrades to keyword-only.
    pub fn hybrid_search(
        &self,
        query: &str,
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<HybridSearchResult>, EngineError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let fetch = limit.saturating_mul(2).max(limit);

        let query_vec = if self.embedder.is_ready() {
            self.embedder
                .embed(query)
                .map_err(|e| EngineError::Embed(e.to_string()))?
        } else {
            log::debug!("embedding provider not ready; keyword-only retrieval");
            None
        };

        // Two independent read-only legs on separate connections.
        let (vector_res, keyword_res) = std::thread::scope(|s| {
            let keyword = s.spawn(|| self.keyword_search(query, fetch, filter));
            let vector = match &query_vec {
                Some(v) => self.vector_search(v, fetch, filter),
                None => Ok(Vec::new()),
            };
            let keyword = keyword
                .join()
                .unwrap_or_else(|_| Err(EngineError::Io("keyword search thread panicked".into())));
            (vector, keyword)
        });
        let vector_hits = vector_res?;
        let keyword_hits = keyword_res?;

        Ok(fuse_rrf(&vector_hits, &keyword_hits, &self.cfg.rrf, limit))
    }
}
