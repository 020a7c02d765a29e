//! Budget-aware context assembly.
//!
//! Stateless per call: the assembler splits a total token ceiling across
//! four content classes, pulls recent messages and fused retrieval results
//! under their sub-budgets, and returns an [`AssembledContext`] with exact
//! token accounting.

use context_model::{estimate_tokens, StoredMessage};
use context_store::ChunkFilter;
use serde::{Deserialize, Serialize};

use crate::retriever::{
    cap_per_source, classify_query, dedup_by_similarity, recency_boost, retrieval_ceilings,
    sector_boost, HybridSearchResult,
};
use crate::{ContextEngine, EngineError};

/// Token ceiling and per-class ratios. Ratios conceptually sum to at most
/// 1.0; [`ContextBudgetConfig::normalized`] repairs anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudgetConfig {
    pub max_total_tokens: usize,
    pub recent_ratio: f32,
    pub chunk_ratio: f32,
    pub kb_ratio: f32,
    pub system_ratio: f32,
    pub min_relevance: f32,
    pub max_chunks_per_source: usize,
    pub dedup_threshold: f32,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            max_total_tokens: 8000,
            recent_ratio: 0.25,
            chunk_ratio: 0.40,
            kb_ratio: 0.20,
            system_ratio: 0.10,
            min_relevance: 0.0,
            max_chunks_per_source: 3,
            dedup_threshold: 0.9,
        }
    }
}

impl ContextBudgetConfig {
    /// Repair misconfiguration instead of panicking: NaN or negative
    /// ratios become 0, ratio sums above 1.0 are rescaled proportionally,
    /// and thresholds are pinned to sane ranges.
    pub fn normalized(&self) -> Self {
        let clamp = |r: f32| if r.is_finite() && r > 0.0 { r } else { 0.0 };
        let mut cfg = Self {
            max_total_tokens: self.max_total_tokens,
            recent_ratio: clamp(self.recent_ratio),
            chunk_ratio: clamp(self.chunk_ratio),
            kb_ratio: clamp(self.kb_ratio),
            system_ratio: clamp(self.system_ratio),
            min_relevance: if self.min_relevance.is_finite() {
                self.min_relevance.max(0.0)
            } else {
                0.0
            },
            max_chunks_per_source: self.max_chunks_per_source,
            dedup_threshold: if self.dedup_threshold.is_finite() {
                self.dedup_threshold.clamp(0.0, 1.0)
            } else {
                1.0
            },
        };
        let sum = cfg.recent_ratio + cfg.chunk_ratio + cfg.kb_ratio + cfg.system_ratio;
        if sum > 1.0 {
            cfg.recent_ratio /= sum;
            cfg.chunk_ratio /= sum;
            cfg.kb_ratio /= sum;
            cfg.system_ratio /= sum;
        }
        cfg
    }

    fn sub_budgets(&self) -> SubBudgets {
        let total = self.max_total_tokens as f32;
        SubBudgets {
            recent: (total * self.recent_ratio) as usize,
            chunks: (total * self.chunk_ratio) as usize,
            kb: (total * self.kb_ratio) as usize,
            system: (total * self.system_ratio) as usize,
        }
    }
}

struct SubBudgets {
    recent: usize,
    chunks: usize,
    kb: usize,
    system: usize,
}

/// Exact token usage per content class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub system: usize,
    pub specialist: usize,
    pub messages: usize,
    pub chunks: usize,
}

impl TokenBreakdown {
    pub fn total(&self) -> usize {
        self.system + self.specialist + self.messages + self.chunks
    }
}

/// Output of [`ContextEngine::assemble_context`]. Messages are in
/// chronological order; chunks are ranked best-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledContext {
    pub messages: Vec<StoredMessage>,
    pub chunks: Vec<HybridSearchResult>,
    pub specialist_text: Option<String>,
    pub system_prompt: Option<String>,
    pub total_tokens: usize,
    pub breakdown: TokenBreakdown,
}

#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    pub query: String,
    pub session_id: String,
    pub workspace_path: Option<String>,
    pub sector_id: Option<String>,
    pub specialist_text: Option<String>,
    pub system_prompt: Option<String>,
    /// Per-call override of the engine-level budget.
    pub budget: Option<ContextBudgetConfig>,
    pub filter: Option<ChunkFilter>,
}

/// Truncate to roughly `max_tokens`, preferring the last sentence or line
/// boundary in the allowed prefix and appending an ellipsis when anything
/// was cut. Boundary cuts that would discard more than half the prefix
/// fall through to the hard cut.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    if max_tokens == 0 {
        return String::new();
    }
    // Token estimation counts bytes, so the cut budget is in bytes too,
    // placed on a char boundary.
    let byte_budget = max_tokens * 4;
    let mut byte_end = 0;
    for (idx, ch) in text.char_indices() {
        if idx + ch.len_utf8() > byte_budget {
            break;
        }
        byte_end = idx + ch.len_utf8();
    }
    let prefix = &text[..byte_end];
    let cut = prefix
        .rfind(['.', '!', '?', '\n'])
        .map(|i| i + 1)
        .filter(|&i| i * 2 >= prefix.len())
        .unwrap_or(prefix.len());
    let mut out = prefix[..cut].trim_end().to_string();
    out.push('…');
    out
}

fn message_tokens(msg: &StoredMessage) -> usize {
    estimate_tokens(&msg.content)
}

fn chunk_tokens(result: &HybridSearchResult) -> usize {
    if result.chunk.token_count > 0 {
        result.chunk.token_count
    } else {
        estimate_tokens(&result.chunk.content)
    }
}

impl ContextEngine {
    /// Assemble a token-budgeted context for `opts.query`. Storage errors
    /// propagate; budget misconfiguration and provider unavailability
    /// degrade silently.
    pub fn assemble_context(
        &self,
        opts: &AssembleOptions,
    ) -> Result<AssembledContext, EngineError> {
        let budget = opts
            .budget
            .clone()
            .unwrap_or_else(|| self.config().budget.clone())
            .normalized();
        let sub = budget.sub_budgets();

        let system_prompt = opts
            .system_prompt
            .as_deref()
            .map(|t| truncate_to_tokens(t, sub.system))
            .filter(|t| !t.is_empty());
        let specialist_text = opts
            .specialist_text
            .as_deref()
            .map(|t| truncate_to_tokens(t, sub.kb))
            .filter(|t| !t.is_empty());

        let ceilings = retrieval_ceilings(classify_query(&opts.query));

        // Recent messages: merged session + workspace windows, newest kept
        // first under budget and ceiling, emitted oldest-first.
        let window = ceilings.recent_messages * 2;
        let mut pool = self.session_messages(&opts.session_id, window)?;
        if let Some(ws) = &opts.workspace_path {
            pool.extend(self.recent_messages(ws, window)?);
        }
        pool.sort_by(|a, b| (a.timestamp.as_str(), a.id).cmp(&(b.timestamp.as_str(), b.id)));
        pool.dedup_by(|a, b| a.id == b.id);

        let mut messages: Vec<StoredMessage> = Vec::new();
        let mut message_token_total = 0usize;
        for msg in pool.into_iter().rev() {
            if messages.len() >= ceilings.recent_messages {
                break;
            }
            let t = message_tokens(&msg);
            if message_token_total + t > sub.recent {
                break;
            }
            message_token_total += t;
            messages.push(msg);
        }
        messages.reverse();

        // Retrieved chunks: fetch with fusion headroom, then filter, dedup,
        // cap, boost, and greedily fill the sub-budget best-first.
        let filter = opts.filter.clone().unwrap_or_default();
        let mut fused = self.hybrid_search(&opts.query, ceilings.chunks * 2, &filter)?;
        fused.retain(|r| r.relevance >= budget.min_relevance);
        let fused = dedup_by_similarity(fused, budget.dedup_threshold);
        let mut fused = cap_per_source(fused, budget.max_chunks_per_source);
        if let Some(sector) = &opts.sector_id {
            sector_boost(&mut fused, sector);
        }
        recency_boost(&mut fused);

        let mut chunks: Vec<HybridSearchResult> = Vec::new();
        let mut chunk_token_total = 0usize;
        for result in fused {
            if chunks.len() >= ceilings.chunks {
                break;
            }
            let t = chunk_tokens(&result);
            if chunk_token_total + t > sub.chunks {
                break;
            }
            chunk_token_total += t;
            chunks.push(result);
        }

        let breakdown = TokenBreakdown {
            system: system_prompt.as_deref().map(estimate_tokens).unwrap_or(0),
            specialist: specialist_text.as_deref().map(estimate_tokens).unwrap_or(0),
            messages: message_token_total,
            chunks: chunk_token_total,
        };

        Ok(AssembledContext {
            messages,
            chunks,
            specialist_text,
            system_prompt,
            total_tokens: breakdown.total(),
            breakdown,
        })
    }

    /// Shrink an assembled context under a hard ceiling, in fixed priority
    /// order: lowest-ranked chunk first, then specialist text in 30%
    /// steps, then the oldest message. Stops once under target or when
    /// nothing removable remains.
    pub fn optimize_context(&self, ctx: &mut AssembledContext, target_tokens: usize) {
        while ctx.total_tokens > target_tokens {
            if let Some(dropped) = ctx.chunks.pop() {
                ctx.breakdown.chunks =
                    ctx.breakdown.chunks.saturating_sub(chunk_tokens(&dropped));
                ctx.total_tokens = ctx.breakdown.total();
                continue;
            }
            if let Some(text) = ctx.specialist_text.take() {
                let current = estimate_tokens(&text);
                let reduced = truncate_to_tokens(&text, current.saturating_mul(7) / 10);
                let reduced_tokens = estimate_tokens(&reduced);
                if reduced_tokens < current && !reduced.is_empty() {
                    ctx.specialist_text = Some(reduced);
                    ctx.breakdown.specialist = reduced_tokens;
                } else {
                    ctx.breakdown.specialist = 0;
                }
                ctx.total_tokens = ctx.breakdown.total();
                continue;
            }
            if !ctx.messages.is_empty() {
                let dropped = ctx.messages.remove(0);
                ctx.breakdown.messages =
                    ctx.breakdown.messages.saturating_sub(message_tokens(&dropped));
                ctx.total_tokens = ctx.breakdown.total();
                continue;
            }
            // Only the system prompt remains; nothing else to remove.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_ratios_rescale_when_oversubscribed() {
        let cfg = ContextBudgetConfig {
            recent_ratio: 1.0,
            chunk_ratio: 1.0,
            kb_ratio: 1.0,
            system_ratio: 1.0,
            ..ContextBudgetConfig::default()
        }
        .normalized();
        let sum = cfg.recent_ratio + cfg.chunk_ratio + cfg.kb_ratio + cfg.system_ratio;
        assert!((sum - 1.0).abs() < 1e-6);
        assert!((cfg.recent_ratio - 0.25).abs() < 1e-6);
    }

    #[test]
    fn budget_repairs_nan_and_negative_ratios() {
        let cfg = ContextBudgetConfig {
            recent_ratio: f32::NAN,
            chunk_ratio: -0.5,
            min_relevance: f32::NAN,
            dedup_threshold: f32::INFINITY,
            ..ContextBudgetConfig::default()
        }
        .normalized();
        assert_eq!(cfg.recent_ratio, 0.0);
        assert_eq!(cfg.chunk_ratio, 0.0);
        assert_eq!(cfg.min_relevance, 0.0);
        assert_eq!(cfg.dedup_threshold, 1.0);
    }

    #[test]
    fn truncate_keeps_short_text_verbatim() {
        assert_eq!(truncate_to_tokens("short text", 100), "short text");
    }

    #[test]
    fn truncate_prefers_sentence_boundary() {
        let text = "First sentence here. Second sentence is much longer and will not fit at all.";
        // 10 tokens = 40 chars; the first sentence ends at char 20.
        let out = truncate_to_tokens(text, 10);
        assert_eq!(out, "First sentence here.…");
    }

    #[test]
    fn truncate_hard_cuts_without_boundary() {
        let text = "x".repeat(100);
        let out = truncate_to_tokens(&text, 5);
        assert_eq!(out, format!("{}…", "x".repeat(20)));
    }

    #[test]
    fn truncate_budgets_bytes_for_multibyte_text() {
        // Two bytes per char: a char-counted cut would keep twice the
        // allowed bytes.
        let text = "é".repeat(1000);
        let out = truncate_to_tokens(&text, 10);
        assert!(out.ends_with('…'));
        assert_eq!(out.chars().count(), 21);
        assert!(estimate_tokens(&out) <= 11);
    }

    #[test]
    fn truncate_to_zero_is_empty() {
        assert_eq!(truncate_to_tokens("anything at all goes here", 0), "");
    }
}
