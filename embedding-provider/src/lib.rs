//! Embedding provider surface consumed by the retrieval engine.
//!
//! The engine never computes real model embeddings itself; it talks to a
//! provider through [`EmbeddingProvider`]. A provider may be slow to load
//! or absent entirely, so `embed` returns `Ok(None)` (not an error) when
//! no vector can be produced — callers degrade to keyword-only retrieval.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// Identifies the backing implementation that powers a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Deterministic feature-hashing fallback; no model required.
    HashFallback,
    /// External model-backed provider (ONNX, HTTP, ...).
    External,
}

/// Static metadata describing a particular provider instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub model_id: String,
    pub dimension: usize,
}

/// Errors that can be produced by provider operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmbedderError {
    #[error("invalid provider configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("provider failure: {message}")]
    ProviderFailure { message: String },
}

/// Core interface for all embedding providers.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a text. `Ok(None)` means the provider cannot serve vectors
    /// right now (model not downloaded/loaded); callers treat this as a
    /// degrade-to-keyword-only condition, never as an error.
    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbedderError>;

    /// True when `embed` is expected to return vectors.
    fn is_ready(&self) -> bool;

    /// Cheap token estimate used for budget math.
    fn estimate_tokens(&self, text: &str) -> usize {
        context_model::estimate_tokens(text)
    }

    fn info(&self) -> &ProviderInfo;
}

/// Deterministic feature-hashing embedder. Projects lowercase word tokens
/// into a fixed-dimension bag-of-words vector and L2-normalizes it. Not a
/// semantic model — it exists so retrieval stays functional (and testable)
/// when no real model is available.
#[derive(Debug)]
pub struct HashingEmbedder {
    info: ProviderInfo,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self, EmbedderError> {
        if dimension == 0 {
            return Err(EmbedderError::InvalidConfiguration {
                message: "dimension must be greater than zero".into(),
            });
        }
        Ok(Self {
            info: ProviderInfo {
                kind: ProviderKind::HashFallback,
                model_id: "hash-v1".into(),
                dimension,
            },
        })
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbedderError> {
        let dim = self.info.dimension;
        let mut v = vec![0.0f32; dim];
        for raw in text.split(|c: char| !c.is_alphanumeric()) {
            let word = raw.to_lowercase();
            if word.is_empty() {
                continue;
            }
            let mut h = DefaultHasher::new();
            word.hash(&mut h);
            let h = h.finish();
            let slot = (h % dim as u64) as usize;
            // Sign from a second hash bit spreads collisions around zero.
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(Some(v))
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn info(&self) -> &ProviderInfo {
        &self.info
    }
}

/// Provider placeholder for a model that has not been downloaded or loaded
/// yet. Always reports not ready and embeds to `None`.
#[derive(Debug)]
pub struct UnavailableEmbedder {
    info: ProviderInfo,
}

impl UnavailableEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            info: ProviderInfo {
                kind: ProviderKind::External,
                model_id: "unavailable".into(),
                dimension,
            },
        }
    }
}

impl EmbeddingProvider for UnavailableEmbedder {
    fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, EmbedderError> {
        Ok(None)
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn info(&self) -> &ProviderInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64).expect("valid dimension");
        let a = e.embed("hybrid retrieval engine").unwrap().unwrap();
        let b = e.embed("hybrid retrieval engine").unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let e = HashingEmbedder::new(128).expect("valid dimension");
        let a = e.embed("sqlite storage engine chunks").unwrap().unwrap();
        let b = e.embed("sqlite storage engine tables").unwrap().unwrap();
        let c = e.embed("zebra giraffe savanna").unwrap().unwrap();
        let close = context_model::cosine_similarity(&a, &b);
        let far = context_model::cosine_similarity(&a, &c);
        assert!(close > far);
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(HashingEmbedder::new(0).is_err());
    }

    #[test]
    fn unavailable_embedder_degrades_to_none() {
        let e = UnavailableEmbedder::new(384);
        assert!(!e.is_ready());
        assert_eq!(e.embed("anything").unwrap(), None);
        assert_eq!(e.estimate_tokens("abcdefgh"), 2);
    }
}
