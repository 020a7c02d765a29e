//! Hybrid retrieval and context assembly engine.
//!
//! One [`ContextEngine`] instance per process owns the chunk store, the
//! message store, the bounded hot cache and the embedding provider handle.
//! Retrieval fuses dense (cosine) and sparse (BM25/substring) search with
//! Reciprocal Rank Fusion; assembly turns retrieval output into a
//! token-budgeted [`assembler::AssembledContext`].

pub mod assembler;
pub mod retriever;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use context_model::{ChunkMeta, EmbeddedChunk, SourceType, StoredMessage};
use context_store::cache::{ChunkCache, DEFAULT_CACHE_CAPACITY};
use context_store::chunk_repo::ChunkRepo;
use context_store::message_repo::{MessageRepo, NewMessage};
use context_store::{ChunkFilter, ScoredChunk, ScoredMessage, StoreError};
use embedding_provider::EmbeddingProvider;
use text_chunker::ChunkParams;

pub use assembler::{
    AssembleOptions, AssembledContext, ContextBudgetConfig, TokenBreakdown,
};
pub use retriever::{HybridSearchResult, MatchOrigin, QueryComplexity, RrfConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("embedder error: {0}")]
    Embed(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunks_db_path: PathBuf,
    pub messages_db_path: PathBuf,
    pub cache_capacity: usize,
    pub budget: ContextBudgetConfig,
    pub rrf: RrfConfig,
    pub chunking: ChunkParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunks_db_path: PathBuf::from("target/demo/chunks.db"),
            messages_db_path: PathBuf::from("target/demo/messages.db"),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            budget: ContextBudgetConfig::default(),
            rrf: RrfConfig::default(),
            chunking: ChunkParams::default(),
        }
    }
}

pub struct ContextEngine {
    cfg: EngineConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<RwLock<ChunkCache>>,
    /// True while the cache mirrors the durable store completely; cleared
    /// once the corpus outgrows the cache capacity.
    cache_authoritative: AtomicBool,
}

impl ContextEngine {
    pub fn new(
        cfg: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, EngineError> {
        for path in [&cfg.chunks_db_path, &cfg.messages_db_path] {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| EngineError::Io(e.to_string()))?;
            }
        }
        // Open both stores once so schema problems surface at startup.
        let repo = ChunkRepo::open(&cfg.chunks_db_path)?;
        let _ = MessageRepo::open(&cfg.messages_db_path)?;

        // Prime the hot cache from the most recent chunks. The cache is
        // authoritative only while the whole corpus fits.
        let mut cache = ChunkCache::new(cfg.cache_capacity);
        let total = repo.count()?;
        let recent = repo.recent_chunks(cfg.cache_capacity)?;
        for chunk in recent.into_iter().rev() {
            cache.insert(chunk);
        }
        let authoritative = (total as usize) <= cfg.cache_capacity;

        log::info!(
            "context engine open: {total} chunks, fts={}, cache={} (authoritative={authoritative})",
            repo.fts_enabled(),
            cache.len(),
        );

        Ok(Self {
            cfg,
            embedder,
            cache: Arc::new(RwLock::new(cache)),
            cache_authoritative: AtomicBool::new(authoritative),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Guarded access to the chunk store: opens a connection per operation
    /// so reads can run concurrently from scoped threads.
    pub fn with_chunks<R, F>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut ChunkRepo) -> Result<R, EngineError>,
    {
        let mut repo = ChunkRepo::open(&self.cfg.chunks_db_path)?;
        f(&mut repo)
    }

    /// Guarded access to the message store.
    pub fn with_messages<R, F>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut MessageRepo) -> Result<R, EngineError>,
    {
        let mut repo = MessageRepo::open(&self.cfg.messages_db_path)?;
        f(&mut repo)
    }

    // ---- message surface ----

    /// Append a chat turn; searchable as soon as this returns.
    pub fn add_message(&self, msg: &NewMessage) -> Result<i64, EngineError> {
        self.with_messages(|repo| Ok(repo.add_message(msg)?))
    }

    pub fn session_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        self.with_messages(|repo| Ok(repo.session_messages(session_id, limit)?))
    }

    pub fn recent_messages(
        &self,
        workspace_path: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        self.with_messages(|repo| Ok(repo.recent_messages(workspace_path, limit)?))
    }

    pub fn search_messages(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, EngineError> {
        self.with_messages(|repo| Ok(repo.search_messages(query, limit)?))
    }

    pub fn delete_message(&self, id: i64) -> Result<usize, EngineError> {
        self.with_messages(|repo| Ok(repo.delete_message(id)?))
    }

    pub fn delete_session(&self, session_id: &str) -> Result<usize, EngineError> {
        self.with_messages(|repo| Ok(repo.delete_session(session_id)?))
    }

    /// Age-based purge of messages older than `days`.
    pub fn purge_messages(&self, days: i64) -> Result<usize, EngineError> {
        self.with_messages(|repo| Ok(repo.delete_older_than(days)?))
    }

    // ---- chunk surface ----

    /// Idempotent upsert; the hot cache is updated in the same call so a
    /// just-written chunk is never invisible to search.
    pub fn add_chunk(&self, chunk: &EmbeddedChunk) -> Result<(), EngineError> {
        self.add_chunks(std::slice::from_ref(chunk))
    }

    pub fn add_chunks(&self, chunks: &[EmbeddedChunk]) -> Result<(), EngineError> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.with_chunks(|repo| Ok(repo.upsert_chunks(chunks)?))?;
        // Cache updates are best-effort and never fail the write.
        if let Ok(mut cache) = self.cache.write() {
            for chunk in chunks {
                if cache.insert(chunk.clone()) {
                    // Eviction means the cache no longer mirrors the store.
                    self.cache_authoritative.store(false, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    pub fn get_chunk(&self, id: &str) -> Result<Option<EmbeddedChunk>, EngineError> {
        if let Ok(cache) = self.cache.read() {
            if let Some(chunk) = cache.get(id) {
                return Ok(Some(chunk.clone()));
            }
        }
        self.with_chunks(|repo| Ok(repo.get_chunk(id)?))
    }

    pub fn chunks_for_source(&self, source_id: &str) -> Result<Vec<EmbeddedChunk>, EngineError> {
        self.with_chunks(|repo| Ok(repo.get_chunks_for_source(source_id)?))
    }

    pub fn delete_chunk(&self, id: &str) -> Result<usize, EngineError> {
        let n = self.with_chunks(|repo| Ok(repo.delete_chunk(id)?))?;
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(id);
        }
        Ok(n)
    }

    pub fn delete_source(&self, source_id: &str) -> Result<usize, EngineError> {
        let n = self.with_chunks(|repo| Ok(repo.delete_source(source_id)?))?;
        if let Ok(mut cache) = self.cache.write() {
            cache.remove_source(source_id);
        }
        Ok(n)
    }

    pub fn chunk_count(&self) -> Result<i64, EngineError> {
        self.with_chunks(|repo| Ok(repo.count()?))
    }

    /// Dense similarity search. Scans the hot cache when no filter is given
    /// and the cache still mirrors the store; falls back to the durable scan
    /// otherwise.
    pub fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, EngineError> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        if filter.is_empty() && self.cache_authoritative.load(Ordering::Relaxed) {
            if let Ok(cache) = self.cache.read() {
                if !cache.is_empty() {
                    let mut hits: Vec<ScoredChunk> = cache
                        .iter()
                        .filter(|c| c.embedding.len() == query.len())
                        .map(|c| ScoredChunk {
                            score: context_model::cosine_similarity(query, &c.embedding),
                            chunk: c.clone(),
                        })
                        .collect();
                    hits.sort_by(|a, b| {
                        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    hits.truncate(limit);
                    return Ok(hits);
                }
            }
        }
        self.with_chunks(|repo| Ok(repo.vector_search(query, limit, filter)?))
    }

    /// Sparse keyword search (BM25 or substring fallback).
    pub fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, EngineError> {
        self.with_chunks(|repo| Ok(repo.keyword_search(query, limit, filter)?))
    }

    /// Chunk a source text, embed each piece when the provider is ready,
    /// and persist the result. Not-ready providers yield keyword-only
    /// chunks rather than an error.
    pub fn chunk_and_embed(
        &self,
        text: &str,
        source_id: &str,
        source_type: SourceType,
        meta: ChunkMeta,
    ) -> Result<Vec<EmbeddedChunk>, EngineError> {
        let mut chunks =
            text_chunker::chunk_source(text, source_id, source_type, meta, &self.cfg.chunking);
        if self.embedder.is_ready() {
            for chunk in &mut chunks {
                match self.embedder.embed(&chunk.content) {
                    Ok(Some(v)) => chunk.embedding = v,
                    Ok(None) => {}
                    Err(e) => return Err(EngineError::Embed(e.to_string())),
                }
            }
        } else {
            log::debug!("embedding provider not ready; storing keyword-only chunks");
        }
        self.add_chunks(&chunks)?;
        Ok(chunks)
    }
}
