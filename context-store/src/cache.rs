//! Bounded in-memory hot cache for recently-written chunks.
//!
//! Strictly a read-through accelerator: durable storage can always rebuild
//! it. Eviction is FIFO by insertion order — recency of insertion
//! approximates recency of relevance for this domain, so no LRU machinery.

use std::collections::{HashMap, VecDeque};

use context_model::EmbeddedChunk;

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct ChunkCache {
    capacity: usize,
    map: HashMap<String, EmbeddedChunk>,
    /// Insertion order; front is the oldest-inserted entry.
    order: VecDeque<String>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert or replace. Replacing an existing id keeps its queue position;
    /// a fresh id may evict the oldest-inserted entry. Returns true when an
    /// eviction happened.
    pub fn insert(&mut self, chunk: EmbeddedChunk) -> bool {
        let id = chunk.id.clone();
        let mut evicted_any = false;
        if self.map.insert(id.clone(), chunk).is_none() {
            self.order.push_back(id);
            while self.map.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                    evicted_any = true;
                } else {
                    break;
                }
            }
        }
        evicted_any
    }

    pub fn get(&self, id: &str) -> Option<&EmbeddedChunk> {
        self.map.get(id)
    }

    pub fn remove(&mut self, id: &str) {
        if self.map.remove(id).is_some() {
            self.order.retain(|k| k != id);
        }
    }

    pub fn remove_source(&mut self, source_id: &str) {
        let ids: Vec<String> = self
            .map
            .values()
            .filter(|c| c.source_id == source_id)
            .map(|c| c.id.clone())
            .collect();
        for id in ids {
            self.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmbeddedChunk> {
        self.map.values()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_model::{ChunkMeta, ContentType, SourceType};

    fn chunk(id: &str) -> EmbeddedChunk {
        EmbeddedChunk {
            id: id.to_string(),
            source_id: "src".into(),
            source_type: SourceType::Document,
            content: "text".into(),
            content_type: ContentType::Prose,
            embedding: vec![1.0],
            keywords: Vec::new(),
            chunk_index: 0,
            token_count: 1,
            meta: ChunkMeta::default(),
            created_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn evicts_oldest_inserted_first() {
        let mut cache = ChunkCache::new(2);
        cache.insert(chunk("a"));
        cache.insert(chunk("b"));
        cache.insert(chunk("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn reinsert_keeps_queue_position() {
        let mut cache = ChunkCache::new(2);
        cache.insert(chunk("a"));
        cache.insert(chunk("b"));
        // Touching "a" again must not promote it: it is still the oldest.
        cache.insert(chunk("a"));
        cache.insert(chunk("c"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn remove_source_drops_all_chunks_of_that_source() {
        let mut cache = ChunkCache::new(10);
        cache.insert(chunk("src#0"));
        cache.insert(chunk("src#1"));
        cache.remove_source("src");
        assert!(cache.is_empty());
    }
}
