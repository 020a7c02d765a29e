use std::path::Path;

use context_model::{ChunkMeta, ContentType, EmbeddedChunk, SourceType};
use rusqlite::{params, Connection, TransactionBehavior};

use crate::{
    fallback_terms, fts_match_query, ChunkFilter, ScoredChunk, StoreError, VECTOR_CANDIDATE_CEILING,
};

const CHUNK_COLUMNS: &str = "chunk_id, source_id, source_type, content, content_type, embedding, keywords_json, chunk_index, token_count, meta_json, created_at";

/// SQLite-backed chunk store. FTS5 is probed once at open; when the
/// virtual table cannot be created the repo pins a LIKE fallback for
/// keyword search instead of failing.
pub struct ChunkRepo {
    conn: Connection,
    fts_enabled: bool,
}

impl ChunkRepo {
    /// Open a file-backed repository at `path` and initialize schema if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init(conn, true)
    }

    /// Open with the full-text capability forced off (testing and
    /// constrained runtimes).
    pub fn open_without_fts<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init(conn, false)
    }

    /// Open an in-memory repository (single-connection lifetime).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init(conn, true)
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    fn init(conn: Connection, want_fts: bool) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                rowid INTEGER PRIMARY KEY,
                chunk_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL,
                embedding BLOB,
                keywords_json TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                token_count INTEGER NOT NULL,
                meta_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_chunk_id ON chunks(chunk_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_source_type ON chunks(source_type);
            CREATE INDEX IF NOT EXISTS idx_chunks_created_at ON chunks(created_at);
            "#,
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        // FTS5 is an optional capability: probe once, pin the fallback on failure.
        let fts_enabled = want_fts
            && match conn.execute_batch(
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                    content,
                    keywords_json,
                    content='chunks',
                    content_rowid='rowid',
                    tokenize = 'unicode61'
                );

                CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                    INSERT INTO chunks_fts(rowid, content, keywords_json)
                    VALUES (new.rowid, new.content, new.keywords_json);
                END;

                CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                    INSERT INTO chunks_fts(chunks_fts, rowid, content, keywords_json)
                    VALUES ('delete', old.rowid, old.content, old.keywords_json);
                END;

                CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE OF content, keywords_json ON chunks BEGIN
                    INSERT INTO chunks_fts(chunks_fts, rowid, content, keywords_json)
                    VALUES ('delete', old.rowid, old.content, old.keywords_json);
                    INSERT INTO chunks_fts(rowid, content, keywords_json)
                    VALUES (new.rowid, new.content, new.keywords_json);
                END;
                "#,
            ) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("chunk FTS5 unavailable, using substring fallback: {e}");
                    false
                }
            };

        Ok(Self { conn, fts_enabled })
    }

    /// Idempotent upsert by chunk id.
    pub fn upsert_chunk(&mut self, chunk: &EmbeddedChunk) -> Result<(), StoreError> {
        self.upsert_chunks(std::slice::from_ref(chunk))
    }

    /// Upsert a batch atomically.
    pub fn upsert_chunks(&mut self, chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                INSERT INTO chunks (
                    chunk_id, source_id, source_type, content, content_type,
                    embedding, keywords_json, chunk_index, token_count, meta_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    source_id=excluded.source_id,
                    source_type=excluded.source_type,
                    content=excluded.content,
                    content_type=excluded.content_type,
                    embedding=excluded.embedding,
                    keywords_json=excluded.keywords_json,
                    chunk_index=excluded.chunk_index,
                    token_count=excluded.token_count,
                    meta_json=excluded.meta_json,
                    created_at=excluded.created_at
                ;
                "#,
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            for rec in chunks {
                let keywords_json = serde_json::to_string(&rec.keywords)
                    .unwrap_or_else(|_| "[]".to_string());
                let meta_json =
                    serde_json::to_string(&rec.meta).unwrap_or_else(|_| "{}".to_string());
                let embedding: Option<Vec<u8>> = if rec.embedding.is_empty() {
                    None
                } else {
                    Some(embedding_to_bytes(&rec.embedding))
                };
                stmt.execute(params![
                    rec.id,
                    rec.source_id,
                    rec.source_type.as_str(),
                    rec.content,
                    rec.content_type.as_str(),
                    embedding,
                    keywords_json,
                    rec.chunk_index as i64,
                    rec.token_count as i64,
                    meta_json,
                    rec.created_at,
                ])
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Fetch a single chunk by id.
    pub fn get_chunk(&self, id: &str) -> Result<Option<EmbeddedChunk>, StoreError> {
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?1");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut rows = stmt
            .query([id])
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match rows.next().map_err(|e| StoreError::Backend(e.to_string()))? {
            Some(row) => Ok(Some(
                row_to_chunk(row).map_err(|e| StoreError::Backend(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// All chunks of one source, ordered by chunk index.
    pub fn get_chunks_for_source(&self, source_id: &str) -> Result<Vec<EmbeddedChunk>, StoreError> {
        let sql =
            format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE source_id = ?1 ORDER BY chunk_index");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map([source_id], row_to_chunk)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }

    /// Brute-force cosine similarity over at most [`VECTOR_CANDIDATE_CEILING`]
    /// pre-filtered candidates. Deliberately not an ANN index; this is a
    /// simplicity/latency tradeoff for small corpora.
    pub fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let (where_sql, params) = build_prefilter(filter);
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks {where_sql} LIMIT {VECTOR_CANDIDATE_CEILING}"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.into_iter()), row_to_chunk)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut hits: Vec<ScoredChunk> = Vec::new();
        for r in rows {
            let chunk = r.map_err(|e| StoreError::Backend(e.to_string()))?;
            if chunk.embedding.len() != query.len() {
                continue;
            }
            if !filter.matches_meta(&chunk) {
                continue;
            }
            let score = context_model::cosine_similarity(query, &chunk.embedding);
            hits.push(ScoredChunk { chunk, score });
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Ranked keyword search over content and keywords. BM25 via FTS5 when
    /// available, otherwise a substring scan with uniform score 1.0.
    pub fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        if self.fts_enabled {
            self.keyword_search_fts(query, limit, filter)
        } else {
            self.keyword_search_like(query, limit, filter)
        }
    }

    fn keyword_search_fts(
        &self,
        query: &str,
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let Some(match_query) = fts_match_query(query) else {
            return Ok(Vec::new());
        };
        let (where_sql, mut params) = build_prefilter_prefixed(filter, "c.");
        // The MATCH left operand must be the fts5 table name, not an alias;
        // SQLite resolves it as the table's hidden column.
        let sql = format!(
            "SELECT {cols}, bm25(chunks_fts) AS rank \
             FROM chunks_fts \
             JOIN chunks c ON c.rowid = chunks_fts.rowid \
             {where_sql} AND chunks_fts MATCH ? \
             ORDER BY rank LIMIT ?",
            cols = prefixed_columns("c.")
        );
        params.push(match_query.into());
        params.push((limit as i64).into());
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.into_iter()), |row| {
                let chunk = row_to_chunk(row)?;
                let rank: f64 = row.get(11)?;
                // bm25() is smaller-is-better and non-positive; negate so
                // larger is better.
                Ok(ScoredChunk { chunk, score: (-rank).max(0.0) as f32 })
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            let hit = r.map_err(|e| StoreError::Backend(e.to_string()))?;
            if filter.matches_meta(&hit.chunk) {
                out.push(hit);
            }
        }
        Ok(out)
    }

    fn keyword_search_like(
        &self,
        query: &str,
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let terms = fallback_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let (mut where_sql, mut params) = build_prefilter(filter);
        where_sql.push_str(" AND (");
        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                where_sql.push_str(" OR ");
            }
            where_sql.push_str("lower(content) LIKE ? OR lower(keywords_json) LIKE ?");
            let pat = format!("%{term}%");
            params.push(pat.clone().into());
            params.push(pat.into());
        }
        where_sql.push(')');
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks {where_sql} LIMIT ?");
        params.push((limit as i64).into());
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.into_iter()), row_to_chunk)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            let chunk = r.map_err(|e| StoreError::Backend(e.to_string()))?;
            if filter.matches_meta(&chunk) {
                out.push(ScoredChunk { chunk, score: 1.0 });
            }
        }
        Ok(out)
    }

    /// Most recently created chunks, newest first. Used to prime the hot
    /// cache at startup.
    pub fn recent_chunks(&self, limit: usize) -> Result<Vec<EmbeddedChunk>, StoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map([limit as i64], row_to_chunk)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }

    /// Delete one chunk by id. Returns affected rows.
    pub fn delete_chunk(&mut self, id: &str) -> Result<usize, StoreError> {
        self.conn
            .execute("DELETE FROM chunks WHERE chunk_id = ?1", [id])
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Delete every chunk of a source. Returns affected rows.
    pub fn delete_source(&mut self, source_id: &str) -> Result<usize, StoreError> {
        self.conn
            .execute("DELETE FROM chunks WHERE source_id = ?1", [source_id])
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.conn
            .query_row("SELECT count(*) FROM chunks", [], |r| r.get(0))
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Return (chunks_count, chunks_fts_count) for debugging.
    pub fn counts(&self) -> Result<(i64, i64), StoreError> {
        let chunks: i64 = self
            .conn
            .query_row("SELECT count(*) FROM chunks", [], |r| r.get(0))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let fts: i64 = if self.fts_enabled {
            self.conn
                .query_row("SELECT count(*) FROM chunks_fts", [], |r| r.get(0))
                .unwrap_or(0)
        } else {
            0
        };
        Ok((chunks, fts))
    }
}

fn prefixed_columns(prefix: &str) -> String {
    CHUNK_COLUMNS
        .split(", ")
        .map(|c| format!("{prefix}{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQL-pushable predicates: source type, created_at range, excluded ids.
fn build_prefilter(filter: &ChunkFilter) -> (String, Vec<rusqlite::types::Value>) {
    build_prefilter_prefixed(filter, "")
}

fn build_prefilter_prefixed(
    filter: &ChunkFilter,
    prefix: &str,
) -> (String, Vec<rusqlite::types::Value>) {
    let mut where_sql = String::from("WHERE 1=1");
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    if !filter.source_types.is_empty() {
        where_sql.push_str(&format!(" AND {prefix}source_type IN ("));
        for (i, st) in filter.source_types.iter().enumerate() {
            if i > 0 {
                where_sql.push(',');
            }
            where_sql.push('?');
            params.push(st.as_str().to_string().into());
        }
        where_sql.push(')');
    }
    if let Some(start) = &filter.date_start {
        where_sql.push_str(&format!(" AND {prefix}created_at >= ?"));
        params.push(start.clone().into());
    }
    if let Some(end) = &filter.date_end {
        where_sql.push_str(&format!(" AND {prefix}created_at <= ?"));
        params.push(end.clone().into());
    }
    if !filter.exclude_ids.is_empty() {
        where_sql.push_str(&format!(" AND {prefix}chunk_id NOT IN ("));
        for (i, id) in filter.exclude_ids.iter().enumerate() {
            if i > 0 {
                where_sql.push(',');
            }
            where_sql.push('?');
            params.push(id.clone().into());
        }
        where_sql.push(')');
    }
    (where_sql, params)
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddedChunk> {
    let chunk_id: String = row.get(0)?;
    let source_id: String = row.get(1)?;
    let source_type: String = row.get(2)?;
    let content: String = row.get(3)?;
    let content_type: String = row.get(4)?;
    let embedding_bytes: Option<Vec<u8>> = row.get(5)?;
    let keywords_json: String = row.get(6)?;
    let chunk_index: i64 = row.get(7)?;
    let token_count: i64 = row.get(8)?;
    let meta_json: String = row.get(9)?;
    let created_at: String = row.get(10)?;

    let keywords: Vec<String> = serde_json::from_str(&keywords_json).unwrap_or_default();
    let meta: ChunkMeta = serde_json::from_str(&meta_json).unwrap_or_default();
    let embedding = embedding_bytes
        .as_deref()
        .map(bytes_to_embedding)
        .unwrap_or_default();

    Ok(EmbeddedChunk {
        id: chunk_id,
        source_id,
        source_type: SourceType::parse(&source_type),
        content,
        content_type: ContentType::parse(&content_type),
        embedding,
        keywords,
        chunk_index: u32::try_from(chunk_index).unwrap_or(0),
        token_count: usize::try_from(token_count).unwrap_or(0),
        meta,
        created_at,
    })
}

/// Raw f32 bytes, little-endian on all supported targets.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(v).to_vec()
}

/// Byte length must be a multiple of 4; anything else decodes to empty.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Vec::new();
    }
    bytemuck::pod_collect_to_vec(bytes)
}
