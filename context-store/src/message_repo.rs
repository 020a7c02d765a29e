use std::path::Path;

use chrono::Utc;
use context_model::{MessageMeta, Role, StoredMessage};
use rusqlite::{params, Connection};

use crate::{fallback_terms, fts_match_query, ScoredMessage, StoreError};

const MESSAGE_COLUMNS: &str =
    "id, session_id, workspace_path, role, content, timestamp, tags_json, meta_json";

/// Input for a message append. Timestamp defaults to now when absent.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub session_id: String,
    pub workspace_path: Option<String>,
    pub role: Role,
    pub content: String,
    pub timestamp: Option<String>,
    pub tags: Vec<String>,
    pub meta: MessageMeta,
}

/// SQLite-backed append-only chat log. Writes are synchronous: a message
/// is searchable as soon as `add_message` returns.
pub struct MessageRepo {
    conn: Connection,
    fts_enabled: bool,
}

impl MessageRepo {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init(conn, true)
    }

    pub fn open_without_fts<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init(conn, false)
    }

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
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                session_id TEXT NOT NULL,
                workspace_path TEXT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                meta_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_workspace_ts ON messages(workspace_path, timestamp);
            "#,
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let fts_enabled = want_fts
            && match conn.execute_batch(
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                    content,
                    content='messages',
                    content_rowid='id',
                    tokenize = 'unicode61'
                );

                CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
                    INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
                END;

                CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
                    INSERT INTO messages_fts(messages_fts, rowid, content)
                    VALUES ('delete', old.id, old.content);
                END;

                CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE OF content ON messages BEGIN
                    INSERT INTO messages_fts(messages_fts, rowid, content)
                    VALUES ('delete', old.id, old.content);
                    INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
                END;
                "#,
            ) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("message FTS5 unavailable, using substring fallback: {e}");
                    false
                }
            };

        Ok(Self { conn, fts_enabled })
    }

    /// Append a chat turn; returns the assigned id.
    pub fn add_message(&mut self, msg: &NewMessage) -> Result<i64, StoreError> {
        let timestamp = msg
            .timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        let tags_json = serde_json::to_string(&msg.tags).unwrap_or_else(|_| "[]".to_string());
        let meta_json = serde_json::to_string(&msg.meta).unwrap_or_else(|_| "{}".to_string());
        self.conn
            .execute(
                r#"
                INSERT INTO messages (session_id, workspace_path, role, content, timestamp, tags_json, meta_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    msg.session_id,
                    msg.workspace_path,
                    msg.role.as_str(),
                    msg.content,
                    timestamp,
                    tags_json,
                    meta_json,
                ],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent `limit` messages of a session, returned oldest-first.
    pub fn session_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1 \
             ORDER BY timestamp DESC, id DESC LIMIT ?2"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], row_to_message)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        out.reverse();
        Ok(out)
    }

    /// Most recent `limit` messages across sessions of one workspace,
    /// returned oldest-first.
    pub fn recent_messages(
        &self,
        workspace_path: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE workspace_path = ?1 \
             ORDER BY timestamp DESC, id DESC LIMIT ?2"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![workspace_path, limit as i64], row_to_message)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        out.reverse();
        Ok(out)
    }

    /// Ranked full-text search; substring fallback scores uniformly 1.0.
    pub fn search_messages(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, StoreError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        if self.fts_enabled {
            self.search_fts(query, limit)
        } else {
            self.search_like(query, limit)
        }
    }

    fn search_fts(&self, query: &str, limit: usize) -> Result<Vec<ScoredMessage>, StoreError> {
        let Some(match_query) = fts_match_query(query) else {
            return Ok(Vec::new());
        };
        // MATCH resolves its left operand as the fts5 table's hidden
        // column, so no alias here.
        let sql = format!(
            "SELECT {cols}, bm25(messages_fts) AS rank \
             FROM messages_fts \
             JOIN messages m ON m.id = messages_fts.rowid \
             WHERE messages_fts MATCH ?1 ORDER BY rank LIMIT ?2",
            cols = MESSAGE_COLUMNS
                .split(", ")
                .map(|c| format!("m.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(params![match_query, limit as i64], |row| {
                let message = row_to_message(row)?;
                let rank: f64 = row.get(8)?;
                Ok(ScoredMessage { message, score: (-rank).max(0.0) as f32 })
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }

    fn search_like(&self, query: &str, limit: usize) -> Result<Vec<ScoredMessage>, StoreError> {
        let terms = fallback_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut where_sql = String::from("WHERE (");
        let mut params_vec: Vec<rusqlite::types::Value> = Vec::new();
        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                where_sql.push_str(" OR ");
            }
            where_sql.push_str("lower(content) LIKE ?");
            params_vec.push(format!("%{term}%").into());
        }
        where_sql.push(')');
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages {where_sql} ORDER BY timestamp, id LIMIT ?"
        );
        params_vec.push((limit as i64).into());
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params_vec.into_iter()), |row| {
                let message = row_to_message(row)?;
                Ok(ScoredMessage { message, score: 1.0 })
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }

    pub fn delete_message(&mut self, id: i64) -> Result<usize, StoreError> {
        self.conn
            .execute("DELETE FROM messages WHERE id = ?1", [id])
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub fn delete_session(&mut self, session_id: &str) -> Result<usize, StoreError> {
        self.conn
            .execute("DELETE FROM messages WHERE session_id = ?1", [session_id])
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// Age-based purge: delete messages older than `days` days.
    pub fn delete_older_than(&mut self, days: i64) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        self.conn
            .execute("DELETE FROM messages WHERE timestamp < ?1", [cutoff])
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.conn
            .query_row("SELECT count(*) FROM messages", [], |r| r.get(0))
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: i64 = row.get(0)?;
    let session_id: String = row.get(1)?;
    let workspace_path: Option<String> = row.get(2)?;
    let role: String = row.get(3)?;
    let content: String = row.get(4)?;
    let timestamp: String = row.get(5)?;
    let tags_json: String = row.get(6)?;
    let meta_json: String = row.get(7)?;

    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let meta: MessageMeta = serde_json::from_str(&meta_json).unwrap_or_default();

    Ok(StoredMessage {
        id,
        session_id,
        workspace_path,
        role: Role::parse(&role),
        content,
        timestamp,
        tags,
        meta,
    })
}
