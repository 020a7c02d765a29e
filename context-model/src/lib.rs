//! Shared models used across crates

use serde::{Deserialize, Serialize};

/// Where a chunk's source text originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Message,
    Document,
    Code,
    KbEntry,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Message => "message",
            SourceType::Document => "document",
            SourceType::Code => "code",
            SourceType::KbEntry => "kb_entry",
        }
    }

    /// Unknown strings decode to Document rather than failing the row.
    pub fn parse(s: &str) -> Self {
        match s {
            "message" => SourceType::Message,
            "code" => SourceType::Code,
            "kb_entry" => SourceType::KbEntry,
            _ => SourceType::Document,
        }
    }
}

/// Structural shape of a chunk's text, detected at chunking time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Prose,
    Code,
    Table,
    List,
    Mixed,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Prose => "prose",
            ContentType::Code => "code",
            ContentType::Table => "table",
            ContentType::List => "list",
            ContentType::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "code" => ContentType::Code,
            "table" => ContentType::Table,
            "list" => ContentType::List,
            "mixed" => ContentType::Mixed,
            _ => ContentType::Prose,
        }
    }
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => Role::Assistant,
            "system" => Role::System,
            _ => Role::User,
        }
    }
}

/// Typed chunk metadata. Stored as JSON; parse failures decode to default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_tags: Vec<String>,
}

/// A retrievable unit of knowledge: text plus its embedding and keywords.
///
/// `id` is derived as `{source_id}#{chunk_index}` so re-chunking a source
/// overwrites its previous chunks. The embedding may be empty when no
/// provider was ready at ingest time; such chunks are still keyword-searchable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub content: String,
    pub content_type: ContentType,
    pub embedding: Vec<f32>,
    pub keywords: Vec<String>,
    pub chunk_index: u32,
    pub token_count: usize,
    pub meta: ChunkMeta,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

impl EmbeddedChunk {
    pub fn chunk_id(source_id: &str, index: u32) -> String {
        format!("{source_id}#{index}")
    }
}

/// Typed message metadata. Stored as JSON; parse failures decode to default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentioned_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sector_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ticket_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u32>,
}

/// A single persisted chat turn. Immutable once written except for deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// SQLite rowid assigned on insert.
    pub id: i64,
    pub session_id: String,
    pub workspace_path: Option<String>,
    pub role: Role,
    pub content: String,
    /// RFC 3339; ordering is by timestamp, ties broken by id.
    pub timestamp: String,
    pub tags: Vec<String>,
    pub meta: MessageMeta,
}

/// Cheap token estimate: ~4 characters per token, rounded up.
/// Not exact, only monotonic and stable; all budget math is relative.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Cosine similarity; 0.0 when either norm is 0 or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
