use context_model::{ChunkMeta, ContentType, EmbeddedChunk, Role, SourceType};
use context_store::chunk_repo::ChunkRepo;
use context_store::message_repo::{MessageRepo, NewMessage};
use context_store::ChunkFilter;

fn chunk(source_id: &str, index: u32, content: &str, embedding: Vec<f32>) -> EmbeddedChunk {
    EmbeddedChunk {
        id: EmbeddedChunk::chunk_id(source_id, index),
        source_id: source_id.to_string(),
        source_type: SourceType::Document,
        content: content.to_string(),
        content_type: ContentType::Prose,
        embedding,
        keywords: vec!["kw".to_string()],
        chunk_index: index,
        token_count: content.len().div_ceil(4),
        meta: ChunkMeta::default(),
        created_at: format!("2026-01-0{}T00:00:00+00:00", (index % 9) + 1),
    }
}

fn message(session: &str, content: &str, timestamp: &str) -> NewMessage {
    NewMessage {
        session_id: session.to_string(),
        workspace_path: Some("/ws".to_string()),
        role: Role::User,
        content: content.to_string(),
        timestamp: Some(timestamp.to_string()),
        ..NewMessage::default()
    }
}

#[test]
fn upsert_is_idempotent_by_chunk_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();

    let c = chunk("doc", 0, "alpha beta", vec![1.0, 0.0]);
    repo.upsert_chunk(&c).unwrap();
    repo.upsert_chunk(&c).unwrap();
    assert_eq!(repo.count().unwrap(), 1);

    // Re-upserting with new content replaces, never duplicates.
    let mut updated = c.clone();
    updated.content = "alpha beta gamma".to_string();
    repo.upsert_chunk(&updated).unwrap();
    assert_eq!(repo.count().unwrap(), 1);
    let got = repo.get_chunk("doc#0").unwrap().unwrap();
    assert_eq!(got.content, "alpha beta gamma");
}

#[test]
fn chunks_for_source_ordered_by_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();

    repo.upsert_chunk(&chunk("doc", 2, "third", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("doc", 0, "first", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("doc", 1, "second", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("other", 0, "elsewhere", vec![1.0])).unwrap();

    let got = repo.get_chunks_for_source("doc").unwrap();
    let contents: Vec<&str> = got.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
}

#[test]
fn embedding_round_trips_through_storage() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();

    let c = chunk("doc", 0, "text", vec![0.25, -1.5, 3.0]);
    repo.upsert_chunk(&c).unwrap();
    let got = repo.get_chunk("doc#0").unwrap().unwrap();
    assert_eq!(got.embedding, vec![0.25, -1.5, 3.0]);
}

#[test]
fn vector_search_ranks_by_cosine() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();

    repo.upsert_chunk(&chunk("a", 0, "aligned", vec![1.0, 0.0])).unwrap();
    repo.upsert_chunk(&chunk("b", 0, "diagonal", vec![0.7, 0.7])).unwrap();
    repo.upsert_chunk(&chunk("c", 0, "orthogonal", vec![0.0, 1.0])).unwrap();

    let hits = repo.vector_search(&[1.0, 0.0], 2, &ChunkFilter::default()).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk.id, "a#0");
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert_eq!(hits[1].chunk.id, "b#0");
}

#[test]
fn vector_search_honors_filters() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();

    let mut kb = chunk("kb", 0, "knowledge", vec![1.0, 0.0]);
    kb.source_type = SourceType::KbEntry;
    repo.upsert_chunk(&kb).unwrap();
    repo.upsert_chunk(&chunk("doc", 0, "document", vec![1.0, 0.0])).unwrap();

    let filter = ChunkFilter { source_types: vec![SourceType::KbEntry], ..ChunkFilter::default() };
    let hits = repo.vector_search(&[1.0, 0.0], 10, &filter).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.id, "kb#0");

    let filter =
        ChunkFilter { exclude_ids: vec!["doc#0".to_string()], ..ChunkFilter::default() };
    let hits = repo.vector_search(&[1.0, 0.0], 10, &filter).unwrap();
    assert!(hits.iter().all(|h| h.chunk.id != "doc#0"));
}

#[test]
fn keyword_search_finds_matching_content() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();
    assert!(repo.fts_enabled());

    repo.upsert_chunk(&chunk("a", 0, "the retry loop backs off exponentially", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("b", 0, "unrelated cooking recipe", vec![1.0])).unwrap();

    let hits = repo.keyword_search("retry", 10, &ChunkFilter::default()).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.id, "a#0");
    assert!(hits[0].score >= 0.0);
}

#[test]
fn keyword_search_combines_fts_with_prefilter() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();
    assert!(repo.fts_enabled());

    let mut kb = chunk("kb", 0, "a needle for the knowledge base", vec![1.0]);
    kb.source_type = SourceType::KbEntry;
    repo.upsert_chunk(&kb).unwrap();
    repo.upsert_chunk(&chunk("doc", 0, "a needle for the document pile", vec![1.0])).unwrap();

    let filter = ChunkFilter { source_types: vec![SourceType::KbEntry], ..ChunkFilter::default() };
    let hits = repo.keyword_search("needle", 10, &filter).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.id, "kb#0");
}

#[test]
fn keyword_fallback_scores_uniformly() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open_without_fts(dir.path().join("chunks.db")).unwrap();
    assert!(!repo.fts_enabled());

    repo.upsert_chunk(&chunk("a", 0, "a needle in this haystack", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("b", 0, "another needle here", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("c", 0, "nothing relevant", vec![1.0])).unwrap();

    let hits = repo.keyword_search("needle", 10, &ChunkFilter::default()).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| (h.score - 1.0).abs() < 1e-6));
}

#[test]
fn recent_chunks_returns_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();

    repo.upsert_chunk(&chunk("doc", 0, "old", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("doc", 3, "newer", vec![1.0])).unwrap();

    let recent = repo.recent_chunks(10).unwrap();
    assert_eq!(recent[0].content, "newer");
    assert_eq!(recent[1].content, "old");
}

#[test]
fn delete_source_removes_all_its_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = ChunkRepo::open(dir.path().join("chunks.db")).unwrap();

    repo.upsert_chunk(&chunk("doc", 0, "one", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("doc", 1, "two", vec![1.0])).unwrap();
    repo.upsert_chunk(&chunk("other", 0, "keep", vec![1.0])).unwrap();

    assert_eq!(repo.delete_source("doc").unwrap(), 2);
    assert_eq!(repo.count().unwrap(), 1);
    assert!(repo.get_chunk("doc#0").unwrap().is_none());
    assert!(repo.get_chunk("other#0").unwrap().is_some());
}

#[test]
fn session_messages_ascend_regardless_of_insert_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = MessageRepo::open(dir.path().join("messages.db")).unwrap();

    repo.add_message(&message("s1", "second", "2026-02-01T10:00:00+00:00")).unwrap();
    repo.add_message(&message("s1", "third", "2026-02-01T11:00:00+00:00")).unwrap();
    repo.add_message(&message("s1", "first", "2026-02-01T09:00:00+00:00")).unwrap();
    repo.add_message(&message("s2", "elsewhere", "2026-02-01T09:30:00+00:00")).unwrap();

    let got = repo.session_messages("s1", 10).unwrap();
    let contents: Vec<&str> = got.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);

    // Limit keeps the most recent window, still oldest-first.
    let got = repo.session_messages("s1", 2).unwrap();
    let contents: Vec<&str> = got.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["second", "third"]);
}

#[test]
fn recent_messages_scope_to_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = MessageRepo::open(dir.path().join("messages.db")).unwrap();

    repo.add_message(&message("s1", "in workspace", "2026-02-01T10:00:00+00:00")).unwrap();
    let mut other = message("s2", "other workspace", "2026-02-01T11:00:00+00:00");
    other.workspace_path = Some("/elsewhere".to_string());
    repo.add_message(&other).unwrap();

    let got = repo.recent_messages("/ws", 10).unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].content, "in workspace");
}

#[test]
fn message_search_ranks_full_text_matches() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = MessageRepo::open(dir.path().join("messages.db")).unwrap();
    assert!(repo.fts_enabled());

    repo.add_message(&message("s1", "needle needle needle", "2026-02-01T10:00:00+00:00")).unwrap();
    repo.add_message(&message(
        "s1",
        "one needle buried in a much longer message about unrelated matters",
        "2026-02-01T11:00:00+00:00",
    ))
    .unwrap();
    repo.add_message(&message("s1", "nothing to see", "2026-02-01T12:00:00+00:00")).unwrap();

    let hits = repo.search_messages("needle", 10).unwrap();
    assert_eq!(hits.len(), 2);
    // Denser match ranks first under bm25.
    assert_eq!(hits[0].message.content, "needle needle needle");
    assert!(hits[0].score >= hits[1].score);
    assert!(hits.iter().all(|h| h.score > 0.0));
}

#[test]
fn in_memory_repos_support_search_and_counts() {
    let mut chunks = ChunkRepo::in_memory().unwrap();
    assert!(chunks.fts_enabled());
    chunks.upsert_chunk(&chunk("doc", 0, "needle content", vec![1.0])).unwrap();
    let (rows, fts_rows) = chunks.counts().unwrap();
    assert_eq!(rows, 1);
    assert_eq!(fts_rows, 1);
    let hits = chunks.keyword_search("needle", 10, &ChunkFilter::default()).unwrap();
    assert_eq!(hits.len(), 1);

    let mut messages = MessageRepo::in_memory().unwrap();
    messages.add_message(&message("s1", "hello there", "2026-02-01T10:00:00+00:00")).unwrap();
    assert_eq!(messages.count().unwrap(), 1);
    assert_eq!(messages.search_messages("hello", 10).unwrap().len(), 1);
}

#[test]
fn message_search_fallback_returns_substring_matches() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = MessageRepo::open_without_fts(dir.path().join("messages.db")).unwrap();
    assert!(!repo.fts_enabled());

    repo.add_message(&message("s1", "found a needle here", "2026-02-01T10:00:00+00:00")).unwrap();
    repo.add_message(&message("s1", "needle again", "2026-02-01T11:00:00+00:00")).unwrap();
    repo.add_message(&message("s1", "nothing to see", "2026-02-01T12:00:00+00:00")).unwrap();

    let hits = repo.search_messages("needle", 10).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| (h.score - 1.0).abs() < 1e-6));
    assert!(hits.iter().all(|h| h.message.content.contains("needle")));
}

#[test]
fn purge_drops_only_old_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = MessageRepo::open(dir.path().join("messages.db")).unwrap();

    repo.add_message(&message("s1", "ancient", "2020-01-01T00:00:00+00:00")).unwrap();
    let now = chrono::Utc::now().to_rfc3339();
    repo.add_message(&message("s1", "fresh", &now)).unwrap();

    let purged = repo.delete_older_than(30).unwrap();
    assert_eq!(purged, 1);
    let left = repo.session_messages("s1", 10).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].content, "fresh");
}

#[test]
fn delete_session_leaves_other_sessions_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut repo = MessageRepo::open(dir.path().join("messages.db")).unwrap();

    repo.add_message(&message("s1", "one", "2026-02-01T10:00:00+00:00")).unwrap();
    repo.add_message(&message("s1", "two", "2026-02-01T11:00:00+00:00")).unwrap();
    repo.add_message(&message("s2", "keep", "2026-02-01T12:00:00+00:00")).unwrap();

    assert_eq!(repo.delete_session("s1").unwrap(), 2);
    assert_eq!(repo.count().unwrap(), 1);
}
