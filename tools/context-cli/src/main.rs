use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use context_engine::{AssembleOptions, ContextEngine, EngineConfig};
use context_model::{ChunkMeta, Role, SourceType};
use context_store::chunk_repo::ChunkRepo;
use context_store::message_repo::{MessageRepo, NewMessage};
use embedding_provider::HashingEmbedder;

const DEFAULT_DIR: &str = "target/demo";
const EMBEDDING_DIM: usize = 256;

fn print_usage() {
    eprintln!(
        "Usage:\n\
         context-cli ingest [data_dir] --text TEXT [--source ID] [--type TYPE] [--title T] [--sector S]\n\
         context-cli ingest [data_dir] --stdin [--source ID] [--type TYPE] [--title T] [--sector S]\n\
         context-cli ingest [data_dir] --file PATH [--source ID] [--type TYPE] [--title T] [--sector S]\n\
         context-cli search [data_dir] --query Q [--k N] [--keyword-only]\n\
         context-cli assemble [data_dir] --query Q [--session S] [--workspace W] [--sector S]\n\
                              [--system TEXT] [--specialist TEXT] [--json]\n\
         context-cli message [data_dir] --session S --role ROLE --text TEXT [--workspace W]\n\
         context-cli stats [data_dir]\n\
         \n\
         TYPE is one of: message, document, code, kb_entry (default document)\n\
         ROLE is one of: user, assistant, system\n\
         Notes: data_dir defaults to {DEFAULT_DIR}; stores live at <data_dir>/chunks.db and <data_dir>/messages.db\n"
    );
}

/// Optional leading positional argument selects the data directory.
fn split_data_dir(mut tail: Vec<String>) -> (String, Vec<String>) {
    if !tail.is_empty() && !tail[0].starts_with('-') {
        let dir = tail.remove(0);
        (dir, tail)
    } else {
        (DEFAULT_DIR.to_string(), tail)
    }
}

fn open_engine(data_dir: &str) -> Result<ContextEngine, String> {
    let dir = PathBuf::from(data_dir);
    let cfg = EngineConfig {
        chunks_db_path: dir.join("chunks.db"),
        messages_db_path: dir.join("messages.db"),
        ..EngineConfig::default()
    };
    let embedder =
        HashingEmbedder::new(EMBEDDING_DIM).map_err(|e| format!("embedder init failed: {e}"))?;
    ContextEngine::new(cfg, Arc::new(embedder)).map_err(|e| format!("engine open failed: {e}"))
}

fn truncate_chars(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    match flat.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &flat[..idx]),
        None => flat,
    }
}

fn do_ingest(tail: Vec<String>) -> Result<(), String> {
    let (data_dir, rest) = split_data_dir(tail);

    let mut text: Option<String> = None;
    let mut use_stdin = false;
    let mut file: Option<String> = None;
    let mut source: Option<String> = None;
    let mut source_type = SourceType::Document;
    let mut title: Option<String> = None;
    let mut sector: Option<String> = None;

    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--text" => { if i + 1 < rest.len() { text = Some(rest[i + 1].clone()); i += 2; } else { return Err("--text requires value".into()); } }
            "--stdin" => { use_stdin = true; i += 1; }
            "--file" => { if i + 1 < rest.len() { file = Some(rest[i + 1].clone()); i += 2; } else { return Err("--file requires path".into()); } }
            "--source" => { if i + 1 < rest.len() { source = Some(rest[i + 1].clone()); i += 2; } else { return Err("--source requires value".into()); } }
            "--type" => { if i + 1 < rest.len() { source_type = SourceType::parse(&rest[i + 1]); i += 2; } else { return Err("--type requires value".into()); } }
            "--title" => { if i + 1 < rest.len() { title = Some(rest[i + 1].clone()); i += 2; } else { return Err("--title requires value".into()); } }
            "--sector" => { if i + 1 < rest.len() { sector = Some(rest[i + 1].clone()); i += 2; } else { return Err("--sector requires value".into()); } }
            _ => { i += 1; }
        }
    }

    let input_text = if let Some(t) = text {
        t
    } else if let Some(path) = &file {
        fs::read_to_string(path).map_err(|e| format!("read {path}: {e}"))?
    } else if use_stdin {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).map_err(|e| e.to_string())?;
        buf
    } else {
        return Err("provide --text, --file or --stdin".into());
    };
    if input_text.trim().is_empty() {
        return Err("input text is empty".into());
    }

    let source_id = source
        .or_else(|| file.as_deref().map(str::to_string))
        .unwrap_or_else(|| format!("ingest-{}", chrono_free_stamp()));
    let meta = ChunkMeta {
        title,
        path: file,
        sector_id: sector,
        domain_tags: Vec::new(),
    };

    let engine = open_engine(&data_dir)?;
    let chunks = engine
        .chunk_and_embed(&input_text, &source_id, source_type, meta)
        .map_err(|e| format!("ingest failed: {e}"))?;

    println!("Ingested {} chunk(s) for source {source_id}", chunks.len());
    for c in &chunks {
        println!("  {} ({} tokens, {:?})", c.id, c.token_count, c.content_type);
    }
    Ok(())
}

// Millisecond stamp without pulling chrono into the tool directly.
fn chrono_free_stamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{ms:x}")
}

fn do_search(tail: Vec<String>) -> Result<(), String> {
    let (data_dir, rest) = split_data_dir(tail);

    let mut query: Option<String> = None;
    let mut k: usize = 10;
    let mut keyword_only = false;

    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--query" => { if i + 1 < rest.len() { query = Some(rest[i + 1].clone()); i += 2; } else { return Err("--query requires value".into()); } }
            "--k" => { if i + 1 < rest.len() { k = rest[i + 1].parse().unwrap_or(10); i += 2; } else { return Err("--k requires number".into()); } }
            "--keyword-only" => { keyword_only = true; i += 1; }
            _ => { i += 1; }
        }
    }
    let q = query.ok_or_else(|| String::from("--query required"))?;

    let engine = open_engine(&data_dir)?;
    let filter = context_store::ChunkFilter::default();

    if keyword_only {
        let hits = engine.keyword_search(&q, k, &filter).map_err(|e| e.to_string())?;
        println!("Keyword hits: {}", hits.len());
        for (i, h) in hits.iter().enumerate() {
            let preview = truncate_chars(&h.chunk.content, 60);
            println!("{:>2}. [{}] score={:.4} {}", i + 1, h.chunk.id, h.score, preview);
        }
        return Ok(());
    }

    let hits = engine.hybrid_search(&q, k, &filter).map_err(|e| e.to_string())?;
    println!("Hybrid hits: {}", hits.len());
    for (i, h) in hits.iter().enumerate() {
        let preview = truncate_chars(&h.chunk.content, 60);
        println!(
            "{:>2}. [{}] fused={:.5} rel={:.3} origin={:?} {}",
            i + 1,
            h.chunk.id,
            h.score,
            h.relevance,
            h.origin,
            preview
        );
    }
    Ok(())
}

fn do_assemble(tail: Vec<String>) -> Result<(), String> {
    let (data_dir, rest) = split_data_dir(tail);

    let mut opts = AssembleOptions::default();
    let mut as_json = false;

    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--query" => { if i + 1 < rest.len() { opts.query = rest[i + 1].clone(); i += 2; } else { return Err("--query requires value".into()); } }
            "--session" => { if i + 1 < rest.len() { opts.session_id = rest[i + 1].clone(); i += 2; } else { return Err("--session requires value".into()); } }
            "--workspace" => { if i + 1 < rest.len() { opts.workspace_path = Some(rest[i + 1].clone()); i += 2; } else { return Err("--workspace requires value".into()); } }
            "--sector" => { if i + 1 < rest.len() { opts.sector_id = Some(rest[i + 1].clone()); i += 2; } else { return Err("--sector requires value".into()); } }
            "--system" => { if i + 1 < rest.len() { opts.system_prompt = Some(rest[i + 1].clone()); i += 2; } else { return Err("--system requires value".into()); } }
            "--specialist" => { if i + 1 < rest.len() { opts.specialist_text = Some(rest[i + 1].clone()); i += 2; } else { return Err("--specialist requires value".into()); } }
            "--json" => { as_json = true; i += 1; }
            _ => { i += 1; }
        }
    }
    if opts.query.is_empty() {
        return Err("--query required".into());
    }

    let engine = open_engine(&data_dir)?;
    let ctx = engine.assemble_context(&opts).map_err(|e| e.to_string())?;

    if as_json {
        let out = serde_json::to_string_pretty(&ctx).map_err(|e| e.to_string())?;
        println!("{out}");
        return Ok(());
    }

    println!(
        "Assembled context: {} tokens (system={} specialist={} messages={} chunks={})",
        ctx.total_tokens,
        ctx.breakdown.system,
        ctx.breakdown.specialist,
        ctx.breakdown.messages,
        ctx.breakdown.chunks
    );
    println!("Messages: {}", ctx.messages.len());
    for m in &ctx.messages {
        println!("  [{}] {}: {}", m.timestamp, m.role.as_str(), truncate_chars(&m.content, 60));
    }
    println!("Chunks: {}", ctx.chunks.len());
    for c in &ctx.chunks {
        println!(
            "  [{}] fused={:.5} rel={:.3} {}",
            c.chunk.id,
            c.score,
            c.relevance,
            truncate_chars(&c.chunk.content, 60)
        );
    }
    Ok(())
}

fn do_message(tail: Vec<String>) -> Result<(), String> {
    let (data_dir, rest) = split_data_dir(tail);

    let mut session: Option<String> = None;
    let mut workspace: Option<String> = None;
    let mut role = Role::User;
    let mut text: Option<String> = None;

    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--session" => { if i + 1 < rest.len() { session = Some(rest[i + 1].clone()); i += 2; } else { return Err("--session requires value".into()); } }
            "--workspace" => { if i + 1 < rest.len() { workspace = Some(rest[i + 1].clone()); i += 2; } else { return Err("--workspace requires value".into()); } }
            "--role" => { if i + 1 < rest.len() { role = Role::parse(&rest[i + 1]); i += 2; } else { return Err("--role requires value".into()); } }
            "--text" => { if i + 1 < rest.len() { text = Some(rest[i + 1].clone()); i += 2; } else { return Err("--text requires value".into()); } }
            _ => { i += 1; }
        }
    }
    let session_id = session.ok_or_else(|| String::from("--session required"))?;
    let content = text.ok_or_else(|| String::from("--text required"))?;

    let engine = open_engine(&data_dir)?;
    let msg = NewMessage {
        session_id,
        workspace_path: workspace,
        role,
        content,
        ..NewMessage::default()
    };
    let id = engine.add_message(&msg).map_err(|e| e.to_string())?;
    println!("Stored message {id}");
    Ok(())
}

fn do_stats(tail: Vec<String>) -> Result<(), String> {
    let (data_dir, _rest) = split_data_dir(tail);
    let dir = PathBuf::from(&data_dir);
    let chunks = ChunkRepo::open(dir.join("chunks.db")).map_err(|e| e.to_string())?;
    let (rows, fts_rows) = chunks.counts().map_err(|e| e.to_string())?;
    let messages = MessageRepo::open(dir.join("messages.db")).map_err(|e| e.to_string())?;
    let message_count = messages.count().map_err(|e| e.to_string())?;
    println!("Chunks: {rows} (fts rows: {fts_rows}, fts enabled: {})", chunks.fts_enabled());
    println!("Messages: {message_count}");
    println!("Embedding dimension: {EMBEDDING_DIM}");
    Ok(())
}

fn main() {
    env_logger::init();
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return;
    }
    let cmd = args.remove(0);
    let res = match cmd.as_str() {
        "ingest" => do_ingest(args),
        "search" => do_search(args),
        "assemble" => do_assemble(args),
        "message" => do_message(args),
        "stats" => do_stats(args),
        _ => {
            print_usage();
            return;
        }
    };
    if let Err(err) = res {
        eprintln!("Error: {}", err);
        print_usage();
    }
}
