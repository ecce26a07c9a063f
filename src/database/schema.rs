// Database schema initialization and table creation.

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

/// Create tables, indexes, the decompressing view, and (when FTS5 is
/// available) the `files_fts` virtual table with its sync triggers.
pub fn initialize_schema(conn: &Connection, fts_enabled: bool) -> Result<()> {
    debug!("Creating database schema");

    create_roots_table(conn)?;
    create_files_table(conn)?;
    create_symbols_table(conn)?;
    create_relations_table(conn)?;
    create_failed_tasks_table(conn)?;
    create_repo_meta_table(conn)?;
    create_snippets_tables(conn)?;
    create_contexts_table(conn)?;
    create_files_view(conn)?;
    if fts_enabled {
        create_files_fts(conn)?;
        create_files_fts_triggers(conn)?;
    }

    debug!("Database schema created successfully");
    Ok(())
}

fn create_roots_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS roots (
            root_id TEXT PRIMARY KEY,
            abs_path TEXT NOT NULL,
            label TEXT NOT NULL DEFAULT '',
            created_ts INTEGER NOT NULL DEFAULT 0,
            updated_ts INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_roots_abs_path ON roots(abs_path);",
    )?;
    Ok(())
}

fn create_files_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            root_id TEXT NOT NULL DEFAULT '',
            rel_path TEXT NOT NULL DEFAULT '',
            repo TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL,
            content BLOB NOT NULL,
            content_hash TEXT NOT NULL DEFAULT '',
            content_bytes INTEGER NOT NULL DEFAULT 0,
            fts_content TEXT NOT NULL DEFAULT '',
            last_seen INTEGER NOT NULL DEFAULT 0,
            deleted_ts INTEGER NOT NULL DEFAULT 0,
            parse_status TEXT NOT NULL DEFAULT 'none',
            parse_reason TEXT NOT NULL DEFAULT 'none',
            ast_status TEXT NOT NULL DEFAULT 'none',
            ast_reason TEXT NOT NULL DEFAULT 'none',
            is_binary INTEGER NOT NULL DEFAULT 0,
            is_minified INTEGER NOT NULL DEFAULT 0,
            sampled INTEGER NOT NULL DEFAULT 0,
            updated_ts INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_files_repo ON files(repo);
        CREATE INDEX IF NOT EXISTS idx_files_mtime ON files(mtime DESC);
        CREATE INDEX IF NOT EXISTS idx_files_last_seen ON files(last_seen);
        CREATE INDEX IF NOT EXISTS idx_files_root ON files(root_id);",
    )?;
    debug!("Created files table and indexes");
    Ok(())
}

fn create_symbols_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS symbols (
            symbol_id TEXT NOT NULL,
            path TEXT NOT NULL,
            root_id TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL,
            qualname TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL,
            line INTEGER NOT NULL,
            end_line INTEGER NOT NULL DEFAULT 0,
            content TEXT NOT NULL DEFAULT '',
            parent_name TEXT NOT NULL DEFAULT '',
            metadata TEXT NOT NULL DEFAULT '{}',
            docstring TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_symbols_path ON symbols(path);
        CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
        CREATE INDEX IF NOT EXISTS idx_symbols_qualname ON symbols(qualname);
        CREATE INDEX IF NOT EXISTS idx_symbols_id ON symbols(symbol_id);",
    )?;
    debug!("Created symbols table and indexes");
    Ok(())
}

fn create_relations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS symbol_relations (
            from_path TEXT NOT NULL,
            from_symbol TEXT NOT NULL,
            from_symbol_id TEXT NOT NULL DEFAULT '',
            to_path TEXT NOT NULL,
            to_symbol TEXT NOT NULL,
            to_symbol_id TEXT NOT NULL DEFAULT '',
            rel_type TEXT NOT NULL,
            line INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_relations_from ON symbol_relations(from_symbol);
        CREATE INDEX IF NOT EXISTS idx_relations_to ON symbol_relations(to_symbol);
        CREATE INDEX IF NOT EXISTS idx_relations_from_id ON symbol_relations(from_symbol_id);
        CREATE INDEX IF NOT EXISTS idx_relations_to_id ON symbol_relations(to_symbol_id);",
    )?;
    Ok(())
}

fn create_failed_tasks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS failed_tasks (
            task_kind TEXT NOT NULL,
            path TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error_code TEXT NOT NULL DEFAULT '',
            last_error_message TEXT NOT NULL DEFAULT '',
            next_retry_ts INTEGER NOT NULL DEFAULT 0,
            updated_ts INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (task_kind, path)
        );
        CREATE INDEX IF NOT EXISTS idx_failed_retry ON failed_tasks(next_retry_ts);",
    )?;
    Ok(())
}

fn create_repo_meta_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS repo_meta (
            repo_name TEXT PRIMARY KEY,
            tags TEXT NOT NULL DEFAULT '',
            domain TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

fn create_snippets_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS snippets (
            id TEXT PRIMARY KEY,
            tag TEXT NOT NULL UNIQUE,
            path TEXT NOT NULL DEFAULT '',
            start_line INTEGER NOT NULL DEFAULT 0,
            end_line INTEGER NOT NULL DEFAULT 0,
            content TEXT NOT NULL DEFAULT '',
            created_ts INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS snippet_versions (
            snippet_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            created_ts INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (snippet_id, version)
        );",
    )?;
    Ok(())
}

fn create_contexts_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS contexts (
            id TEXT PRIMARY KEY,
            tag TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            valid_from INTEGER NOT NULL DEFAULT 0,
            valid_until INTEGER NOT NULL DEFAULT 0,
            created_ts INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_contexts_tag ON contexts(tag);",
    )?;
    Ok(())
}

fn create_files_view(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIEW IF NOT EXISTS files_view AS
         SELECT rowid, path, repo, deckard_decompress(content) AS content
         FROM files;",
    )?;
    Ok(())
}

fn create_files_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS files_fts
         USING fts5(path, repo, content, content='files_view', content_rowid='rowid');",
    )?;
    debug!("Created files_fts virtual table");
    Ok(())
}

/// Triggers are the sole sync mechanism for the SQLite engine; the
/// embedded engine is fed explicitly by the writer's post-commit hook.
fn create_files_fts_triggers(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS files_ai;
         DROP TRIGGER IF EXISTS files_ad;
         DROP TRIGGER IF EXISTS files_au;

         CREATE TRIGGER files_ai AFTER INSERT ON files BEGIN
           INSERT INTO files_fts(rowid, path, repo, content)
           VALUES (new.rowid, new.path, new.repo, deckard_decompress(new.content));
         END;

         CREATE TRIGGER files_ad AFTER DELETE ON files BEGIN
           INSERT INTO files_fts(files_fts, rowid, path, repo, content)
           VALUES ('delete', old.rowid, old.path, old.repo, deckard_decompress(old.content));
         END;

         CREATE TRIGGER files_au AFTER UPDATE ON files BEGIN
           INSERT INTO files_fts(files_fts, rowid, path, repo, content)
           VALUES ('delete', old.rowid, old.path, old.repo, deckard_decompress(old.content));
           INSERT INTO files_fts(rowid, path, repo, content)
           VALUES (new.rowid, new.path, new.repo, deckard_decompress(new.content));
         END;",
    )?;
    debug!("Created FTS5 synchronization triggers");
    Ok(())
}
