//! SQL DDL for all Strata tables.
//!
//! Raw capture (`events`, `events_fts`), backlog tracking (`ingest_batches`),
//! semantic anchors (`anchors`, `anchors_fts`, `anchors_vec`), the direct graph
//! backend (`graph_entities`, `graph_edges`, `graph_edges_fts`, `graph_episodes`),
//! crystals, locks, and `schema_meta`. All DDL uses `IF NOT EXISTS`.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
-- Raw capture: append-only, ids are the global order
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user','assistant','system','tool')),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_channel ON events(channel);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
    content,
    content='events',
    content_rowid='id'
);

-- Backlog tracking: claims (completed_at NULL) and completed batches
CREATE TABLE IF NOT EXISTS ingest_batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_id INTEGER NOT NULL,
    end_id INTEGER NOT NULL CHECK(end_id >= start_id),
    holder TEXT NOT NULL,
    channels TEXT,
    claimed_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_batches_end ON ingest_batches(end_id);
CREATE INDEX IF NOT EXISTS idx_batches_completed ON ingest_batches(completed_at);

-- Semantic anchors
CREATE TABLE IF NOT EXISTS anchors (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    source_channel TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS anchors_fts USING fts5(
    title,
    content,
    id UNINDEXED
);

-- Direct knowledge graph backend
CREATE TABLE IF NOT EXISTS graph_entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    name_key TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL DEFAULT 'Entity',
    summary TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS graph_edges (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES graph_entities(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES graph_entities(id) ON DELETE CASCADE,
    relation TEXT NOT NULL,
    fact TEXT NOT NULL DEFAULT '',
    valid_at TEXT,
    invalid_at TEXT,
    episode_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(source_id, relation, target_id, fact)
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON graph_edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON graph_edges(target_id);
CREATE INDEX IF NOT EXISTS idx_edges_relation ON graph_edges(relation);

CREATE VIRTUAL TABLE IF NOT EXISTS graph_edges_fts USING fts5(
    fact,
    relation,
    id UNINDEXED
);

CREATE TABLE IF NOT EXISTS graph_episodes (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL UNIQUE,
    channel TEXT,
    created_at TEXT NOT NULL
);

-- Crystallization chain
CREATE TABLE IF NOT EXISTS crystals (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    summary TEXT NOT NULL,
    span_start INTEGER,
    span_end INTEGER,
    predecessor INTEGER REFERENCES crystals(seq),
    created_at TEXT NOT NULL,
    archived_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_crystals_archived ON crystals(archived_at);

-- Cross-process TTL locks
CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    -- unix millis; the lock is free once this is in the past
    expires_at INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS anchors_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "events",
            "ingest_batches",
            "anchors",
            "graph_entities",
            "graph_edges",
            "graph_episodes",
            "crystals",
            "locks",
            "schema_meta",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }

        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
    }

    #[test]
    fn role_check_rejects_unknown_roles() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO events (channel, role, content, created_at) VALUES ('c', 'robot', 'x', 't')",
            [],
        );
        assert!(result.is_err());
    }
}
